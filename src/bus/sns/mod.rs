//! Amazon SNS event bus.
//!
//! Publishes every event to one topic as its JSON encoding, with `source`
//! and `detail-type` as message attributes so subscriptions can filter
//! without parsing the body. Subscribing is done with SNS subscription
//! filter policies, outside this process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sns::Client as SnsClient;
use tracing::{debug, info};

use super::{BusError, BusEvent, EventBus, EventHandler, Result, SnsConfig};

/// Message attribute carrying the event source.
const SOURCE_ATTR: &str = "source";

/// Message attribute carrying the event detail-type.
const DETAIL_TYPE_ATTR: &str = "detail-type";

/// SNS-backed event bus.
pub struct SnsEventBus {
    sns: SnsClient,
    topic_arn: String,
}

impl SnsEventBus {
    /// Create a new SNS event bus.
    pub async fn new(config: &SnsConfig) -> Result<Self> {
        let topic_arn = config
            .topic_arn
            .clone()
            .ok_or_else(|| BusError::Connection("messaging.sns.topic_arn is required".to_string()))?;

        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            topic_arn = %topic_arn,
            "Connected to AWS SNS"
        );

        Ok(Self {
            sns: SnsClient::new(&aws_config),
            topic_arn,
        })
    }

    /// Create from an existing client.
    pub fn from_client(sns: SnsClient, topic_arn: impl Into<String>) -> Self {
        Self {
            sns,
            topic_arn: topic_arn.into(),
        }
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| BusError::Publish(format!("Failed to build attribute: {}", e)))
}

#[async_trait]
impl EventBus for SnsEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(source = %event.source))]
    async fn publish(&self, event: Arc<BusEvent>) -> Result<()> {
        let message = serde_json::to_string(event.as_ref())?;

        let mut attrs = HashMap::new();
        attrs.insert(SOURCE_ATTR.to_string(), string_attribute(&event.source)?);
        attrs.insert(
            DETAIL_TYPE_ATTR.to_string(),
            string_attribute(&event.detail_type)?,
        );

        self.sns
            .publish()
            .topic_arn(&self.topic_arn)
            .message(message)
            .set_message_attributes(Some(attrs))
            .send()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish to SNS: {}", e)))?;

        debug!(
            source = %event.source,
            detail_type = %event.detail_type,
            topic_arn = %self.topic_arn,
            "Published event to SNS"
        );

        Ok(())
    }

    async fn subscribe(&self, _handler: Box<dyn EventHandler>) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }
}
