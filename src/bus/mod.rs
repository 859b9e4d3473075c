//! Event bus for change events.
//!
//! This module contains:
//! - `BusEvent`: one republished table mutation
//! - `EventBus` trait: event delivery to projectors
//! - `EventHandler` trait: for processing events
//! - `EventPattern`: source/detail-type filter for subscribers
//! - Bus configuration types
//! - Implementations: Log, Channel, Mock, SNS (`sns` feature)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub mod channel;
mod dispatch;
pub mod log;
pub mod mock;
#[cfg(feature = "sns")]
pub mod sns;

pub use channel::ChannelEventBus;
pub use dispatch::dispatch_to_handlers;
pub use log::LogEventBus;
pub use mock::MockEventBus;
#[cfg(feature = "sns")]
pub use sns::SnsEventBus;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler '{name}' failed: {message}")]
    HandlerFailed { name: String, message: String },

    #[error("Subscribe not supported for this bus type")]
    SubscribeNotSupported,
}

/// A table mutation as delivered on the bus.
///
/// Consumers route on `source` (`{table}.{typeTag}`) and `detail_type`
/// (`INSERT`, `MODIFY` or `REMOVE`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusEvent {
    pub source: String,
    pub detail_type: String,
    /// The full normalized change record.
    pub detail: Value,
    /// The originating stream identifier.
    pub resources: Vec<String>,
    pub time: DateTime<Utc>,
}

/// Handler for processing events from the bus.
pub trait EventHandler: Send + Sync {
    /// Process one event.
    fn handle(&self, event: Arc<BusEvent>)
        -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

/// Interface for event delivery to projectors.
///
/// Implementations:
/// - `LogEventBus`: logs each event, no delivery
/// - `ChannelEventBus`: in-process tokio broadcast
/// - `MockEventBus`: records events for testing
/// - `SnsEventBus`: Amazon SNS
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one event.
    ///
    /// The event is wrapped in Arc so every consumer shares the same
    /// immutable data.
    async fn publish(&self, event: Arc<BusEvent>) -> Result<()>;

    /// Register a handler for events received by this bus.
    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()>;

    /// Start delivering to subscribed handlers.
    async fn start_consuming(&self) -> Result<()> {
        Ok(())
    }
}

/// Subscriber-side event filter.
///
/// An empty pattern matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventPattern {
    /// Exact `source` values to accept.
    pub sources: Vec<String>,
    /// Exact `detail_type` values to accept.
    pub detail_types: Vec<String>,
}

impl EventPattern {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn detail_type(mut self, detail_type: impl Into<String>) -> Self {
        self.detail_types.push(detail_type.into());
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        (self.sources.is_empty() || self.sources.iter().any(|s| *s == event.source))
            && (self.detail_types.is_empty()
                || self.detail_types.iter().any(|d| *d == event.detail_type))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// Log events only.
    #[default]
    Log,
    /// In-process broadcast channel.
    Channel,
    /// Amazon SNS.
    Sns,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// SNS-specific configuration.
    pub sns: SnsConfig,
}

/// SNS-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnsConfig {
    /// Topic every event is published to.
    pub topic_arn: Option<String>,
    /// AWS region. Uses the default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize event bus based on configuration.
///
/// SNS requires the `sns` feature.
pub async fn init_event_bus(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn EventBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Log => {
            info!(messaging_type = "log", "Event bus initialized");
            Ok(Arc::new(LogEventBus::new()))
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Event bus initialized");
            Ok(Arc::new(ChannelEventBus::publisher()))
        }
        MessagingType::Sns => {
            #[cfg(feature = "sns")]
            {
                let bus = SnsEventBus::new(&config.sns).await?;
                info!(messaging_type = "sns", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "sns"))]
            {
                Err("SNS support requires the 'sns' feature. Rebuild with --features sns".into())
            }
        }
    }
}
