//! DynamoDB KeyValueStore implementation.
//!
//! Conditional-check failures map to [`WriteOutcome::ConditionFailed`];
//! every other SDK error becomes [`StoreError::Backend`]. Updates request
//! `ALL_NEW` and deletes `ALL_OLD` so callers always see full items.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeValue as DynamoValue, ConsumedCapacity, ReturnConsumedCapacity, ReturnValue,
};
use aws_sdk_dynamodb::Client;
use base64::prelude::*;
use tracing::{debug, info};

use super::expression::ExpressionBuilder;
use super::{
    AttributeValue, Attributes, DeleteRequest, GetOutput, GetRequest, KeyValueStore, PutRequest,
    QueryOutput, QueryRequest, Result, StoreError, UpdateRequest, WriteOutcome, WriteOutput,
};

/// DynamoDB implementation of KeyValueStore.
pub struct DynamoStore {
    client: Client,
    table_name: String,
}

impl DynamoStore {
    /// Create a new DynamoDB store for one table.
    pub async fn new(
        table_name: impl Into<String>,
        region: Option<&str>,
        endpoint_url: Option<&str>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        let client = if let Some(endpoint) = endpoint_url {
            let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(dynamo_config)
        } else {
            Client::new(&config)
        };

        let table_name = table_name.into();
        info!(table = %table_name, endpoint = ?endpoint_url, "Connected to DynamoDB");

        Ok(Self { client, table_name })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

fn to_dynamo(value: &AttributeValue) -> DynamoValue {
    match value {
        AttributeValue::S(s) => DynamoValue::S(s.clone()),
        AttributeValue::N(n) => DynamoValue::N(n.clone()),
        AttributeValue::Bool(b) => DynamoValue::Bool(*b),
        AttributeValue::Null => DynamoValue::Null(true),
        AttributeValue::L(items) => DynamoValue::L(items.iter().map(to_dynamo).collect()),
        AttributeValue::M(attrs) => DynamoValue::M(to_dynamo_map(attrs)),
    }
}

fn to_dynamo_map(attributes: &Attributes) -> HashMap<String, DynamoValue> {
    attributes
        .iter()
        .map(|(name, value)| (name.clone(), to_dynamo(value)))
        .collect()
}

fn from_dynamo(value: &DynamoValue) -> Result<AttributeValue> {
    Ok(match value {
        DynamoValue::S(s) => AttributeValue::S(s.clone()),
        DynamoValue::N(n) => AttributeValue::N(n.clone()),
        DynamoValue::Bool(b) => AttributeValue::Bool(*b),
        DynamoValue::Null(_) => AttributeValue::Null,
        DynamoValue::B(blob) => AttributeValue::S(encode_blob(blob)),
        DynamoValue::Ss(items) => {
            AttributeValue::L(items.iter().cloned().map(AttributeValue::S).collect())
        }
        DynamoValue::Ns(items) => {
            AttributeValue::L(items.iter().cloned().map(AttributeValue::N).collect())
        }
        DynamoValue::Bs(items) => {
            AttributeValue::L(items.iter().map(|b| AttributeValue::S(encode_blob(b))).collect())
        }
        DynamoValue::L(items) => {
            AttributeValue::L(items.iter().map(from_dynamo).collect::<Result<Vec<_>>>()?)
        }
        DynamoValue::M(map) => AttributeValue::M(from_dynamo_map(map)?),
        other => {
            return Err(StoreError::Backend(format!(
                "unsupported DynamoDB attribute value: {:?}",
                other
            )))
        }
    })
}

fn encode_blob(blob: &Blob) -> String {
    BASE64_STANDARD.encode(blob.as_ref())
}

fn from_dynamo_map(map: &HashMap<String, DynamoValue>) -> Result<Attributes> {
    map.iter()
        .map(|(name, value)| Ok((name.clone(), from_dynamo(value)?)))
        .collect()
}

fn capacity(consumed: Option<&ConsumedCapacity>) -> Option<f64> {
    consumed.and_then(|c| c.capacity_units())
}

fn values_to_dynamo(
    values: Option<HashMap<String, AttributeValue>>,
) -> Option<HashMap<String, DynamoValue>> {
    values.map(|values| {
        values
            .iter()
            .map(|(placeholder, value)| (placeholder.clone(), to_dynamo(value)))
            .collect()
    })
}

#[async_trait]
impl KeyValueStore for DynamoStore {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn get(&self, request: GetRequest) -> Result<GetOutput> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(to_dynamo_map(&request.key)))
            .consistent_read(request.consistent)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(|e| {
                StoreError::Backend(format!("DynamoDB get_item failed: {}", e.into_service_error()))
            })?;

        let item = output.item.as_ref().map(from_dynamo_map).transpose()?;
        Ok(GetOutput {
            item,
            consumed_capacity: capacity(output.consumed_capacity()),
        })
    }

    async fn put(&self, request: PutRequest) -> Result<WriteOutcome> {
        let mut builder = ExpressionBuilder::new();
        let condition = builder.condition(&request.conditions);
        let (names, values) = builder.into_bindings();

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_dynamo_map(&request.item)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values_to_dynamo(values))
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await;

        match result {
            Ok(output) => Ok(WriteOutcome::Applied(WriteOutput {
                attributes: None,
                consumed_capacity: capacity(output.consumed_capacity()),
            })),
            Err(e) => {
                let error = e.into_service_error();
                if error.is_conditional_check_failed_exception() {
                    debug!(table = %self.table_name, "put_item condition failed");
                    Ok(WriteOutcome::ConditionFailed)
                } else {
                    Err(StoreError::Backend(format!("DynamoDB put_item failed: {}", error)))
                }
            }
        }
    }

    async fn update(&self, request: UpdateRequest) -> Result<WriteOutcome> {
        let mut builder = ExpressionBuilder::new();
        let update = builder.update(&request.set, &request.set_if_absent, &request.increment);
        let condition = builder.condition(&request.conditions);
        let (names, values) = builder.into_bindings();

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(to_dynamo_map(&request.key)))
            .update_expression(update)
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values_to_dynamo(values))
            .return_values(ReturnValue::AllNew)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await;

        match result {
            Ok(output) => Ok(WriteOutcome::Applied(WriteOutput {
                attributes: output.attributes.as_ref().map(from_dynamo_map).transpose()?,
                consumed_capacity: capacity(output.consumed_capacity()),
            })),
            Err(e) => {
                let error = e.into_service_error();
                if error.is_conditional_check_failed_exception() {
                    debug!(table = %self.table_name, "update_item condition failed");
                    Ok(WriteOutcome::ConditionFailed)
                } else {
                    Err(StoreError::Backend(format!("DynamoDB update_item failed: {}", error)))
                }
            }
        }
    }

    async fn delete(&self, request: DeleteRequest) -> Result<WriteOutcome> {
        let mut builder = ExpressionBuilder::new();
        let condition = builder.condition(&request.conditions);
        let (names, values) = builder.into_bindings();

        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(to_dynamo_map(&request.key)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values_to_dynamo(values))
            .return_values(ReturnValue::AllOld)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await;

        match result {
            Ok(output) => Ok(WriteOutcome::Applied(WriteOutput {
                attributes: output.attributes.as_ref().map(from_dynamo_map).transpose()?,
                consumed_capacity: capacity(output.consumed_capacity()),
            })),
            Err(e) => {
                let error = e.into_service_error();
                if error.is_conditional_check_failed_exception() {
                    debug!(table = %self.table_name, "delete_item condition failed");
                    Ok(WriteOutcome::ConditionFailed)
                } else {
                    Err(StoreError::Backend(format!("DynamoDB delete_item failed: {}", error)))
                }
            }
        }
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryOutput> {
        let mut builder = ExpressionBuilder::new();
        let key_condition = builder.key_condition(&request);
        let (names, values) = builder.into_bindings();

        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .set_index_name(request.index_name.clone())
            .key_condition_expression(key_condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values_to_dynamo(values))
            .scan_index_forward(request.scan_forward)
            .consistent_read(request.consistent)
            .set_limit(request.limit.map(|l| l as i32))
            .set_exclusive_start_key(request.exclusive_start_key.as_ref().map(to_dynamo_map))
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(|e| {
                StoreError::Backend(format!("DynamoDB query failed: {}", e.into_service_error()))
            })?;

        let items = output
            .items()
            .iter()
            .map(from_dynamo_map)
            .collect::<Result<Vec<_>>>()?;
        let last_evaluated_key = output
            .last_evaluated_key
            .as_ref()
            .map(from_dynamo_map)
            .transpose()?;

        Ok(QueryOutput {
            items,
            last_evaluated_key,
            consumed_capacity: capacity(output.consumed_capacity()),
        })
    }
}
