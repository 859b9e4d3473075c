//! Key-value store protocol.
//!
//! This module contains:
//! - `KeyValueStore` trait: conditional put/update/delete, get, and
//!   key-condition queries against a single table
//! - Request/response types shared by every backend
//! - Implementations: in-memory (always available), DynamoDB (`dynamo` feature)
//!
//! Conditional writes report a failed condition as
//! [`WriteOutcome::ConditionFailed`] rather than as an error, so callers
//! branch on it explicitly.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageConfig, StorageType};

pub mod attribute;
pub mod expression;
pub mod memory;

#[cfg(feature = "dynamo")]
pub mod dynamo;

pub use attribute::{AttributeValue, Attributes};
pub use memory::MemoryStore;

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Names of the table's primary key attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub partition_key: String,
    pub sort_key: Option<String>,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            partition_key: "pk".to_string(),
            sort_key: Some("sk".to_string()),
        }
    }
}

impl TableSchema {
    /// Extract the primary key attributes of an item.
    pub fn key_of(&self, item: &Attributes) -> Option<Attributes> {
        let mut key = Attributes::new();
        key.insert(
            self.partition_key.clone(),
            item.get(&self.partition_key)?.clone(),
        );
        if let Some(sort_key) = &self.sort_key {
            key.insert(sort_key.clone(), item.get(sort_key)?.clone());
        }
        Some(key)
    }
}

/// A single condition on the current state of an item.
///
/// Multiple conditions on one request are combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AttributeExists(String),
    AttributeNotExists(String),
    Equals(String, AttributeValue),
}

impl Condition {
    /// Evaluate against the current item (absent items have no attributes).
    pub fn holds(&self, current: Option<&Attributes>) -> bool {
        match self {
            Self::AttributeExists(name) => current.is_some_and(|item| item.contains_key(name)),
            Self::AttributeNotExists(name) => !current.is_some_and(|item| item.contains_key(name)),
            Self::Equals(name, expected) => current.and_then(|item| item.get(name)) == Some(expected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub key: Attributes,
    pub consistent: bool,
}

/// Whole-item write. An empty condition list is a blind overwrite.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub item: Attributes,
    pub conditions: Vec<Condition>,
}

/// Attribute-level write returning the item as it is after the write.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub key: Attributes,
    pub set: Attributes,
    /// Attributes written only when the item does not have them yet.
    pub set_if_absent: Attributes,
    /// Numeric attributes to add to (absent attributes count as zero).
    pub increment: Vec<(String, i64)>,
    pub conditions: Vec<Condition>,
}

/// Delete returning the item as it was before the delete.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub key: Attributes,
    pub conditions: Vec<Condition>,
}

/// Sort key restriction for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SortCondition {
    Equals(AttributeValue),
    BeginsWith(String),
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Secondary index to query, or `None` for the table itself.
    pub index_name: Option<String>,
    pub partition_attribute: String,
    pub partition_value: AttributeValue,
    pub sort_attribute: Option<String>,
    pub sort_condition: Option<SortCondition>,
    pub scan_forward: bool,
    pub limit: Option<u32>,
    /// The previous page's `last_evaluated_key`, passed back unchanged.
    pub exclusive_start_key: Option<Attributes>,
    pub consistent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetOutput {
    pub item: Option<Attributes>,
    pub consumed_capacity: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOutput {
    /// New image for updates, old image for deletes, `None` for puts.
    pub attributes: Option<Attributes>,
    pub consumed_capacity: Option<f64>,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Applied(WriteOutput),
    ConditionFailed,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub items: Vec<Attributes>,
    pub last_evaluated_key: Option<Attributes>,
    pub consumed_capacity: Option<f64>,
}

/// Interface to a single key-value table.
///
/// Implementations:
/// - `MemoryStore`: in-process table with an emulated change log
/// - `DynamoStore`: Amazon DynamoDB
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Name of the table this store addresses.
    fn table_name(&self) -> &str;

    async fn get(&self, request: GetRequest) -> Result<GetOutput>;

    async fn put(&self, request: PutRequest) -> Result<WriteOutcome>;

    /// Apply `set`/`increment` to the item, creating it if absent and the
    /// conditions allow.
    async fn update(&self, request: UpdateRequest) -> Result<WriteOutcome>;

    async fn delete(&self, request: DeleteRequest) -> Result<WriteOutcome>;

    async fn query(&self, request: QueryRequest) -> Result<QueryOutput>;
}

/// Initialize the key-value store based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
    table_name: &str,
) -> std::result::Result<Arc<dyn KeyValueStore>, Box<dyn std::error::Error>> {
    info!(storage = ?config.storage_type, table = %table_name, "Initializing storage");

    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryStore::new(table_name))),
        #[cfg(feature = "dynamo")]
        StorageType::Dynamo => {
            let store = DynamoStore::new(
                table_name,
                config.dynamo.region.as_deref(),
                config.dynamo.endpoint_url.as_deref(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "dynamo"))]
        StorageType::Dynamo => {
            tracing::error!("DynamoDB storage requested but 'dynamo' feature is not enabled");
            Err("DynamoDB feature not enabled".into())
        }
    }
}
