//! Entity persistence.
//!
//! An [`EntityType`] describes one record shape in the shared table: how
//! its primary and secondary-index keys derive from domain attributes,
//! whether it tracks an optimistic-locking version, and whether it expires.
//!
//! - `key`: key templates, primary/index key derivation, node ids
//! - `codec`: item marshalling with bookkeeping fields and integrity checks
//! - `registry`: type tag → entity type lookup
//! - `store`: create/read/update/delete/touch/query over a `KeyValueStore`

use chrono::Duration;

use crate::storage::{Attributes, StoreError};
use crate::utils::retry::Contention;

pub mod codec;
pub mod key;
pub mod registry;
pub mod store;

pub use codec::{CreateInput, Item, UpdateInput, WriteDirective};
pub use key::{
    decode_node_id, encode_node_id, IndexDescriptor, IndexKey, KeySchema, KeyTemplate, PrimaryKey,
};
pub use registry::EntityRegistry;
pub use store::{EntityStore, OperationMetrics, Page, QueryInput, ReadOptions, Response};

/// Result type for entity operations.
pub type Result<T> = std::result::Result<T, EntityError>;

/// Errors surfaced by entity operations.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: String, key: String },

    #[error("{entity} was modified concurrently (expected version {expected:?}): {key}")]
    OptimisticLocking {
        entity: String,
        key: String,
        expected: Option<u64>,
    },

    #[error("Data integrity violation for {entity}: {reason}")]
    DataIntegrity { entity: String, reason: String },

    #[error("Decoding failed: {0}")]
    Decoding(String),

    #[error("{entity} key requires attribute '{attribute}'")]
    MissingKeyAttribute { entity: String, attribute: String },

    #[error("{entity} is versioned; update requires the current version")]
    MissingVersion { entity: String },

    #[error("Attribute '{attribute}' is reserved")]
    ReservedAttribute { attribute: String },

    #[error("Unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("Unknown index '{index}' on {entity}")]
    UnknownIndex { entity: String, index: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl EntityError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn integrity(entity: &str, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}

impl Contention for EntityError {
    fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::OptimisticLocking { .. }
        )
    }
}

/// A named record shape stored in the shared table.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: String,
    key: KeySchema,
    indexes: Vec<IndexDescriptor>,
    versioned: bool,
    ttl: Option<Duration>,
}

impl EntityType {
    /// Create an unversioned, non-expiring entity type.
    pub fn new(name: impl Into<String>, key: KeySchema) -> Self {
        Self {
            name: name.into(),
            key,
            indexes: Vec::new(),
            versioned: false,
            ttl: None,
        }
    }

    /// Enable optimistic-locking version tracking.
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    /// Expire items `ttl` after creation; `touch` extends the expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// The type tag written into every item of this type.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_schema(&self) -> &KeySchema {
        &self.key
    }

    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn index(&self, name: &str) -> Result<&IndexDescriptor> {
        self.indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| EntityError::UnknownIndex {
                entity: self.name.clone(),
                index: name.to_string(),
            })
    }

    /// Derive the primary key without touching the store.
    pub fn derive_primary_key(&self, attributes: &Attributes) -> Result<PrimaryKey> {
        self.key.derive(&self.name, attributes)
    }

    /// Derive the key pair of a named secondary index.
    pub fn derive_index_key(&self, index: &str, attributes: &Attributes) -> Result<IndexKey> {
        let descriptor = self.index(index)?;
        let key = descriptor.key.derive(&self.name, attributes)?;
        Ok(IndexKey {
            index: descriptor.name.clone(),
            partition: key.partition,
            sort: key.sort,
        })
    }
}
