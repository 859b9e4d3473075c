//! Type tag → entity type lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{EntityError, EntityType, Result};

/// Registered entity types, keyed by type tag.
///
/// Generic paths such as node-id lookup pick the codec through this table;
/// adding an entity type is a registration, not a new code path.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    types: HashMap<String, Arc<EntityType>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type, replacing any previous one with the same tag.
    pub fn register(&mut self, entity: EntityType) -> Arc<EntityType> {
        let entity = Arc::new(entity);
        info!(entity = %entity.name(), "Registered entity type");
        self.types.insert(entity.name().to_string(), entity.clone());
        entity
    }

    pub fn with(mut self, entity: EntityType) -> Self {
        self.register(entity);
        self
    }

    pub fn get(&self, type_tag: &str) -> Result<Arc<EntityType>> {
        self.types
            .get(type_tag)
            .cloned()
            .ok_or_else(|| EntityError::UnknownEntityType(type_tag.to_string()))
    }

    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.types.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
