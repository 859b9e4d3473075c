//! Entity store.
//!
//! Implements create/read/update/delete/touch/query for registered entity
//! types over any [`KeyValueStore`]. Concurrency safety rests entirely on
//! the store's conditional writes; no lock is held between a read and the
//! write that follows it.

use std::sync::Arc;

use base64::prelude::*;
use tracing::{debug, warn};

use super::codec::{
    existence_conditions, marshall_for_blind_write, marshall_for_create, marshall_for_touch,
    marshall_for_update, unmarshall, CreateInput, Item, UpdateInput, WriteDirective,
};
use super::key::{decode_node_id, KeyMatch, PrimaryKey};
use super::{EntityError, EntityRegistry, EntityType, Result};
use crate::storage::attribute::{attributes_from_wire, attributes_to_wire};
use crate::storage::{
    Attributes, DeleteRequest, GetRequest, KeyValueStore, QueryRequest,
    SortCondition, StoreError, TableSchema, WriteOutcome,
};
use crate::utils::clock::{Clock, SystemClock};

/// Store-reported cost of one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OperationMetrics {
    pub consumed_capacity: Option<f64>,
}

/// Operation result plus its metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub data: T,
    pub metrics: OperationMetrics,
}

impl<T> Response<T> {
    fn new(data: T, consumed_capacity: Option<f64>) -> Self {
        Self {
            data,
            metrics: OperationMetrics { consumed_capacity },
        }
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

/// Read consistency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub consistent: bool,
}

impl ReadOptions {
    pub fn consistent() -> Self {
        Self { consistent: true }
    }
}

/// A key-condition query against the table or one of its indexes.
///
/// `attributes` must supply every partition field of the targeted key. Sort
/// fields are optional: all of them give an exact match, a leading subset
/// gives a prefix match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryInput {
    pub index: Option<String>,
    pub attributes: Attributes,
    pub reverse: bool,
    pub limit: Option<u32>,
    pub next_token: Option<String>,
    pub consistent: bool,
}

impl QueryInput {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            ..Self::default()
        }
    }

    pub fn on_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn after(mut self, token: impl Into<String>) -> Self {
        self.next_token = Some(token.into());
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    pub has_next_page: bool,
    pub next_token: Option<String>,
}

fn encode_page_token(key: &Attributes) -> String {
    BASE64_STANDARD.encode(attributes_to_wire(key).to_string())
}

fn decode_page_token(token: &str) -> Result<Attributes> {
    let bytes = BASE64_STANDARD
        .decode(token)
        .map_err(|e| EntityError::Decoding(format!("page token is not base64: {}", e)))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| EntityError::Decoding(format!("page token is not JSON: {}", e)))?;
    attributes_from_wire(&value).map_err(|e| EntityError::Decoding(format!("page token: {}", e)))
}

/// Outcome of a directive applied as a conditional update.
enum Written {
    /// The item as stored after the write, with consumed capacity.
    Item(Attributes, Option<f64>),
    ConditionFailed,
}

/// Entity persistence over a single shared table.
#[derive(Clone)]
pub struct EntityStore {
    store: Arc<dyn KeyValueStore>,
    schema: TableSchema,
    clock: Arc<dyn Clock>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            schema: TableSchema::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_schema(mut self, schema: TableSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn table_name(&self) -> &str {
        self.store.table_name()
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Create a new item; fails with `AlreadyExists` if the key is taken.
    ///
    /// Written as a conditional update so the store returns the complete
    /// new item.
    pub async fn create(&self, entity: &EntityType, input: CreateInput) -> Result<Response<Item>> {
        let directive = marshall_for_create(entity, &self.schema, input, self.clock.now())?;
        let key = directive.key.clone();

        match self.apply(directive).await? {
            Written::Item(raw, capacity) => {
                let item = unmarshall(entity, &self.schema, raw)?;
                debug!(entity = %entity.name(), key = %key, "Created item");
                Ok(Response::new(item, capacity))
            }
            Written::ConditionFailed => Err(EntityError::AlreadyExists {
                entity: entity.name().to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Read by domain attributes containing the primary key fields.
    pub async fn read(
        &self,
        entity: &EntityType,
        attributes: &Attributes,
        options: ReadOptions,
    ) -> Result<Response<Item>> {
        let key = entity.derive_primary_key(attributes)?;
        self.read_key(entity, &key, options).await
    }

    pub async fn read_key(
        &self,
        entity: &EntityType,
        key: &PrimaryKey,
        options: ReadOptions,
    ) -> Result<Response<Item>> {
        let output = self
            .store
            .get(GetRequest {
                key: key.to_attributes(&self.schema),
                consistent: options.consistent,
            })
            .await?;

        let raw = output.item.ok_or_else(|| EntityError::NotFound {
            entity: entity.name().to_string(),
            key: key.to_string(),
        })?;
        let item = unmarshall(entity, &self.schema, raw)?;
        Ok(Response::new(item, output.consumed_capacity))
    }

    /// Read any registered entity by its node id.
    pub async fn read_node(
        &self,
        registry: &EntityRegistry,
        node_id: &str,
        options: ReadOptions,
    ) -> Result<Response<Item>> {
        let (type_tag, key) = decode_node_id(node_id)?;
        let entity = registry.get(&type_tag)?;
        self.read_key(&entity, &key, options).await
    }

    /// Update an existing item at the expected version.
    ///
    /// A failed condition cannot tell a missing item from a stale version,
    /// so a consistent read follows: not-found there means `NotFound`,
    /// anything else (including a failed read) means `OptimisticLocking`.
    pub async fn update(&self, entity: &EntityType, input: UpdateInput) -> Result<Response<Item>> {
        let expected = input.expected_version;
        let directive = marshall_for_update(entity, &self.schema, input, self.clock.now())?;
        let key = directive.key.clone();

        match self.apply(directive).await? {
            Written::Item(raw, capacity) => {
                let item = unmarshall(entity, &self.schema, raw)?;
                debug!(entity = %entity.name(), key = %key, version = ?item.version, "Updated item");
                Ok(Response::new(item, capacity))
            }
            Written::ConditionFailed => match self.read_key(entity, &key, ReadOptions::consistent()).await {
                Err(e) if e.is_not_found() => Err(e),
                other => {
                    if let Err(e) = other {
                        warn!(entity = %entity.name(), key = %key, error = %e, "Conflict check read failed");
                    }
                    Err(EntityError::OptimisticLocking {
                        entity: entity.name().to_string(),
                        key: key.to_string(),
                        expected,
                    })
                }
            },
        }
    }

    /// Delete an existing item, returning it as it was.
    pub async fn delete(&self, entity: &EntityType, key: &PrimaryKey) -> Result<Response<Item>> {
        let outcome = self
            .store
            .delete(DeleteRequest {
                key: key.to_attributes(&self.schema),
                conditions: existence_conditions(entity, &self.schema),
            })
            .await?;

        match outcome {
            WriteOutcome::Applied(output) => {
                let raw = output.attributes.ok_or_else(|| {
                    EntityError::integrity(entity.name(), "delete returned no previous item")
                })?;
                let item = unmarshall(entity, &self.schema, raw)?;
                debug!(entity = %entity.name(), key = %key, "Deleted item");
                Ok(Response::new(item, output.consumed_capacity))
            }
            WriteOutcome::ConditionFailed => Err(self.not_found(entity, key)),
        }
    }

    /// Bump the version and extend the expiry without changing domain data.
    pub async fn touch(&self, entity: &EntityType, key: &PrimaryKey) -> Result<Response<Item>> {
        let directive = marshall_for_touch(entity, &self.schema, key.clone(), self.clock.now());

        match self.apply(directive).await? {
            Written::Item(raw, capacity) => {
                let item = unmarshall(entity, &self.schema, raw)?;
                debug!(entity = %entity.name(), key = %key, version = ?item.version, "Touched item");
                Ok(Response::new(item, capacity))
            }
            Written::ConditionFailed => Err(self.not_found(entity, key)),
        }
    }

    /// Query the table or a named index by key condition.
    pub async fn query(&self, entity: &EntityType, input: QueryInput) -> Result<Response<Page>> {
        if input.limit == Some(0) {
            return Err(EntityError::InvalidArgument(
                "query limit must be at least 1".to_string(),
            ));
        }
        let (index_name, partition_attribute, sort_attribute, key_schema, consistent) =
            match &input.index {
                Some(name) => {
                    let index = entity.index(name)?;
                    if input.consistent {
                        debug!(entity = %entity.name(), index = %name, "Index queries are eventually consistent");
                    }
                    (
                        Some(index.name.clone()),
                        index.partition_attribute.clone(),
                        index.sort_attribute.clone(),
                        &index.key,
                        false,
                    )
                }
                None => (
                    None,
                    self.schema.partition_key.clone(),
                    self.schema.sort_key.clone(),
                    entity.key_schema(),
                    input.consistent,
                ),
            };

        let partition = key_schema
            .partition
            .render(entity.name(), &input.attributes)?;
        let sort_condition = match (&key_schema.sort, &sort_attribute) {
            (Some(template), Some(_)) => match template.render_partial(&input.attributes) {
                KeyMatch::Exact(sort) => Some(SortCondition::Equals(sort.into())),
                KeyMatch::Prefix(prefix) if prefix.is_empty() => None,
                KeyMatch::Prefix(prefix) => Some(SortCondition::BeginsWith(prefix)),
            },
            _ => None,
        };
        let exclusive_start_key = input
            .next_token
            .as_deref()
            .map(decode_page_token)
            .transpose()?;

        debug!(
            entity = %entity.name(),
            index = ?index_name,
            partition = %partition,
            sort = ?sort_condition,
            "Querying"
        );

        let output = self
            .store
            .query(QueryRequest {
                index_name,
                partition_attribute,
                partition_value: partition.into(),
                sort_attribute,
                sort_condition,
                scan_forward: !input.reverse,
                limit: input.limit,
                exclusive_start_key,
                consistent,
            })
            .await?;

        let items = output
            .items
            .into_iter()
            .map(|raw| unmarshall(entity, &self.schema, raw))
            .collect::<Result<Vec<_>>>()?;
        let next_token = output.last_evaluated_key.as_ref().map(encode_page_token);

        Ok(Response::new(
            Page {
                items,
                has_next_page: next_token.is_some(),
                next_token,
            },
            output.consumed_capacity,
        ))
    }

    /// Unconditionally upsert an item.
    ///
    /// For idempotent seeding: never reports a conflict. Supplied attributes
    /// overwrite the stored ones, `_createdAt` survives an overwrite and the
    /// version keeps counting up so stale optimistic updates still fail.
    pub async fn blind_write(&self, entity: &EntityType, input: CreateInput) -> Result<Response<Item>> {
        let directive = marshall_for_blind_write(entity, &self.schema, input, self.clock.now())?;
        let key = directive.key.clone();

        match self.apply(directive).await? {
            Written::Item(raw, capacity) => {
                let written = unmarshall(entity, &self.schema, raw)?;
                debug!(entity = %entity.name(), key = %written.key, version = ?written.version, "Blind-wrote item");
                Ok(Response::new(written, capacity))
            }
            Written::ConditionFailed => Err(StoreError::Backend(format!(
                "unconditional write of {} reported a failed condition",
                key
            ))
            .into()),
        }
    }

    async fn apply(&self, directive: WriteDirective) -> Result<Written> {
        let entity_key = directive.key.to_string();
        match self
            .store
            .update(directive.into_update_request(&self.schema))
            .await?
        {
            WriteOutcome::Applied(output) => {
                let raw = output.attributes.ok_or_else(|| {
                    EntityError::Store(StoreError::Backend(format!(
                        "update of {} returned no attributes",
                        entity_key
                    )))
                })?;
                Ok(Written::Item(raw, output.consumed_capacity))
            }
            WriteOutcome::ConditionFailed => Ok(Written::ConditionFailed),
        }
    }

    fn not_found(&self, entity: &EntityType, key: &PrimaryKey) -> EntityError {
        EntityError::NotFound {
            entity: entity.name().to_string(),
            key: key.to_string(),
        }
    }
}
