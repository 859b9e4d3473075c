//! In-memory key-value store.
//!
//! Every conditional write evaluates its condition and mutates the table
//! under one write lock, so racing writers are linearized the same way
//! DynamoDB linearizes conditional writes to one key.
//!
//! Each applied mutation also appends a DynamoDB-Streams-shaped record
//! (`NEW_AND_OLD_IMAGES`) to an emulated change log, which tests feed into
//! the CDC dispatcher.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::attribute::{attributes_to_json, attributes_to_wire};
use super::{
    AttributeValue, Attributes, DeleteRequest, GetOutput, GetRequest, KeyValueStore, PutRequest,
    QueryOutput, QueryRequest, Result, SortCondition, StoreError, TableSchema, UpdateRequest,
    WriteOutcome, WriteOutput,
};

const WRITE_CAPACITY: f64 = 1.0;
const READ_CAPACITY: f64 = 0.5;

#[derive(Default)]
struct Table {
    items: BTreeMap<String, Attributes>,
    change_log: Vec<Value>,
    next_sequence: u64,
}

/// In-memory single-table store with an emulated change log.
pub struct MemoryStore {
    table_name: String,
    schema: TableSchema,
    table: RwLock<Table>,
    fail_on_write: RwLock<bool>,
}

impl MemoryStore {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self::with_schema(table_name, TableSchema::default())
    }

    pub fn with_schema(table_name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            table_name: table_name.into(),
            schema,
            table: RwLock::new(Table::default()),
            fail_on_write: RwLock::new(false),
        }
    }

    /// Make every subsequent write fail with a backend error.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    pub async fn item_count(&self) -> usize {
        self.table.read().await.items.len()
    }

    /// Store an item as-is, bypassing conditions and the change log.
    pub async fn insert_raw(&self, item: Attributes) -> Result<()> {
        let id = self.canonical_key(&item)?;
        self.table.write().await.items.insert(id, item);
        Ok(())
    }

    /// Read an item as-is.
    pub async fn get_raw(&self, key: &Attributes) -> Result<Option<Attributes>> {
        let id = self.canonical_key(key)?;
        Ok(self.table.read().await.items.get(&id).cloned())
    }

    /// Snapshot of the change log.
    pub async fn change_log(&self) -> Vec<Value> {
        self.table.read().await.change_log.clone()
    }

    /// Remove and return all change records accumulated so far.
    pub async fn take_change_log(&self) -> Vec<Value> {
        std::mem::take(&mut self.table.write().await.change_log)
    }

    fn stream_arn(&self) -> String {
        format!(
            "arn:aws:dynamodb:local:000000000000:table/{}/stream/memory",
            self.table_name
        )
    }

    fn canonical_key(&self, attributes: &Attributes) -> Result<String> {
        let key = self.schema.key_of(attributes).ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "key must contain '{}'{}",
                self.schema.partition_key,
                self.schema
                    .sort_key
                    .as_ref()
                    .map(|sk| format!(" and '{}'", sk))
                    .unwrap_or_default()
            ))
        })?;
        Ok(attributes_to_json(&key).to_string())
    }

    fn is_key_attribute(&self, name: &str) -> bool {
        name == self.schema.partition_key || self.schema.sort_key.as_deref() == Some(name)
    }

    async fn check_writable(&self) -> Result<()> {
        if *self.fail_on_write.read().await {
            return Err(StoreError::Backend("Mock write failure".to_string()));
        }
        Ok(())
    }

    fn record_change(
        &self,
        table: &mut Table,
        key: &Attributes,
        old: Option<&Attributes>,
        new: Option<&Attributes>,
    ) {
        let event_name = match (old, new) {
            (None, Some(_)) => "INSERT",
            (Some(_), Some(_)) => "MODIFY",
            (Some(_), None) => "REMOVE",
            (None, None) => return,
        };

        table.next_sequence += 1;
        let sequence_number = format!("{:021}", table.next_sequence);

        let mut payload = json!({
            "ApproximateCreationDateTime": Utc::now().timestamp_millis() as f64 / 1000.0,
            "Keys": attributes_to_wire(key),
            "SequenceNumber": sequence_number,
            "StreamViewType": "NEW_AND_OLD_IMAGES",
        });
        if let Some(new) = new {
            payload["NewImage"] = attributes_to_wire(new);
        }
        if let Some(old) = old {
            payload["OldImage"] = attributes_to_wire(old);
        }

        debug!(
            table = %self.table_name,
            event = event_name,
            sequence = %sequence_number,
            "Recorded change"
        );

        table.change_log.push(json!({
            "eventID": Uuid::new_v4().to_string(),
            "eventName": event_name,
            "eventVersion": "1.1",
            "eventSource": "aws:dynamodb",
            "awsRegion": "local",
            "eventSourceARN": self.stream_arn(),
            "dynamodb": payload,
        }));
    }

    fn sort_condition_holds(item: &Attributes, attribute: &str, condition: &SortCondition) -> bool {
        match (item.get(attribute), condition) {
            (Some(value), SortCondition::Equals(expected)) => value == expected,
            (Some(AttributeValue::S(value)), SortCondition::BeginsWith(prefix)) => {
                value.starts_with(prefix.as_str())
            }
            _ => false,
        }
    }
}

fn compare_values(a: Option<&AttributeValue>, b: Option<&AttributeValue>) -> Ordering {
    match (a, b) {
        (Some(AttributeValue::N(x)), Some(AttributeValue::N(y))) => {
            match (x.parse::<f64>(), y.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => x.cmp(y),
            }
        }
        (Some(AttributeValue::S(x)), Some(AttributeValue::S(y))) => x.cmp(y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => format!("{:?}", x).cmp(&format!("{:?}", y)),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn get(&self, request: GetRequest) -> Result<GetOutput> {
        let id = self.canonical_key(&request.key)?;
        let table = self.table.read().await;
        let capacity = if request.consistent {
            2.0 * READ_CAPACITY
        } else {
            READ_CAPACITY
        };
        Ok(GetOutput {
            item: table.items.get(&id).cloned(),
            consumed_capacity: Some(capacity),
        })
    }

    async fn put(&self, request: PutRequest) -> Result<WriteOutcome> {
        self.check_writable().await?;
        let id = self.canonical_key(&request.item)?;
        let key = self.schema.key_of(&request.item).unwrap_or_default();

        let mut table = self.table.write().await;
        let current = table.items.get(&id).cloned();
        if !request.conditions.iter().all(|c| c.holds(current.as_ref())) {
            return Ok(WriteOutcome::ConditionFailed);
        }

        table.items.insert(id, request.item.clone());
        self.record_change(&mut table, &key, current.as_ref(), Some(&request.item));

        Ok(WriteOutcome::Applied(WriteOutput {
            attributes: None,
            consumed_capacity: Some(WRITE_CAPACITY),
        }))
    }

    async fn update(&self, request: UpdateRequest) -> Result<WriteOutcome> {
        self.check_writable().await?;
        let id = self.canonical_key(&request.key)?;
        if let Some(name) = request
            .set
            .keys()
            .chain(request.set_if_absent.keys())
            .find(|name| self.is_key_attribute(name))
        {
            return Err(StoreError::InvalidRequest(format!(
                "cannot update key attribute '{}'",
                name
            )));
        }

        let mut table = self.table.write().await;
        let current = table.items.get(&id).cloned();
        if !request.conditions.iter().all(|c| c.holds(current.as_ref())) {
            return Ok(WriteOutcome::ConditionFailed);
        }

        let mut next = match &current {
            Some(item) => item.clone(),
            None => self.schema.key_of(&request.key).unwrap_or_default(),
        };
        next.extend(request.set);
        for (name, value) in request.set_if_absent {
            next.entry(name).or_insert(value);
        }
        for (name, by) in request.increment {
            let base = match next.get(&name) {
                None => 0,
                Some(value) => value.as_i64().ok_or_else(|| {
                    StoreError::InvalidRequest(format!("cannot add to non-numeric '{}'", name))
                })?,
            };
            next.insert(name, AttributeValue::from(base + by));
        }

        table.items.insert(id, next.clone());
        self.record_change(&mut table, &request.key, current.as_ref(), Some(&next));

        Ok(WriteOutcome::Applied(WriteOutput {
            attributes: Some(next),
            consumed_capacity: Some(WRITE_CAPACITY),
        }))
    }

    async fn delete(&self, request: DeleteRequest) -> Result<WriteOutcome> {
        self.check_writable().await?;
        let id = self.canonical_key(&request.key)?;

        let mut table = self.table.write().await;
        let current = table.items.get(&id).cloned();
        if !request.conditions.iter().all(|c| c.holds(current.as_ref())) {
            return Ok(WriteOutcome::ConditionFailed);
        }

        table.items.remove(&id);
        self.record_change(&mut table, &request.key, current.as_ref(), None);

        Ok(WriteOutcome::Applied(WriteOutput {
            attributes: current,
            consumed_capacity: Some(WRITE_CAPACITY),
        }))
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryOutput> {
        let start_id = request
            .exclusive_start_key
            .as_ref()
            .map(|key| self.canonical_key(key))
            .transpose()?;
        let start_sort = match (&request.exclusive_start_key, &request.sort_attribute) {
            (Some(key), Some(sort_attribute)) => key.get(sort_attribute).cloned(),
            _ => None,
        };

        let table = self.table.read().await;
        let mut matches: Vec<(&String, &Attributes)> = table
            .items
            .iter()
            .filter(|(_, item)| item.get(&request.partition_attribute) == Some(&request.partition_value))
            .collect();

        if let Some(sort_attribute) = &request.sort_attribute {
            // Index entries exist only for items that carry the index keys.
            matches.retain(|(_, item)| item.contains_key(sort_attribute));
            if let Some(condition) = &request.sort_condition {
                matches.retain(|(_, item)| Self::sort_condition_holds(item, sort_attribute, condition));
            }
            matches.sort_by(|(a_id, a), (b_id, b)| {
                compare_values(a.get(sort_attribute), b.get(sort_attribute)).then_with(|| a_id.cmp(b_id))
            });
        }

        if !request.scan_forward {
            matches.reverse();
        }

        // Resume strictly after the cursor's position, even if that item is gone.
        if let Some(start_id) = start_id {
            let sort_attribute = request.sort_attribute.as_deref();
            matches.retain(|(id, item)| {
                let position = match sort_attribute {
                    Some(attribute) => compare_values(item.get(attribute), start_sort.as_ref()),
                    None => Ordering::Equal,
                }
                .then_with(|| id.as_str().cmp(start_id.as_str()));
                if request.scan_forward {
                    position == Ordering::Greater
                } else {
                    position == Ordering::Less
                }
            });
        }

        let mut last_evaluated_key = None;
        if let Some(limit) = request.limit {
            let limit = limit as usize;
            if matches.len() > limit {
                matches.truncate(limit);
                last_evaluated_key = matches.last().and_then(|(_, item)| {
                    let mut key = self.schema.key_of(item)?;
                    key.insert(
                        request.partition_attribute.clone(),
                        request.partition_value.clone(),
                    );
                    if let Some(sort_attribute) = &request.sort_attribute {
                        if let Some(value) = item.get(sort_attribute) {
                            key.insert(sort_attribute.clone(), value.clone());
                        }
                    }
                    Some(key)
                });
            }
        }

        let items: Vec<Attributes> = matches.into_iter().map(|(_, item)| item.clone()).collect();
        let consumed_capacity = Some(READ_CAPACITY * items.len().max(1) as f64);

        Ok(QueryOutput {
            items,
            last_evaluated_key,
            consumed_capacity,
        })
    }
}
