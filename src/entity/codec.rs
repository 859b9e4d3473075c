//! Item marshalling.
//!
//! Every stored item carries bookkeeping attributes next to its domain
//! attributes: the type tag, creation and update timestamps, the version
//! (versioned types only) and the expiry (expiring types only). Reads
//! verify the type tag and the presence of these attributes before handing
//! an [`Item`] back.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::key::{encode_node_id, PrimaryKey};
use super::{EntityError, EntityType, Result};
use crate::storage::attribute::{attributes_from_json, attributes_to_json};
use crate::storage::{AttributeValue, Attributes, Condition, TableSchema, UpdateRequest};

pub const TYPE_ATTRIBUTE: &str = "_type";
pub const CREATED_AT_ATTRIBUTE: &str = "_createdAt";
pub const UPDATED_AT_ATTRIBUTE: &str = "_updatedAt";
pub const VERSION_ATTRIBUTE: &str = "_version";
pub const TTL_ATTRIBUTE: &str = "_ttl";

const INTERNAL_ATTRIBUTES: [&str; 5] = [
    TYPE_ATTRIBUTE,
    CREATED_AT_ATTRIBUTE,
    UPDATED_AT_ATTRIBUTE,
    VERSION_ATTRIBUTE,
    TTL_ATTRIBUTE,
];

/// Convert a serializable value into domain attributes.
pub fn to_attributes<T: Serialize>(value: &T) -> Result<Attributes> {
    let json = serde_json::to_value(value).map_err(|e| EntityError::Decoding(e.to_string()))?;
    attributes_from_json(json)
        .ok_or_else(|| EntityError::Decoding("entity must serialize to an object".to_string()))
}

/// Domain attributes for a new item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateInput {
    pub attributes: Attributes,
}

impl CreateInput {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(to_attributes(value)?))
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Domain attributes to change on an existing item.
///
/// The attributes must include every primary key field. Versioned types
/// also require the version the caller last read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateInput {
    pub attributes: Attributes,
    pub expected_version: Option<u64>,
}

impl UpdateInput {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            expected_version: None,
        }
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(to_attributes(value)?))
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// A conditional attribute-level write against one item.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteDirective {
    pub key: PrimaryKey,
    pub set: Attributes,
    pub set_if_absent: Attributes,
    pub increment: Vec<(String, i64)>,
    pub conditions: Vec<Condition>,
}

impl WriteDirective {
    pub fn into_update_request(self, schema: &TableSchema) -> UpdateRequest {
        UpdateRequest {
            key: self.key.to_attributes(schema),
            set: self.set,
            set_if_absent: self.set_if_absent,
            increment: self.increment,
            conditions: self.conditions,
        }
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(entity: &str, name: &str, raw: &Attributes) -> Result<DateTime<Utc>> {
    let text = raw
        .get(name)
        .and_then(AttributeValue::as_str)
        .ok_or_else(|| EntityError::integrity(entity, format!("missing '{}'", name)))?;
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| EntityError::integrity(entity, format!("malformed '{}': {}", name, e)))
}

fn check_reserved(entity: &EntityType, schema: &TableSchema, attributes: &Attributes) -> Result<()> {
    let reserved = |name: &str| {
        INTERNAL_ATTRIBUTES.contains(&name)
            || name == schema.partition_key
            || schema.sort_key.as_deref() == Some(name)
            || entity.indexes().iter().any(|index| {
                index.partition_attribute == name || index.sort_attribute.as_deref() == Some(name)
            })
    };
    match attributes.keys().find(|name| reserved(name)) {
        Some(name) => Err(EntityError::ReservedAttribute {
            attribute: name.clone(),
        }),
        None => Ok(()),
    }
}

fn expiry(entity: &EntityType, now: DateTime<Utc>) -> Option<AttributeValue> {
    entity
        .ttl()
        .map(|ttl| AttributeValue::from((now + ttl).timestamp()))
}

fn index_attributes(entity: &EntityType, attributes: &Attributes) -> Attributes {
    entity
        .indexes()
        .iter()
        .filter_map(|index| index.attributes_for(entity.name(), attributes))
        .flatten()
        .collect()
}

/// Conditions that the addressed item exists and belongs to `entity`.
pub fn existence_conditions(entity: &EntityType, schema: &TableSchema) -> Vec<Condition> {
    vec![
        Condition::AttributeExists(schema.partition_key.clone()),
        Condition::Equals(TYPE_ATTRIBUTE.to_string(), entity.name().into()),
    ]
}

/// Full attribute set for a new item, guarded by key non-existence.
pub fn marshall_for_create(
    entity: &EntityType,
    schema: &TableSchema,
    input: CreateInput,
    now: DateTime<Utc>,
) -> Result<WriteDirective> {
    check_reserved(entity, schema, &input.attributes)?;
    let key = entity.derive_primary_key(&input.attributes)?;

    let timestamp = format_timestamp(now);
    let mut set = index_attributes(entity, &input.attributes);
    set.extend(input.attributes);
    set.insert(TYPE_ATTRIBUTE.to_string(), entity.name().into());
    set.insert(CREATED_AT_ATTRIBUTE.to_string(), timestamp.clone().into());
    set.insert(UPDATED_AT_ATTRIBUTE.to_string(), timestamp.into());
    if entity.is_versioned() {
        set.insert(VERSION_ATTRIBUTE.to_string(), 1u64.into());
    }
    if let Some(expires) = expiry(entity, now) {
        set.insert(TTL_ATTRIBUTE.to_string(), expires);
    }

    Ok(WriteDirective {
        key,
        set,
        set_if_absent: Attributes::new(),
        increment: Vec::new(),
        conditions: vec![Condition::AttributeNotExists(schema.partition_key.clone())],
    })
}

/// Changed attributes for an existing item, guarded by existence, type tag
/// and (for versioned types) the expected version.
///
/// `_createdAt` is never written. Index keys are recomputed only for indexes
/// whose fields are all supplied.
pub fn marshall_for_update(
    entity: &EntityType,
    schema: &TableSchema,
    input: UpdateInput,
    now: DateTime<Utc>,
) -> Result<WriteDirective> {
    check_reserved(entity, schema, &input.attributes)?;
    let expected_version = match (entity.is_versioned(), input.expected_version) {
        (true, None) => {
            return Err(EntityError::MissingVersion {
                entity: entity.name().to_string(),
            })
        }
        (true, Some(version)) => Some(version),
        (false, _) => None,
    };
    let key = entity.derive_primary_key(&input.attributes)?;

    let mut set = index_attributes(entity, &input.attributes);
    set.extend(input.attributes);
    set.insert(UPDATED_AT_ATTRIBUTE.to_string(), format_timestamp(now).into());

    let mut conditions = existence_conditions(entity, schema);
    if let Some(version) = expected_version {
        set.insert(VERSION_ATTRIBUTE.to_string(), (version + 1).into());
        conditions.push(Condition::Equals(
            VERSION_ATTRIBUTE.to_string(),
            version.into(),
        ));
    }

    Ok(WriteDirective {
        key,
        set,
        set_if_absent: Attributes::new(),
        increment: Vec::new(),
        conditions,
    })
}

/// Unconditional upsert of the supplied attributes.
///
/// `_createdAt` is only written when the item is new and the version is
/// incremented, so an overwrite never rewinds either of them.
pub fn marshall_for_blind_write(
    entity: &EntityType,
    schema: &TableSchema,
    input: CreateInput,
    now: DateTime<Utc>,
) -> Result<WriteDirective> {
    check_reserved(entity, schema, &input.attributes)?;
    let key = entity.derive_primary_key(&input.attributes)?;

    let timestamp = format_timestamp(now);
    let mut set = index_attributes(entity, &input.attributes);
    set.extend(input.attributes);
    set.insert(TYPE_ATTRIBUTE.to_string(), entity.name().into());
    set.insert(UPDATED_AT_ATTRIBUTE.to_string(), timestamp.clone().into());
    if let Some(expires) = expiry(entity, now) {
        set.insert(TTL_ATTRIBUTE.to_string(), expires);
    }

    let mut set_if_absent = Attributes::new();
    set_if_absent.insert(CREATED_AT_ATTRIBUTE.to_string(), timestamp.into());

    let increment = if entity.is_versioned() {
        vec![(VERSION_ATTRIBUTE.to_string(), 1)]
    } else {
        Vec::new()
    };

    Ok(WriteDirective {
        key,
        set,
        set_if_absent,
        increment,
        conditions: Vec::new(),
    })
}

/// Refresh `_updatedAt`, bump the version and extend the expiry.
pub fn marshall_for_touch(
    entity: &EntityType,
    schema: &TableSchema,
    key: PrimaryKey,
    now: DateTime<Utc>,
) -> WriteDirective {
    let mut set = Attributes::new();
    set.insert(UPDATED_AT_ATTRIBUTE.to_string(), format_timestamp(now).into());
    if let Some(expires) = expiry(entity, now) {
        set.insert(TTL_ATTRIBUTE.to_string(), expires);
    }

    let increment = if entity.is_versioned() {
        vec![(VERSION_ATTRIBUTE.to_string(), 1)]
    } else {
        Vec::new()
    };

    WriteDirective {
        key,
        set,
        set_if_absent: Attributes::new(),
        increment,
        conditions: existence_conditions(entity, schema),
    }
}

/// Rebuild an item from raw stored attributes.
///
/// Fails with `DataIntegrity` when the type tag does not name `entity` or a
/// required bookkeeping attribute is absent or malformed.
pub fn unmarshall(entity: &EntityType, schema: &TableSchema, mut raw: Attributes) -> Result<Item> {
    let name = entity.name();
    match raw.get(TYPE_ATTRIBUTE) {
        Some(AttributeValue::S(tag)) if tag == name => {}
        Some(AttributeValue::S(tag)) => {
            return Err(EntityError::integrity(
                name,
                format!("type tag '{}' does not match", tag),
            ))
        }
        Some(_) => return Err(EntityError::integrity(name, "type tag is not a string")),
        None => return Err(EntityError::integrity(name, "missing type tag")),
    }

    let mut key = PrimaryKey::from_attributes(schema, &raw)
        .ok_or_else(|| EntityError::integrity(name, "missing primary key attributes"))?;
    if entity.key_schema().sort.is_none() {
        key.sort = None;
    }
    let created_at = parse_timestamp(name, CREATED_AT_ATTRIBUTE, &raw)?;
    let updated_at = parse_timestamp(name, UPDATED_AT_ATTRIBUTE, &raw)?;

    let version = if entity.is_versioned() {
        Some(
            raw.get(VERSION_ATTRIBUTE)
                .and_then(AttributeValue::as_u64)
                .ok_or_else(|| EntityError::integrity(name, "missing or malformed version"))?,
        )
    } else {
        None
    };

    let expires_at = match raw.get(TTL_ATTRIBUTE) {
        None | Some(AttributeValue::Null) => None,
        Some(value) => {
            let seconds = value
                .as_i64()
                .ok_or_else(|| EntityError::integrity(name, "malformed expiry"))?;
            Some(
                Utc.timestamp_opt(seconds, 0)
                    .single()
                    .ok_or_else(|| EntityError::integrity(name, "expiry out of range"))?,
            )
        }
    };

    for internal in INTERNAL_ATTRIBUTES {
        raw.remove(internal);
    }
    raw.remove(&schema.partition_key);
    if let Some(sort_key) = &schema.sort_key {
        raw.remove(sort_key);
    }
    for index in entity.indexes() {
        raw.remove(&index.partition_attribute);
        if let Some(sort) = &index.sort_attribute {
            raw.remove(sort);
        }
    }

    Ok(Item {
        type_tag: name.to_string(),
        key,
        created_at,
        updated_at,
        version,
        expires_at,
        attributes: raw,
    })
}

/// A stored entity with its bookkeeping fields split out.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub type_tag: String,
    pub key: PrimaryKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Domain attributes only.
    pub attributes: Attributes,
}

impl Item {
    pub fn node_id(&self) -> String {
        encode_node_id(&self.type_tag, &self.key)
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Deserialize the domain attributes into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(attributes_to_json(&self.attributes))
            .map_err(|e| EntityError::integrity(&self.type_tag, format!("cannot decode: {}", e)))
    }
}
