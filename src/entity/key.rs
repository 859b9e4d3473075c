//! Key derivation and node ids.
//!
//! A key template renders as `PREFIX#value1#value2`. Derivation is pure:
//! the same attributes always produce the same key string, with no store
//! round-trip.
//!
//! A node id is `base64(TypeName:partitionKey#sortKey)`, with `%`, `#` and
//! `:` percent-escaped inside each component so decoding is unambiguous.

use std::fmt;

use base64::prelude::*;

use super::{EntityError, Result};
use crate::storage::{AttributeValue, Attributes, TableSchema};

/// Separator between key segments.
pub const KEY_SEPARATOR: &str = "#";

/// Template for one key attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    prefix: String,
    fields: Vec<String>,
}

/// A rendered sort-key restriction for queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    /// Every field was present.
    Exact(String),
    /// Only a leading subset was present; match with `begins_with`.
    Prefix(String),
}

fn render_value(value: &AttributeValue) -> Option<String> {
    match value {
        AttributeValue::S(s) => Some(s.clone()),
        AttributeValue::N(n) => Some(n.clone()),
        AttributeValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl KeyTemplate {
    pub fn new(prefix: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            prefix: prefix.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn leading_segments(&self, attributes: &Attributes) -> (Vec<String>, usize) {
        let mut segments = Vec::with_capacity(self.fields.len() + 1);
        if !self.prefix.is_empty() {
            segments.push(self.prefix.clone());
        }
        let mut present = 0;
        for field in &self.fields {
            match attributes.get(field).and_then(render_value) {
                Some(value) => {
                    segments.push(value);
                    present += 1;
                }
                None => break,
            }
        }
        (segments, present)
    }

    /// Render the full key; every field must be present.
    pub fn render(&self, entity: &str, attributes: &Attributes) -> Result<String> {
        let (segments, present) = self.leading_segments(attributes);
        if present < self.fields.len() {
            return Err(EntityError::MissingKeyAttribute {
                entity: entity.to_string(),
                attribute: self.fields[present].clone(),
            });
        }
        Ok(segments.join(KEY_SEPARATOR))
    }

    /// Render as much of the key as the leading fields allow.
    pub fn render_partial(&self, attributes: &Attributes) -> KeyMatch {
        let (segments, present) = self.leading_segments(attributes);
        if present == self.fields.len() {
            return KeyMatch::Exact(segments.join(KEY_SEPARATOR));
        }
        if segments.is_empty() {
            return KeyMatch::Prefix(String::new());
        }
        let mut prefix = segments.join(KEY_SEPARATOR);
        prefix.push_str(KEY_SEPARATOR);
        KeyMatch::Prefix(prefix)
    }
}

/// Partition template plus optional sort template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    pub partition: KeyTemplate,
    pub sort: Option<KeyTemplate>,
}

impl KeySchema {
    pub fn new(partition: KeyTemplate) -> Self {
        Self {
            partition,
            sort: None,
        }
    }

    pub fn with_sort(mut self, sort: KeyTemplate) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn derive(&self, entity: &str, attributes: &Attributes) -> Result<PrimaryKey> {
        let partition = self.partition.render(entity, attributes)?;
        let sort = self
            .sort
            .as_ref()
            .map(|template| template.render(entity, attributes))
            .transpose()?;
        Ok(PrimaryKey { partition, sort })
    }

    /// Whether every partition field is present.
    pub fn has_partition_fields(&self, attributes: &Attributes) -> bool {
        self.partition
            .fields()
            .iter()
            .all(|field| attributes.get(field).and_then(render_value).is_some())
    }
}

/// Alternate key projection of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub partition_attribute: String,
    pub sort_attribute: Option<String>,
    pub key: KeySchema,
}

impl IndexDescriptor {
    pub fn new(
        name: impl Into<String>,
        partition_attribute: impl Into<String>,
        sort_attribute: Option<&str>,
        key: KeySchema,
    ) -> Self {
        Self {
            name: name.into(),
            partition_attribute: partition_attribute.into(),
            sort_attribute: sort_attribute.map(str::to_string),
            key,
        }
    }

    /// Index attributes to store, or `None` when the item is not indexed.
    ///
    /// Indexes are sparse: an item is indexed only when the full index key
    /// can be derived from the given attributes.
    pub fn attributes_for(&self, entity: &str, attributes: &Attributes) -> Option<Attributes> {
        let key = self.key.derive(entity, attributes).ok()?;
        let mut out = Attributes::new();
        out.insert(self.partition_attribute.clone(), key.partition.into());
        if let (Some(attribute), Some(sort)) = (&self.sort_attribute, key.sort) {
            out.insert(attribute.clone(), sort.into());
        }
        Some(out)
    }
}

/// The table key of one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey {
    pub partition: String,
    pub sort: Option<String>,
}

impl PrimaryKey {
    pub fn new(partition: impl Into<String>, sort: Option<String>) -> Self {
        Self {
            partition: partition.into(),
            sort,
        }
    }

    /// Key attributes in the shape the store expects.
    ///
    /// A key without a sort component repeats its partition value as the
    /// sort key when the table has one.
    pub fn to_attributes(&self, schema: &TableSchema) -> Attributes {
        let mut key = Attributes::new();
        key.insert(schema.partition_key.clone(), self.partition.clone().into());
        if let Some(sort_key) = &schema.sort_key {
            let sort = self.sort.as_ref().unwrap_or(&self.partition);
            key.insert(sort_key.clone(), sort.clone().into());
        }
        key
    }

    pub fn from_attributes(schema: &TableSchema, attributes: &Attributes) -> Option<Self> {
        let partition = attributes.get(&schema.partition_key)?.as_str()?.to_string();
        let sort = match &schema.sort_key {
            Some(sort_key) => Some(attributes.get(sort_key)?.as_str()?.to_string()),
            None => None,
        };
        Some(Self { partition, sort })
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{} / {}", self.partition, sort),
            None => write!(f, "{}", self.partition),
        }
    }
}

/// Derived key pair of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub index: String,
    pub partition: String,
    pub sort: Option<String>,
}

fn escape(component: &str) -> String {
    component
        .replace('%', "%25")
        .replace('#', "%23")
        .replace(':', "%3A")
}

fn unescape(component: &str) -> Result<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(position) = rest.find('%') {
        out.push_str(&rest[..position]);
        let code = rest.get(position + 1..position + 3);
        let decoded = match code {
            Some("25") => '%',
            Some("23") => '#',
            Some("3A") => ':',
            _ => {
                return Err(EntityError::Decoding(format!(
                    "invalid escape in node id component '{}'",
                    component
                )))
            }
        };
        out.push(decoded);
        rest = &rest[position + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Encode a global identifier for an item.
///
/// The payload is `Type:pk#sk` with each component escaped (`%` as `%25`,
/// `#` as `%23`, `:` as `%3A`), so keys containing separators still decode
/// unambiguously. The payload only matches the literal form when no
/// component contains those characters.
pub fn encode_node_id(type_name: &str, key: &PrimaryKey) -> String {
    let mut payload = format!("{}:{}", escape(type_name), escape(&key.partition));
    if let Some(sort) = &key.sort {
        payload.push_str(KEY_SEPARATOR);
        payload.push_str(&escape(sort));
    }
    BASE64_STANDARD.encode(payload)
}

/// Decode a global identifier into its type tag and primary key.
pub fn decode_node_id(id: &str) -> Result<(String, PrimaryKey)> {
    let bytes = BASE64_STANDARD
        .decode(id)
        .map_err(|e| EntityError::Decoding(format!("node id is not base64: {}", e)))?;
    let payload = String::from_utf8(bytes)
        .map_err(|e| EntityError::Decoding(format!("node id is not UTF-8: {}", e)))?;

    let (type_name, key) = payload
        .split_once(':')
        .ok_or_else(|| EntityError::Decoding("node id has no type separator".to_string()))?;
    if type_name.is_empty() {
        return Err(EntityError::Decoding("node id has an empty type".to_string()));
    }

    let mut parts = key.split(KEY_SEPARATOR);
    let partition = parts.next().unwrap_or_default();
    let sort = parts.next();
    if parts.next().is_some() {
        return Err(EntityError::Decoding(
            "node id has more than two key components".to_string(),
        ));
    }
    if partition.is_empty() {
        return Err(EntityError::Decoding(
            "node id has an empty partition key".to_string(),
        ));
    }

    Ok((
        unescape(type_name)?,
        PrimaryKey {
            partition: unescape(partition)?,
            sort: sort.map(unescape).transpose()?,
        },
    ))
}
