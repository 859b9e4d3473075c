//! Change record normalization.
//!
//! Turns one raw change-log record (DynamoDB Streams JSON) into a
//! [`ChangeRecord`] whose images are decoded attribute maps instead of
//! wire-encoded values.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::codec::TYPE_ATTRIBUTE;
use crate::storage::attribute::attributes_from_wire;
use crate::storage::Attributes;

/// Errors from normalizing a raw record.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// The record is not JSON of the expected shape.
    #[error("Decoding failed: {0}")]
    Decoding(String),

    /// The record parsed but its content is unusable.
    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "INSERT" => Some(Self::Insert),
            "MODIFY" => Some(Self::Modify),
            "REMOVE" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table mutation in uniform shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub event_id: Option<String>,
    pub kind: ChangeKind,
    pub sequence_number: Option<String>,
    /// Stream identifier the record was read from.
    pub source: Option<String>,
    pub approximate_time: DateTime<Utc>,
    pub keys: Attributes,
    pub old_image: Option<Attributes>,
    pub new_image: Option<Attributes>,
}

impl ChangeRecord {
    /// The image describing the entity: new for inserts and modifies, old
    /// for removals. Falls back to the other image when that one is absent.
    pub fn image(&self) -> Option<&Attributes> {
        match self.kind {
            ChangeKind::Remove => self.old_image.as_ref().or(self.new_image.as_ref()),
            ChangeKind::Insert | ChangeKind::Modify => {
                self.new_image.as_ref().or(self.old_image.as_ref())
            }
        }
    }

    /// Type tag of the mutated item.
    pub fn type_tag(&self) -> Option<&str> {
        self.image()
            .and_then(|image| image.get(TYPE_ATTRIBUTE))
            .and_then(|tag| tag.as_str())
    }

    /// Rebuild from the `detail` of a bus event.
    pub fn from_detail(detail: &Value) -> Result<Self, NormalizeError> {
        Self::deserialize(detail).map_err(|e| NormalizeError::Decoding(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct StreamRecord {
    #[serde(rename = "eventID")]
    event_id: Option<String>,
    #[serde(rename = "eventName")]
    event_name: Option<String>,
    #[serde(rename = "eventSourceARN")]
    event_source_arn: Option<String>,
    dynamodb: Option<StreamPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamPayload {
    approximate_creation_date_time: Option<f64>,
    keys: Option<Value>,
    new_image: Option<Value>,
    old_image: Option<Value>,
    sequence_number: Option<String>,
}

fn decode_image(name: &str, image: Option<Value>) -> Result<Option<Attributes>, NormalizeError> {
    image
        .map(|value| {
            attributes_from_wire(&value)
                .map_err(|e| NormalizeError::DataIntegrity(format!("{}: {}", name, e)))
        })
        .transpose()
}

fn approximate_time(seconds: f64) -> Result<DateTime<Utc>, NormalizeError> {
    if !seconds.is_finite() {
        return Err(NormalizeError::DataIntegrity(format!(
            "approximate creation time is not finite: {}",
            seconds
        )));
    }
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64)
        .single()
        .ok_or_else(|| {
            NormalizeError::DataIntegrity(format!(
                "approximate creation time out of range: {}",
                seconds
            ))
        })
}

/// Normalize one raw change-log record.
pub fn normalize(raw: &Value) -> Result<ChangeRecord, NormalizeError> {
    let record =
        StreamRecord::deserialize(raw).map_err(|e| NormalizeError::Decoding(e.to_string()))?;

    let event_name = record
        .event_name
        .ok_or_else(|| NormalizeError::DataIntegrity("missing eventName".to_string()))?;
    let kind = ChangeKind::parse(&event_name).ok_or_else(|| {
        NormalizeError::DataIntegrity(format!("unknown eventName '{}'", event_name))
    })?;

    let payload = record
        .dynamodb
        .ok_or_else(|| NormalizeError::DataIntegrity("missing dynamodb payload".to_string()))?;
    let seconds = payload.approximate_creation_date_time.ok_or_else(|| {
        NormalizeError::DataIntegrity("missing ApproximateCreationDateTime".to_string())
    })?;

    Ok(ChangeRecord {
        event_id: record.event_id,
        kind,
        sequence_number: payload.sequence_number,
        source: record.event_source_arn,
        approximate_time: approximate_time(seconds)?,
        keys: decode_image("Keys", payload.keys)?.unwrap_or_default(),
        old_image: decode_image("OldImage", payload.old_image)?,
        new_image: decode_image("NewImage", payload.new_image)?,
    })
}
