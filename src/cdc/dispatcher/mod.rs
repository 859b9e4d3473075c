//! CDC dispatcher.
//!
//! Every record of a batch is handled independently and concurrently:
//! normalize, find the type tag, build a bus event, publish. A failure on
//! one record never affects the others; its sequence number is reported
//! back so the delivery infrastructure redelivers only that record.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::record::{normalize, ChangeRecord, NormalizeError};
use crate::bus::{BusError, BusEvent, EventBus};
use crate::telemetry::{in_span, InvocationContext, Telemetry};

/// A batch as delivered by the change-log trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<Value>,
}

/// Why one record could not be dispatched.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Redelivery metadata was not requested from the stream.
    #[error("Record has no sequence number; the stream trigger must report batch item failures")]
    MissingSequenceNumber,

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("Record {sequence_number} has no type tag in its image")]
    MissingTypeTag { sequence_number: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] BusError),
}

impl DispatchError {
    /// Configuration errors that must be escalated, not only retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingSequenceNumber)
    }
}

/// One record to redeliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Result of dispatching a batch, in the partial-batch response shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_item_failures: Vec<BatchItemFailure>,
    /// Records in the batch.
    #[serde(skip)]
    pub total: usize,
    /// Messages of fatal configuration errors.
    #[serde(skip)]
    pub fatal: Vec<String>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.batch_item_failures.is_empty()
    }

    /// Every record failed (an empty batch never counts as failed).
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.batch_item_failures.len() == self.total
    }

    pub fn has_fatal(&self) -> bool {
        !self.fatal.is_empty()
    }

    /// The invocation as a whole should be reported as failed.
    pub fn fails_invocation(&self) -> bool {
        self.all_failed() || self.has_fatal()
    }

    pub fn failed_identifiers(&self) -> Vec<&str> {
        self.batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
            .collect()
    }
}

/// Build the bus event for a normalized record.
pub fn build_event(
    table_name: &str,
    type_tag: &str,
    record: &ChangeRecord,
) -> Result<BusEvent, serde_json::Error> {
    Ok(BusEvent {
        source: format!("{}.{}", table_name, type_tag),
        detail_type: record.kind.as_str().to_string(),
        detail: serde_json::to_value(record)?,
        resources: record.source.iter().cloned().collect(),
        time: record.approximate_time,
    })
}

/// Republishes change-log batches onto the bus.
pub struct CdcDispatcher {
    table_name: String,
    bus: Arc<dyn EventBus>,
    telemetry: Arc<dyn Telemetry>,
}

impl CdcDispatcher {
    pub fn new(
        table_name: impl Into<String>,
        bus: Arc<dyn EventBus>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            bus,
            telemetry,
        }
    }

    /// Dispatch every record of `batch`, returning the records to redeliver.
    pub async fn dispatch(&self, context: &InvocationContext, batch: StreamBatch) -> BatchOutcome {
        let cold_start = context.take_cold_start();
        let total = batch.records.len();

        let results = in_span(
            self.telemetry.as_ref(),
            "cdc.dispatch",
            join_all(batch.records.iter().map(|raw| self.dispatch_record(raw))),
        )
        .await;

        let mut outcome = BatchOutcome {
            total,
            ..BatchOutcome::default()
        };
        for result in results {
            if let Err((item_identifier, e)) = result {
                if e.is_fatal() {
                    outcome.fatal.push(e.to_string());
                }
                outcome
                    .batch_item_failures
                    .push(BatchItemFailure { item_identifier });
            }
        }

        info!(
            table = %self.table_name,
            records = total,
            failed = outcome.batch_item_failures.len(),
            cold_start,
            "Dispatched change batch"
        );

        outcome
    }

    async fn dispatch_record(&self, raw: &Value) -> Result<(), (String, DispatchError)> {
        let sequence_number = match raw.pointer("/dynamodb/SequenceNumber").and_then(Value::as_str) {
            Some(sequence_number) => sequence_number.to_string(),
            None => {
                let e = DispatchError::MissingSequenceNumber;
                self.telemetry.record_exception(&e);
                error!(
                    table = %self.table_name,
                    event_id = ?raw.get("eventID"),
                    "{}", e
                );
                return Err((String::new(), e));
            }
        };

        let result = in_span(
            self.telemetry.as_ref(),
            "cdc.record",
            self.publish_record(&sequence_number, raw),
        )
        .await;

        result.map_err(|e| {
            self.telemetry.record_exception(&e);
            warn!(
                table = %self.table_name,
                sequence_number = %sequence_number,
                error = %e,
                "Record dispatch failed"
            );
            (sequence_number, e)
        })
    }

    async fn publish_record(&self, sequence_number: &str, raw: &Value) -> Result<(), DispatchError> {
        let record = normalize(raw)?;
        let type_tag = record
            .type_tag()
            .ok_or_else(|| DispatchError::MissingTypeTag {
                sequence_number: sequence_number.to_string(),
            })?
            .to_string();

        let event = build_event(&self.table_name, &type_tag, &record)?;
        debug!(
            source = %event.source,
            detail_type = %event.detail_type,
            sequence_number = %sequence_number,
            "Publishing change event"
        );
        self.bus.publish(Arc::new(event)).await?;
        Ok(())
    }
}
