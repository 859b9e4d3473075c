//! Change data capture.
//!
//! - `record`: raw change-log record → [`ChangeRecord`]
//! - `dispatcher`: batch of raw records → one bus event each, with
//!   per-record failure reporting for partial redelivery

pub mod dispatcher;
pub mod record;

pub use dispatcher::{
    build_event, BatchItemFailure, BatchOutcome, CdcDispatcher, DispatchError, StreamBatch,
};
pub use record::{normalize, ChangeKind, ChangeRecord, NormalizeError};
