//! tablestream-dispatch: change stream dispatcher
//!
//! Reads one stream batch (JSON, `{"Records": [...]}`) from stdin, publishes
//! every record on the configured event bus and writes the partial-failure
//! report to stdout.
//!
//! ## Architecture
//! ```text
//! [table change stream] --(batch JSON)--> [tablestream-dispatch] --> [event bus]
//!                                                 |
//!                                                 v
//!                                    stdout: {"batchItemFailures": [...]}
//! ```
//!
//! ## Configuration
//! - `TABLESTREAM_CONFIG`: YAML configuration file
//! - `TABLESTREAM__TABLE_NAME`: table name used in event sources
//! - `TABLESTREAM__MESSAGING__TYPE`: `log`, `channel` or `sns`
//! - `TABLESTREAM_LOG`: log filter (default: info)
//!
//! Exits non-zero when every record of a non-empty batch failed, so the
//! whole batch is handed back for redelivery, or when a record hit a fatal
//! configuration error.

use std::error::Error;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{error, info};

use tablestream::bus::init_event_bus;
use tablestream::cdc::{CdcDispatcher, StreamBatch};
use tablestream::config::Config;
use tablestream::telemetry::{InvocationContext, TracingTelemetry};
use tablestream::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let bus = init_event_bus(&config.messaging)
        .await
        .map_err(|e| -> Box<dyn Error> { e })?;
    info!("Event bus initialized");

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let batch: StreamBatch = serde_json::from_str(&input).map_err(|e| {
        error!("Failed to parse stream batch: {}", e);
        e
    })?;

    info!(
        table = %config.table_name,
        records = batch.records.len(),
        "tablestream-dispatch started"
    );

    let dispatcher = CdcDispatcher::new(config.table_name, bus, Arc::new(TracingTelemetry));
    let context = InvocationContext::new();
    let outcome = dispatcher.dispatch(&context, batch).await;

    println!("{}", serde_json::to_string(&outcome)?);

    if outcome.has_fatal() {
        error!(
            fatal = outcome.fatal.len(),
            errors = ?outcome.fatal,
            "Batch hit fatal configuration errors"
        );
    }
    if outcome.all_failed() {
        error!(
            failed = outcome.batch_item_failures.len(),
            "Every record in the batch failed"
        );
    }
    if outcome.fails_invocation() {
        std::process::exit(1);
    }

    Ok(())
}
