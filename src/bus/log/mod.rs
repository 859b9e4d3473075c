//! Logging event bus.
//!
//! Publishes by writing each event to the log. Used when no downstream
//! transport is configured.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{BusError, BusEvent, EventBus, EventHandler, Result};

/// Event bus that only logs.
#[derive(Debug, Default)]
pub struct LogEventBus;

impl LogEventBus {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventBus for LogEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(source = %event.source))]
    async fn publish(&self, event: Arc<BusEvent>) -> Result<()> {
        let detail = serde_json::to_string(&event.detail)?;
        info!(
            source = %event.source,
            detail_type = %event.detail_type,
            time = %event.time,
            detail = %detail,
            "Change event"
        );
        Ok(())
    }

    async fn subscribe(&self, _handler: Box<dyn EventHandler>) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }
}
