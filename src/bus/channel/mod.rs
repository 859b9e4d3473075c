//! In-process event bus over a tokio broadcast channel.
//!
//! One publisher and any number of subscribers share a single channel.
//! Each subscriber filters with its own [`EventPattern`] and fans matching
//! events out to its handlers, so projectors can run next to the
//! dispatcher without external infrastructure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::{dispatch_to_handlers, BusEvent, EventBus, EventHandler, EventPattern, Result};

/// Events buffered per subscriber before a slow one starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

type Handlers = Arc<RwLock<Vec<Box<dyn EventHandler>>>>;

/// Broadcast-backed event bus.
pub struct ChannelEventBus {
    sender: broadcast::Sender<Arc<BusEvent>>,
    pattern: EventPattern,
    handlers: Handlers,
    consuming: AtomicBool,
}

impl ChannelEventBus {
    /// Create a bus on a fresh channel.
    pub fn new(pattern: EventPattern) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self::on_channel(sender, pattern)
    }

    /// Create a bus whose handlers receive every event.
    pub fn publisher() -> Self {
        Self::new(EventPattern::all())
    }

    /// A second bus on the same channel, filtering with `pattern`.
    pub fn subscriber(&self, pattern: EventPattern) -> Self {
        Self::on_channel(self.sender.clone(), pattern)
    }

    fn on_channel(sender: broadcast::Sender<Arc<BusEvent>>, pattern: EventPattern) -> Self {
        Self {
            sender,
            pattern,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consuming: AtomicBool::new(false),
        }
    }
}

async fn consume(
    mut receiver: broadcast::Receiver<Arc<BusEvent>>,
    pattern: EventPattern,
    handlers: Handlers,
) {
    loop {
        match receiver.recv().await {
            Ok(event) if pattern.matches(&event) => {
                debug!(
                    source = %event.source,
                    detail_type = %event.detail_type,
                    "Delivering channel event"
                );
                dispatch_to_handlers(&handlers, &event).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Channel subscriber lagged; events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Channel closed, subscriber stopping");
                return;
            }
        }
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(source = %event.source))]
    async fn publish(&self, event: Arc<BusEvent>) -> Result<()> {
        // A send error only means nobody is subscribed yet.
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(receivers, "Published event to channel");
        Ok(())
    }

    async fn subscribe(&self, handler: Box<dyn EventHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
        info!(handler_count = handlers.len(), "Handler subscribed to channel bus");
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Subscribe before returning so events published afterwards are seen.
        let receiver = self.sender.subscribe();
        tokio::spawn(consume(receiver, self.pattern.clone(), self.handlers.clone()));

        info!(pattern = ?self.pattern, "Channel subscriber started");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
