//! Handler dispatch.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use super::{BusEvent, EventHandler};

/// Dispatch an event to all registered handlers.
///
/// Calls each handler in sequence, logging errors but continuing to
/// subsequent handlers. Returns `true` if all handlers succeeded.
pub async fn dispatch_to_handlers(
    handlers: &Arc<RwLock<Vec<Box<dyn EventHandler>>>>,
    event: &Arc<BusEvent>,
) -> bool {
    let handlers_guard = handlers.read().await;
    let mut all_succeeded = true;

    for handler in handlers_guard.iter() {
        if let Err(e) = handler.handle(Arc::clone(event)).await {
            error!(
                source = %event.source,
                detail_type = %event.detail_type,
                error = %e,
                "Handler failed"
            );
            all_succeeded = false;
        }
    }

    all_succeeded
}
