//! Mock event bus implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, BusEvent, EventBus, EventHandler, Result};

type FailPredicate = Box<dyn Fn(&BusEvent) -> bool + Send + Sync>;

/// Mock event bus for testing.
///
/// Records every successfully published event. Publishing fails for all
/// events after `set_fail_on_publish(true)`, or for the events selected by
/// `fail_when`.
#[derive(Default)]
pub struct MockEventBus {
    published: RwLock<Vec<BusEvent>>,
    fail_on_publish: RwLock<bool>,
    fail_when: RwLock<Option<FailPredicate>>,
}

impl MockEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail only the events matching `predicate`.
    pub async fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&BusEvent) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.write().await = Some(Box::new(predicate));
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<BusEvent> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<BusEvent> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl EventBus for MockEventBus {
    async fn publish(&self, event: Arc<BusEvent>) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        if let Some(predicate) = self.fail_when.read().await.as_ref() {
            if predicate(&event) {
                return Err(BusError::Publish("Mock publish failure".to_string()));
            }
        }
        self.published.write().await.push((*event).clone());
        Ok(())
    }

    async fn subscribe(&self, _handler: Box<dyn EventHandler>) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn make_event(sequence: &str) -> Arc<BusEvent> {
        Arc::new(BusEvent {
            source: "users.GithubUser".to_string(),
            detail_type: "INSERT".to_string(),
            detail: json!({ "sequenceNumber": sequence }),
            resources: vec![],
            time: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_mock_event_bus_publish() {
        let bus = MockEventBus::new();

        bus.publish(make_event("1")).await.unwrap();

        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_event_bus_fail_on_publish() {
        let bus = MockEventBus::new();
        bus.set_fail_on_publish(true).await;

        let result = bus.publish(make_event("1")).await;

        assert!(result.is_err());
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_event_bus_fail_when() {
        let bus = MockEventBus::new();
        bus.fail_when(|event| event.detail["sequenceNumber"] == "2")
            .await;

        assert!(bus.publish(make_event("1")).await.is_ok());
        assert!(bus.publish(make_event("2")).await.is_err());
        assert!(bus.publish(make_event("3")).await.is_ok());

        let taken = bus.take_published().await;
        assert_eq!(taken.len(), 2);
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_event_bus_subscribe_not_supported() {
        let bus = MockEventBus::new();

        struct DummyHandler;
        impl EventHandler for DummyHandler {
            fn handle(
                &self,
                _event: Arc<BusEvent>,
            ) -> futures::future::BoxFuture<'static, std::result::Result<(), BusError>> {
                Box::pin(async { Ok(()) })
            }
        }

        let result = bus.subscribe(Box::new(DummyHandler)).await;
        assert!(matches!(result, Err(BusError::SubscribeNotSupported)));
    }
}
