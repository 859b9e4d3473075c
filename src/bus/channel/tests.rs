use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::bus::BusError;

/// Forwards `source detail_type` of every handled event.
struct Forwarding {
    sender: mpsc::UnboundedSender<String>,
}

impl EventHandler for Forwarding {
    fn handle(&self, event: Arc<BusEvent>) -> BoxFuture<'static, std::result::Result<(), BusError>> {
        let _ = self
            .sender
            .send(format!("{} {}", event.source, event.detail_type));
        Box::pin(async { Ok(()) })
    }
}

async fn listen(bus: &ChannelEventBus) -> mpsc::UnboundedReceiver<String> {
    let (sender, receiver) = mpsc::unbounded_channel();
    bus.subscribe(Box::new(Forwarding { sender })).await.unwrap();
    bus.start_consuming().await.unwrap();
    receiver
}

async fn next(receiver: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("event should arrive")
        .expect("channel open")
}

fn event(source: &str, detail_type: &str) -> Arc<BusEvent> {
    Arc::new(BusEvent {
        source: source.to_string(),
        detail_type: detail_type.to_string(),
        detail: json!({}),
        resources: vec![],
        time: Utc::now(),
    })
}

#[tokio::test]
async fn test_publish_without_subscribers_succeeds() {
    let bus = ChannelEventBus::publisher();
    assert!(bus.publish(event("users.GithubUser", "INSERT")).await.is_ok());
}

#[tokio::test]
async fn test_subscriber_receives_published_events() {
    let bus = ChannelEventBus::publisher();
    let mut received = listen(&bus).await;

    bus.publish(event("users.GithubUser", "INSERT")).await.unwrap();
    bus.publish(event("users.GithubUser", "MODIFY")).await.unwrap();

    assert_eq!(next(&mut received).await, "users.GithubUser INSERT");
    assert_eq!(next(&mut received).await, "users.GithubUser MODIFY");
}

#[tokio::test]
async fn test_subscriber_pattern_filters_events() {
    let publisher = ChannelEventBus::publisher();
    let subscriber = publisher.subscriber(
        EventPattern::all()
            .source("users.GithubUser")
            .detail_type("INSERT"),
    );
    let mut received = listen(&subscriber).await;

    publisher.publish(event("users.GithubUser", "REMOVE")).await.unwrap();
    publisher.publish(event("users.Session", "INSERT")).await.unwrap();
    publisher.publish(event("users.GithubUser", "INSERT")).await.unwrap();

    // Delivery is ordered, so the filtered events were seen and skipped.
    assert_eq!(next(&mut received).await, "users.GithubUser INSERT");
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn test_start_consuming_twice_delivers_once() {
    let bus = ChannelEventBus::publisher();
    let mut received = listen(&bus).await;
    bus.start_consuming().await.unwrap();

    bus.publish(event("users.GithubUser", "MODIFY")).await.unwrap();
    bus.publish(event("users.GithubUser", "REMOVE")).await.unwrap();

    assert_eq!(next(&mut received).await, "users.GithubUser MODIFY");
    assert_eq!(next(&mut received).await, "users.GithubUser REMOVE");
    assert!(received.try_recv().is_err());
}
