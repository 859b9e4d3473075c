use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;

use super::*;
use crate::cdc::{build_event, ChangeKind};
use crate::entity::codec::TYPE_ATTRIBUTE;
use crate::entity::{KeySchema, KeyTemplate};
use crate::storage::{AttributeValue, Attributes, MemoryStore};

/// Mirrors a GithubUser's login into a UserProfile keyed by login.
struct ProfileProjection {
    target: EntityType,
    calls: AtomicUsize,
}

impl ProfileProjection {
    fn new() -> Self {
        Self {
            target: EntityType::new(
                "UserProfile",
                KeySchema::new(KeyTemplate::new("PROFILE", &["login"])),
            )
            .versioned(),
            calls: AtomicUsize::new(0),
        }
    }

    fn source_version(source: &ChangeRecord) -> Option<AttributeValue> {
        source.image().and_then(|image| image.get("_version")).cloned()
    }
}

impl Projection for ProfileProjection {
    fn name(&self) -> &str {
        "user-profile"
    }

    fn target(&self) -> &EntityType {
        &self.target
    }

    fn target_key(&self, source: &ChangeRecord) -> Result<Option<PrimaryKey>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if source.kind == ChangeKind::Remove {
            return Ok(None);
        }
        let image = source
            .image()
            .ok_or_else(|| EntityError::Decoding("no image".to_string()))?;
        self.target.derive_primary_key(image).map(Some)
    }

    fn on_update(&self, source: &ChangeRecord, current: &Item) -> Result<Option<UpdateInput>> {
        let version = Self::source_version(source);
        if current.get("sourceVersion") == version.as_ref() {
            return Ok(None);
        }
        let login = current.get("login").cloned().unwrap_or(AttributeValue::Null);
        Ok(Some(
            UpdateInput::default()
                .with("login", login)
                .with("sourceVersion", version.unwrap_or(AttributeValue::Null)),
        ))
    }

    fn on_create(&self, source: &ChangeRecord) -> Result<Option<CreateInput>> {
        let image = match source.image() {
            Some(image) => image,
            None => return Ok(None),
        };
        let mut input = CreateInput::default();
        for name in ["login", "vendor"] {
            if let Some(value) = image.get(name) {
                input = input.with(name, value.clone());
            }
        }
        if let Some(version) = Self::source_version(source) {
            input = input.with("sourceVersion", version);
        }
        Ok(Some(input))
    }
}

fn change(kind: ChangeKind, sequence: u64, version: u64) -> ChangeRecord {
    let mut image = Attributes::new();
    image.insert(TYPE_ATTRIBUTE.to_string(), "GithubUser".into());
    image.insert("login".to_string(), "alice".into());
    image.insert("vendor".to_string(), "GITHUB".into());
    image.insert("_version".to_string(), version.into());

    let (old_image, new_image) = match kind {
        ChangeKind::Remove => (Some(image), None),
        _ => (None, Some(image)),
    };
    ChangeRecord {
        event_id: Some(format!("event-{}", sequence)),
        kind,
        sequence_number: Some(sequence.to_string()),
        source: Some("arn:stream".to_string()),
        approximate_time: Utc::now(),
        keys: Attributes::new(),
        old_image,
        new_image,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        step_ms: 1,
    }
}

fn setup() -> (Arc<MemoryStore>, Arc<ProfileProjection>, Projector) {
    let memory = Arc::new(MemoryStore::new("test_table"));
    let store = Arc::new(EntityStore::new(memory.clone()));
    let projection = Arc::new(ProfileProjection::new());
    let projector = Projector::new(store, projection.clone()).with_retry(fast_retry());
    (memory, projection, projector)
}

#[tokio::test]
async fn test_first_change_creates_target() {
    let (memory, _, projector) = setup();

    let outcome = projector
        .project(&change(ChangeKind::Insert, 1, 1))
        .await
        .unwrap();

    let item = match outcome {
        ProjectionOutcome::Created(item) => item,
        other => panic!("expected create, got {:?}", other),
    };
    assert_eq!(item.type_tag, "UserProfile");
    assert_eq!(item.get("sourceVersion"), Some(&1u64.into()));
    assert_eq!(memory.item_count().await, 1);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let (memory, _, projector) = setup();
    let insert = change(ChangeKind::Insert, 1, 1);

    let first = projector.project(&insert).await.unwrap();
    let second = projector.project(&insert).await.unwrap();
    let third = projector.project(&insert).await.unwrap();

    assert_eq!(first.label(), "created");
    assert_eq!(second, ProjectionOutcome::Unchanged);
    assert_eq!(third, ProjectionOutcome::Unchanged);
    assert_eq!(memory.change_log().await.len(), 1);
}

#[tokio::test]
async fn test_newer_source_updates_target_once() {
    let (memory, _, projector) = setup();
    projector
        .project(&change(ChangeKind::Insert, 1, 1))
        .await
        .unwrap();

    let modify = change(ChangeKind::Modify, 2, 2);
    let updated = projector.project(&modify).await.unwrap();
    let replayed = projector.project(&modify).await.unwrap();

    match updated {
        ProjectionOutcome::Updated(item) => {
            assert_eq!(item.version, Some(2));
            assert_eq!(item.get("sourceVersion"), Some(&2u64.into()));
        }
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(replayed, ProjectionOutcome::Unchanged);
    assert_eq!(memory.change_log().await.len(), 2);
}

#[tokio::test]
async fn test_unmapped_change_is_skipped() {
    let (memory, _, projector) = setup();

    let outcome = projector
        .project(&change(ChangeKind::Remove, 3, 1))
        .await
        .unwrap();

    assert_eq!(outcome, ProjectionOutcome::Skipped);
    assert_eq!(memory.item_count().await, 0);
}

#[tokio::test]
async fn test_integrity_error_is_not_retried() {
    let (memory, projection, projector) = setup();

    // A foreign item squatting on the target key.
    let mut squatter = Attributes::new();
    squatter.insert("pk".to_string(), "PROFILE#alice".into());
    squatter.insert("sk".to_string(), "PROFILE#alice".into());
    squatter.insert(TYPE_ATTRIBUTE.to_string(), "Session".into());
    memory.insert_raw(squatter).await.unwrap();

    let result = projector.project(&change(ChangeKind::Insert, 1, 1)).await;

    assert!(matches!(result, Err(EntityError::DataIntegrity { .. })));
    assert_eq!(projection.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_projectors_converge() {
    let memory = Arc::new(MemoryStore::new("test_table"));
    let store = Arc::new(EntityStore::new(memory.clone()));
    let projection = Arc::new(ProfileProjection::new());
    let first = Projector::new(store.clone(), projection.clone()).with_retry(fast_retry());
    let second = Projector::new(store, projection).with_retry(fast_retry());

    let insert = change(ChangeKind::Insert, 1, 1);
    let (a, b) = tokio::join!(first.project(&insert), second.project(&insert));

    let mut labels = vec![a.unwrap().label(), b.unwrap().label()];
    labels.sort_unstable();
    assert_eq!(labels, vec!["created", "unchanged"]);
    assert_eq!(memory.item_count().await, 1);
}

#[tokio::test]
async fn test_handler_filters_events() {
    let (memory, _, projector) = setup();
    let handler = ProjectorHandler::new(
        Arc::new(projector),
        EventPattern::all()
            .source("users.GithubUser")
            .detail_type("INSERT")
            .detail_type("MODIFY"),
    );

    let record = change(ChangeKind::Insert, 1, 1);
    let mut other = build_event("users", "GithubUser", &record).unwrap();
    other.source = "users.Session".to_string();
    handler.handle(Arc::new(other)).await.unwrap();
    assert_eq!(memory.item_count().await, 0);

    let event = build_event("users", "GithubUser", &record).unwrap();
    handler.handle(Arc::new(event)).await.unwrap();
    assert_eq!(memory.item_count().await, 1);
}

#[tokio::test]
async fn test_handler_reports_bad_detail() {
    let (_, _, projector) = setup();
    let handler = ProjectorHandler::new(Arc::new(projector), EventPattern::all());

    let mut event = build_event("users", "GithubUser", &change(ChangeKind::Insert, 1, 1)).unwrap();
    event.detail = serde_json::json!({"kind": "INSERT"});

    let result = handler.handle(Arc::new(event)).await;
    assert!(matches!(
        result,
        Err(BusError::HandlerFailed { ref name, .. }) if name == "user-profile"
    ));
}
