//! KeyValueStore interface tests.
//!
//! These tests verify the contract of the KeyValueStore trait.
//! Each storage implementation should run these tests. Every test writes
//! under a fresh partition so runs against a shared table do not collide.

use uuid::Uuid;

use tablestream::storage::{
    AttributeValue, Attributes, Condition, DeleteRequest, GetRequest, KeyValueStore, PutRequest,
    QueryRequest, SortCondition, UpdateRequest, WriteOutcome,
};

/// A partition value unique to one test run.
pub fn partition(test: &str) -> String {
    format!("TEST#{}#{}", test, Uuid::new_v4().simple())
}

pub fn key(pk: &str, sk: &str) -> Attributes {
    let mut key = Attributes::new();
    key.insert("pk".to_string(), pk.into());
    key.insert("sk".to_string(), sk.into());
    key
}

pub fn item(pk: &str, sk: &str, extra: &[(&str, AttributeValue)]) -> Attributes {
    let mut item = key(pk, sk);
    for (name, value) in extra {
        item.insert(name.to_string(), value.clone());
    }
    item
}

fn query(pk: &str) -> QueryRequest {
    QueryRequest {
        index_name: None,
        partition_attribute: "pk".to_string(),
        partition_value: pk.into(),
        sort_attribute: Some("sk".to_string()),
        sort_condition: None,
        scan_forward: true,
        limit: None,
        exclusive_start_key: None,
        consistent: true,
    }
}

async fn get<S: KeyValueStore>(store: &S, pk: &str, sk: &str) -> Option<Attributes> {
    store
        .get(GetRequest {
            key: key(pk, sk),
            consistent: true,
        })
        .await
        .expect("get should succeed")
        .item
}

fn sort_keys(items: &[Attributes]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get("sk").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

// =============================================================================
// put / get
// =============================================================================

pub async fn test_put_then_get<S: KeyValueStore>(store: &S) {
    let pk = partition("put_get");
    let stored = item(&pk, "A", &[("name", "alpha".into()), ("count", 3u64.into())]);

    let outcome = store
        .put(PutRequest {
            item: stored.clone(),
            conditions: vec![],
        })
        .await
        .expect("put should succeed");
    assert!(matches!(outcome, WriteOutcome::Applied(_)));

    assert_eq!(get(store, &pk, "A").await, Some(stored));
}

pub async fn test_get_missing_item<S: KeyValueStore>(store: &S) {
    let pk = partition("get_missing");
    assert_eq!(get(store, &pk, "nothing").await, None);
}

pub async fn test_conditional_put_rejects_existing<S: KeyValueStore>(store: &S) {
    let pk = partition("put_not_exists");
    let guard = vec![Condition::AttributeNotExists("pk".to_string())];

    let first = store
        .put(PutRequest {
            item: item(&pk, "A", &[("v", "first".into())]),
            conditions: guard.clone(),
        })
        .await
        .expect("put should succeed");
    assert!(matches!(first, WriteOutcome::Applied(_)));

    let second = store
        .put(PutRequest {
            item: item(&pk, "A", &[("v", "second".into())]),
            conditions: guard,
        })
        .await
        .expect("condition failure is not an error");
    assert!(matches!(second, WriteOutcome::ConditionFailed));

    let current = get(store, &pk, "A").await.expect("item should exist");
    assert_eq!(current.get("v").and_then(|v| v.as_str()), Some("first"));
}

// =============================================================================
// update
// =============================================================================

pub async fn test_update_returns_new_image<S: KeyValueStore>(store: &S) {
    let pk = partition("update_new_image");
    store
        .put(PutRequest {
            item: item(&pk, "A", &[("name", "alpha".into()), ("_version", 1u64.into())]),
            conditions: vec![],
        })
        .await
        .expect("put should succeed");

    let mut set = Attributes::new();
    set.insert("name".to_string(), "beta".into());
    let outcome = store
        .update(UpdateRequest {
            key: key(&pk, "A"),
            set,
            set_if_absent: Attributes::new(),
            increment: vec![("_version".to_string(), 1)],
            conditions: vec![Condition::Equals("_version".to_string(), 1u64.into())],
        })
        .await
        .expect("update should succeed");

    let WriteOutcome::Applied(output) = outcome else {
        panic!("update should apply");
    };
    let image = output.attributes.expect("update returns the new image");
    assert_eq!(image.get("name").and_then(|v| v.as_str()), Some("beta"));
    assert_eq!(image.get("_version").and_then(|v| v.as_u64()), Some(2));
}

pub async fn test_update_condition_failure<S: KeyValueStore>(store: &S) {
    let pk = partition("update_condition");
    store
        .put(PutRequest {
            item: item(&pk, "A", &[("_version", 5u64.into())]),
            conditions: vec![],
        })
        .await
        .expect("put should succeed");

    let mut set = Attributes::new();
    set.insert("name".to_string(), "stale".into());
    let outcome = store
        .update(UpdateRequest {
            key: key(&pk, "A"),
            set,
            set_if_absent: Attributes::new(),
            increment: vec![],
            conditions: vec![Condition::Equals("_version".to_string(), 4u64.into())],
        })
        .await
        .expect("condition failure is not an error");
    assert!(matches!(outcome, WriteOutcome::ConditionFailed));

    let current = get(store, &pk, "A").await.expect("item should exist");
    assert!(current.get("name").is_none());
}

pub async fn test_update_requires_existing_item<S: KeyValueStore>(store: &S) {
    let pk = partition("update_exists");
    let mut set = Attributes::new();
    set.insert("name".to_string(), "ghost".into());

    let outcome = store
        .update(UpdateRequest {
            key: key(&pk, "A"),
            set,
            set_if_absent: Attributes::new(),
            increment: vec![],
            conditions: vec![Condition::AttributeExists("pk".to_string())],
        })
        .await
        .expect("condition failure is not an error");
    assert!(matches!(outcome, WriteOutcome::ConditionFailed));
    assert_eq!(get(store, &pk, "A").await, None);
}

pub async fn test_update_set_if_absent_keeps_existing_value<S: KeyValueStore>(store: &S) {
    let pk = partition("update_if_absent");
    store
        .put(PutRequest {
            item: item(&pk, "A", &[("_createdAt", "first".into())]),
            conditions: vec![],
        })
        .await
        .expect("put should succeed");

    let mut set_if_absent = Attributes::new();
    set_if_absent.insert("_createdAt".to_string(), "second".into());
    set_if_absent.insert("origin".to_string(), "blind".into());
    let outcome = store
        .update(UpdateRequest {
            key: key(&pk, "A"),
            set: Attributes::new(),
            set_if_absent,
            increment: vec![("_version".to_string(), 1)],
            conditions: vec![],
        })
        .await
        .expect("update should succeed");

    let WriteOutcome::Applied(output) = outcome else {
        panic!("unconditional update should apply");
    };
    let image = output.attributes.expect("update returns the new image");
    assert_eq!(image.get("_createdAt").and_then(|v| v.as_str()), Some("first"));
    assert_eq!(image.get("origin").and_then(|v| v.as_str()), Some("blind"));
    assert_eq!(image.get("_version").and_then(|v| v.as_u64()), Some(1));
}

// =============================================================================
// delete
// =============================================================================

pub async fn test_delete_returns_old_image<S: KeyValueStore>(store: &S) {
    let pk = partition("delete_old_image");
    let stored = item(&pk, "A", &[("name", "alpha".into())]);
    store
        .put(PutRequest {
            item: stored.clone(),
            conditions: vec![],
        })
        .await
        .expect("put should succeed");

    let outcome = store
        .delete(DeleteRequest {
            key: key(&pk, "A"),
            conditions: vec![Condition::AttributeExists("pk".to_string())],
        })
        .await
        .expect("delete should succeed");

    let WriteOutcome::Applied(output) = outcome else {
        panic!("delete should apply");
    };
    assert_eq!(output.attributes, Some(stored));
    assert_eq!(get(store, &pk, "A").await, None);
}

pub async fn test_delete_missing_with_condition<S: KeyValueStore>(store: &S) {
    let pk = partition("delete_missing");
    let outcome = store
        .delete(DeleteRequest {
            key: key(&pk, "A"),
            conditions: vec![Condition::AttributeExists("pk".to_string())],
        })
        .await
        .expect("condition failure is not an error");
    assert!(matches!(outcome, WriteOutcome::ConditionFailed));
}

// =============================================================================
// query
// =============================================================================

async fn seed<S: KeyValueStore>(store: &S, pk: &str, sort_keys: &[&str]) {
    for sk in sort_keys {
        store
            .put(PutRequest {
                item: item(pk, sk, &[]),
                conditions: vec![],
            })
            .await
            .expect("put should succeed");
    }
}

pub async fn test_query_orders_by_sort_key<S: KeyValueStore>(store: &S) {
    let pk = partition("query_order");
    seed(store, &pk, &["C", "A", "B"]).await;

    let forward = store.query(query(&pk)).await.expect("query should succeed");
    assert_eq!(sort_keys(&forward.items), vec!["A", "B", "C"]);

    let backward = store
        .query(QueryRequest {
            scan_forward: false,
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&backward.items), vec!["C", "B", "A"]);
}

pub async fn test_query_begins_with<S: KeyValueStore>(store: &S) {
    let pk = partition("query_prefix");
    seed(store, &pk, &["ORDER#1", "ORDER#2", "PROFILE"]).await;

    let output = store
        .query(QueryRequest {
            sort_condition: Some(SortCondition::BeginsWith("ORDER#".to_string())),
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&output.items), vec!["ORDER#1", "ORDER#2"]);

    let exact = store
        .query(QueryRequest {
            sort_condition: Some(SortCondition::Equals("PROFILE".into())),
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&exact.items), vec!["PROFILE"]);
}

pub async fn test_query_pagination<S: KeyValueStore>(store: &S) {
    let pk = partition("query_pages");
    seed(store, &pk, &["A", "B", "C"]).await;

    let first = store
        .query(QueryRequest {
            limit: Some(2),
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&first.items), vec!["A", "B"]);
    let start = first
        .last_evaluated_key
        .expect("a truncated page reports where it stopped");

    let second = store
        .query(QueryRequest {
            limit: Some(2),
            exclusive_start_key: Some(start),
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&second.items), vec!["C"]);
    assert!(second.last_evaluated_key.is_none());
}

pub async fn test_query_resumes_after_deleted_cursor_item<S: KeyValueStore>(store: &S) {
    let pk = partition("query_deleted_cursor");
    seed(store, &pk, &["A", "B", "C"]).await;

    let first = store
        .query(QueryRequest {
            limit: Some(2),
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&first.items), vec!["A", "B"]);
    let start = first
        .last_evaluated_key
        .expect("a truncated page reports where it stopped");

    store
        .delete(DeleteRequest {
            key: key(&pk, "B"),
            conditions: vec![],
        })
        .await
        .expect("delete should succeed");

    let second = store
        .query(QueryRequest {
            limit: Some(2),
            exclusive_start_key: Some(start),
            ..query(&pk)
        })
        .await
        .expect("query should succeed");
    assert_eq!(sort_keys(&second.items), vec!["C"]);
}

pub async fn test_query_empty_partition<S: KeyValueStore>(store: &S) {
    let pk = partition("query_empty");
    let output = store.query(query(&pk)).await.expect("query should succeed");
    assert!(output.items.is_empty());
    assert!(output.last_evaluated_key.is_none());
}

/// Run all KeyValueStore tests against a store implementation.
#[macro_export]
macro_rules! run_kv_store_tests {
    ($store:expr) => {
        use $crate::storage::kv_store_tests::*;

        // put / get tests
        test_put_then_get($store).await;
        println!("  test_put_then_get: PASSED");

        test_get_missing_item($store).await;
        println!("  test_get_missing_item: PASSED");

        test_conditional_put_rejects_existing($store).await;
        println!("  test_conditional_put_rejects_existing: PASSED");

        // update tests
        test_update_returns_new_image($store).await;
        println!("  test_update_returns_new_image: PASSED");

        test_update_condition_failure($store).await;
        println!("  test_update_condition_failure: PASSED");

        test_update_requires_existing_item($store).await;
        println!("  test_update_requires_existing_item: PASSED");

        test_update_set_if_absent_keeps_existing_value($store).await;
        println!("  test_update_set_if_absent_keeps_existing_value: PASSED");

        // delete tests
        test_delete_returns_old_image($store).await;
        println!("  test_delete_returns_old_image: PASSED");

        test_delete_missing_with_condition($store).await;
        println!("  test_delete_missing_with_condition: PASSED");

        // query tests
        test_query_orders_by_sort_key($store).await;
        println!("  test_query_orders_by_sort_key: PASSED");

        test_query_begins_with($store).await;
        println!("  test_query_begins_with: PASSED");

        test_query_pagination($store).await;
        println!("  test_query_pagination: PASSED");

        test_query_resumes_after_deleted_cursor_item($store).await;
        println!("  test_query_resumes_after_deleted_cursor_item: PASSED");

        test_query_empty_partition($store).await;
        println!("  test_query_empty_partition: PASSED");
    };
}
