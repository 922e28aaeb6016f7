//! Integration tests for the invalidation relay over an in-process bus.
//!
//! Two "instances" share one bus; each wraps its own memory backend.

use cachet_core::prelude::*;
use cachet_core::InProcessBus;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn instance(bus: &InProcessBus) -> (CacheInvalidator, Arc<MemoryCachingBackend>) {
    let memory = Arc::new(MemoryCachingBackend::new());
    let invalidator = CacheInvalidator::new(
        memory.clone(),
        Arc::new(bus.connect()),
        CacheInvalidatorOptions {
            prefix: "app".to_string(),
        },
    )
    .await
    .unwrap();
    (invalidator, memory)
}

async fn gone(memory: &MemoryCachingBackend, key: &str) -> bool {
    for _ in 0..100 {
        if !memory.contains_item(key).await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_removal_reaches_peer_instance() {
    let bus = InProcessBus::new();
    let (a, memory_a) = instance(&bus).await;
    let (_b, memory_b) = instance(&bus).await;

    for memory in [&memory_a, &memory_b] {
        memory.set_item("k", CacheItem::new(json!(1))).await.unwrap();
    }

    a.remove_item("k").await.unwrap();

    assert!(!memory_a.contains_item("k").await.unwrap());
    assert!(gone(&memory_b, "k").await);
}

#[tokio::test]
async fn test_dependency_invalidation_reaches_peer_instance() {
    let bus = InProcessBus::new();
    let (a, _memory_a) = instance(&bus).await;
    let (_b, memory_b) = instance(&bus).await;

    memory_b
        .set_item("user:1", CacheItem::new(json!("ada")).with_dependencies(["tenant:42"]))
        .await
        .unwrap();

    a.invalidate_dependency("tenant:42").await.unwrap();

    assert!(gone(&memory_b, "user:1").await);
    assert!(!memory_b.contains_dependency("tenant:42").await.unwrap());
}

#[tokio::test]
async fn test_own_messages_are_not_reapplied() {
    let bus = InProcessBus::new();
    let (a, memory_a) = instance(&bus).await;

    a.remove_item("k").await.unwrap();
    a.when_background_tasks_completed().await;

    // The echo arrives after publishing; a value stored in between survives it.
    memory_a.set_item("k", CacheItem::new(json!(2))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.when_background_tasks_completed().await;

    assert!(memory_a.contains_item("k").await.unwrap());
    assert_eq!(a.background_task_exceptions(), 0);
}

#[tokio::test]
async fn test_other_prefix_is_ignored() {
    let bus = InProcessBus::new();
    let (a, memory_a) = instance(&bus).await;
    let other = CacheInvalidator::new(
        Arc::new(MemoryCachingBackend::new()),
        Arc::new(bus.connect()),
        CacheInvalidatorOptions {
            prefix: "other-app".to_string(),
        },
    )
    .await
    .unwrap();

    memory_a.set_item("k", CacheItem::new(json!(1))).await.unwrap();
    other.remove_item("k").await.unwrap();
    other.when_background_tasks_completed().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.when_background_tasks_completed().await;

    assert!(memory_a.contains_item("k").await.unwrap());
}
