//! Integration tests for the memory backend and the caching service.
//!
//! These tests exercise the reverse dependency index under mixed and
//! concurrent workloads, and the end-to-end dependency scenario through
//! `CachingService`.

use cachet_core::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

fn drain(events: &mut broadcast::Receiver<BackendEvent>) -> Vec<BackendEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Deterministic pseudo-random sequence, good enough to shuffle operations.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[tokio::test]
async fn test_dependency_index_survives_mixed_operations() {
    let backend = MemoryCachingBackend::new();
    let mut rng = Lcg(7);

    for _ in 0..2_000 {
        let key = format!("item:{}", rng.next(40));
        let dep = format!("dep:{}", rng.next(10));
        match rng.next(5) {
            0 | 1 => {
                let other = format!("dep:{}", rng.next(10));
                let item = CacheItem::new(json!(1)).with_dependencies([dep, other]);
                assert_ok!(backend.set_item(&key, item).await);
            }
            2 => assert_ok!(backend.remove_item(&key).await),
            3 => assert_ok!(backend.invalidate_dependency(&dep).await),
            _ => {
                let _ = assert_ok!(backend.get_item(&key, true).await);
            }
        }
    }

    assert_ok!(backend.check_dependency_invariant());
}

#[tokio::test]
async fn test_invalidation_removes_each_dependent_exactly_once() {
    let backend = MemoryCachingBackend::new();
    let mut events = backend.subscribe();

    for i in 0..5 {
        let item = CacheItem::new(json!(i)).with_dependencies(["shared", "also-shared"]);
        backend.set_item(&format!("k{i}"), item).await.unwrap();
    }
    backend
        .set_item("unrelated", CacheItem::new(json!(0)).with_dependencies(["other"]))
        .await
        .unwrap();

    backend.invalidate_dependency("shared").await.unwrap();
    backend.invalidate_dependency("also-shared").await.unwrap();

    let mut removed: HashMap<String, usize> = HashMap::new();
    for event in drain(&mut events) {
        if let BackendEvent::ItemRemoved { key, reason, .. } = event {
            assert_eq!(reason, CacheItemRemovedReason::Invalidated);
            *removed.entry(key).or_default() += 1;
        }
    }
    assert_eq!(removed.len(), 5);
    assert!(removed.values().all(|count| *count == 1));
    assert!(backend.contains_item("unrelated").await.unwrap());
    assert!(!backend.contains_dependency("shared").await.unwrap());
    assert!(backend.contains_dependency("other").await.unwrap());
}

#[tokio::test]
async fn test_removal_is_idempotent() {
    let backend = MemoryCachingBackend::new();
    let mut events = backend.subscribe();
    backend.set_item("k", CacheItem::new(json!(1))).await.unwrap();

    backend.remove_item("k").await.unwrap();
    backend.remove_item("k").await.unwrap();
    backend.remove_item("never-there").await.unwrap();

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![BackendEvent::item_removed("k", CacheItemRemovedReason::Removed, backend.id())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_index_consistent() {
    let backend = MemoryCachingBackend::new();
    let mut tasks = Vec::new();

    for worker in 0..8u64 {
        let backend = backend.clone();
        tasks.push(tokio::spawn(async move {
            let mut rng = Lcg(worker + 1);
            for _ in 0..500 {
                let key = format!("item:{}", rng.next(16));
                let dep = format!("dep:{}", rng.next(4));
                match rng.next(3) {
                    0 => backend
                        .set_item(&key, CacheItem::new(json!(worker)).with_dependencies([dep]))
                        .await
                        .unwrap(),
                    1 => backend.invalidate_dependency(&dep).await.unwrap(),
                    _ => backend.remove_item(&key).await.unwrap(),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    backend.check_dependency_invariant().unwrap();
}

#[tokio::test]
async fn test_tenant_change_invalidates_user_and_page() {
    let memory = Arc::new(MemoryCachingBackend::new());
    let service = CachingService::new(memory.clone());
    let config = CacheItemConfiguration::new();

    let page: String = service
        .get_or_compute("page:home", &config, || async {
            let user: String = service
                .get_or_compute("user:1", &config, || async {
                    add_dependency("tenant:42")?;
                    Ok::<_, CacheError>("ada".to_string())
                })
                .await?;
            Ok::<_, CacheError>(format!("<h1>{user}</h1>"))
        })
        .await
        .unwrap();
    assert_eq!(page, "<h1>ada</h1>");

    let user = memory.get_item("user:1", true).await.unwrap().unwrap();
    assert_eq!(user.dependencies, vec!["tenant:42".to_string()]);

    let mut events = memory.subscribe();
    service.invalidate("tenant:42").await.unwrap();

    assert!(!memory.contains_item("user:1").await.unwrap());
    assert!(!memory.contains_item("page:home").await.unwrap());
    let removed: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            BackendEvent::ItemRemoved { key, .. } => Some(key),
            BackendEvent::DependencyInvalidated { .. } => None,
        })
        .collect();
    assert_eq!(removed.len(), 2);
    memory.check_dependency_invariant().unwrap();
}

#[tokio::test]
async fn test_disposed_backend_rejects_operations() {
    let backend = MemoryCachingBackend::new();
    backend.set_item("k", CacheItem::new(json!(1))).await.unwrap();

    backend.dispose().await;
    backend.dispose().await;

    assert!(backend.is_disposed());
    assert!(backend.get_item("k", false).await.unwrap_err().is_disposed());
    assert!(backend.invalidate_dependency("d").await.unwrap_err().is_disposed());
}
