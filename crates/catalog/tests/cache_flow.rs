//! Exercises the two-level cache against an in-memory backend:
//! TTL-driven listing refresh, `modified`-driven entity refetch, LRU
//! eviction and the removed-externally path an open session relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use arcor_catalog::{CachedStore, CatalogBackend};
use arcor_domain::listing::IdDesc;
use arcor_domain::scene::Scene;
use arcor_domain::{Error, Result};

// ── in-memory backend ───────────────────────────────────────────────

#[derive(Default)]
struct MemoryBackend {
    scenes: Mutex<HashMap<String, Scene>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryBackend {
    fn insert(&self, mut scene: Scene, modified: DateTime<Utc>) {
        scene.modified = Some(modified);
        self.scenes.lock().insert(scene.id.clone(), scene);
    }

    fn remove(&self, id: &str) {
        self.scenes.lock().remove(id);
    }
}

#[async_trait]
impl CatalogBackend<Scene> for MemoryBackend {
    async fn list(&self) -> Result<Vec<IdDesc>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .scenes
            .lock()
            .values()
            .map(|s| IdDesc {
                id: s.id.clone(),
                name: s.name.clone(),
                created: None,
                modified: s.modified,
                description: s.description.clone(),
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Scene> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.scenes
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    async fn put(&self, entity: &Scene) -> Result<DateTime<Utc>> {
        let modified = Utc::now();
        let mut stored = entity.clone();
        stored.modified = Some(modified);
        self.scenes.lock().insert(stored.id.clone(), stored);
        Ok(modified)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.scenes.lock().remove(id);
        Ok(())
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn store(backend: Arc<MemoryBackend>, ttl: Duration, capacity: usize) -> CachedStore<Scene> {
    CachedStore::new("scene", backend, ttl, capacity)
}

// ── tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn cached_entity_served_while_fresh() {
    let backend = Arc::new(MemoryBackend::default());
    backend.insert(Scene::new("one", ""), ts(100));
    let id = backend.scenes.lock().keys().next().unwrap().clone();

    let store = store(backend.clone(), Duration::from_secs(60), 8);
    store.get(&id).await.unwrap();
    store.get(&id).await.unwrap();
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn newer_listing_modified_triggers_refetch() {
    let backend = Arc::new(MemoryBackend::default());
    backend.insert(Scene::new("one", ""), ts(100));
    let id = backend.scenes.lock().keys().next().unwrap().clone();

    // TTL zero: every read re-reads the listing.
    let store = store(backend.clone(), Duration::ZERO, 8);
    store.get(&id).await.unwrap();

    // Simulate an external update bumping `modified`.
    let scene = backend.scenes.lock().get(&id).cloned().unwrap();
    backend.insert(scene, ts(200));

    let fetched = store.get(&id).await.unwrap();
    assert_eq!(fetched.modified, Some(ts(200)));
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn external_delete_surfaces_as_removed_externally() {
    let backend = Arc::new(MemoryBackend::default());
    backend.insert(Scene::new("one", ""), ts(100));
    let id = backend.scenes.lock().keys().next().unwrap().clone();

    let store = store(backend.clone(), Duration::ZERO, 8);
    store.get(&id).await.unwrap();

    backend.remove(&id);
    match store.get(&id).await {
        Err(Error::RemovedExternally(what)) => assert!(what.contains(&id)),
        other => panic!("expected RemovedExternally, got {other:?}"),
    }
    // The listing no longer contains it either.
    assert!(store.listing().await.unwrap().iter().all(|d| d.id != id));
}

#[tokio::test]
async fn listing_respects_ttl() {
    let backend = Arc::new(MemoryBackend::default());
    backend.insert(Scene::new("one", ""), ts(100));

    let store = store(backend.clone(), Duration::from_secs(60), 8);
    store.listing().await.unwrap();
    store.listing().await.unwrap();
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);

    store.invalidate_listing();
    store.listing().await.unwrap();
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn put_updates_both_levels() {
    let backend = Arc::new(MemoryBackend::default());
    let store = store(backend.clone(), Duration::from_secs(60), 8);

    // Warm the (empty) listing so a stale copy would be visible.
    assert!(store.listing().await.unwrap().is_empty());

    let scene = Scene::new("fresh", "d");
    let id = scene.id.clone();
    let modified = store.put(scene).await.unwrap();

    let listed = store.listing().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].modified, Some(modified));

    // Served from cache, no backend get.
    store.get(&id).await.unwrap();
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lru_evicts_but_correctness_survives() {
    let backend = Arc::new(MemoryBackend::default());
    let mut ids = Vec::new();
    for i in 0..3 {
        let scene = Scene::new(&format!("s{i}"), "");
        ids.push(scene.id.clone());
        backend.insert(scene, ts(100 + i));
    }

    let store = store(backend.clone(), Duration::from_secs(60), 2);
    for id in &ids {
        store.get(id).await.unwrap();
    }
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 3);

    // First id was evicted by capacity 2; reading it again refetches.
    store.get(&ids[0]).await.unwrap();
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 4);

    // The other two are still warm.
    store.get(&ids[2]).await.unwrap();
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 4);
}
