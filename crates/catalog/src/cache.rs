//! Two-level cache over one catalog collection.
//!
//! Level one is the listing map (id → `IdDesc`) with a coarse TTL; level
//! two is an LRU of full entities. A cached entity is served only while
//! its `modified` matches the listing; an id that disappears from the
//! listing surfaces as [`Error::RemovedExternally`] so an open editing
//! session can tell "deleted under us" from a plain miss.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use arcor_domain::listing::IdDesc;
use arcor_domain::object_type::ObjectType;
use arcor_domain::project::Project;
use arcor_domain::scene::Scene;
use arcor_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The slice of an entity the cache needs to see.
pub trait CatalogEntity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn modified(&self) -> Option<DateTime<Utc>>;
    fn set_modified(&mut self, modified: DateTime<Utc>);
}

macro_rules! impl_catalog_entity {
    ($ty:ty) => {
        impl CatalogEntity for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn name(&self) -> &str {
                &self.name
            }
            fn description(&self) -> &str {
                &self.description
            }
            fn modified(&self) -> Option<DateTime<Utc>> {
                self.modified
            }
            fn set_modified(&mut self, modified: DateTime<Utc>) {
                self.modified = Some(modified);
            }
        }
    };
}

impl_catalog_entity!(Scene);
impl_catalog_entity!(Project);

impl CatalogEntity for ObjectType {
    fn id(&self) -> &str {
        &self.id
    }
    // Object types have no separate display name; the id is the name.
    fn name(&self) -> &str {
        &self.id
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }
    fn set_modified(&mut self, modified: DateTime<Utc>) {
        self.modified = Some(modified);
    }
}

/// Storage operations of one collection; implemented over the
/// Project/Storage HTTP client and by in-memory stubs in tests.
#[async_trait]
pub trait CatalogBackend<T>: Send + Sync {
    async fn list(&self) -> Result<Vec<IdDesc>>;
    async fn get(&self, id: &str) -> Result<T>;
    async fn put(&self, entity: &T) -> Result<DateTime<Utc>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ListingState {
    fetched_at: Option<Instant>,
    items: HashMap<String, IdDesc>,
}

pub struct CachedStore<T> {
    kind: &'static str,
    backend: Arc<dyn CatalogBackend<T>>,
    ttl: Duration,
    listing: RwLock<ListingState>,
    entities: Mutex<LruCache<String, T>>,
    /// Writes serialize per kind; reads only take the sync locks.
    write_gate: tokio::sync::Mutex<()>,
}

impl<T: CatalogEntity> CachedStore<T> {
    pub fn new(
        kind: &'static str,
        backend: Arc<dyn CatalogBackend<T>>,
        ttl: Duration,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            kind,
            backend,
            ttl,
            listing: RwLock::new(ListingState {
                fetched_at: None,
                items: HashMap::new(),
            }),
            entities: Mutex::new(LruCache::new(capacity)),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current listing, refreshed when the TTL has lapsed.
    pub async fn listing(&self) -> Result<Vec<IdDesc>> {
        self.refresh_listing_if_stale().await?;
        let listing = self.listing.read();
        let mut items: Vec<IdDesc> = listing.items.values().cloned().collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    /// Read one entity through both cache levels: refresh the listing
    /// if stale, fail on an id that vanished from it, refetch when the
    /// listing advertises a newer `modified` than the cached copy.
    pub async fn get(&self, id: &str) -> Result<T> {
        self.refresh_listing_if_stale().await?;

        let listed = {
            let listing = self.listing.read();
            listing.items.get(id).map(|desc| desc.modified)
        };
        let listed_modified = match listed {
            Some(modified) => modified,
            None => {
                // Gone from the listing: also drop any stale copy.
                self.entities.lock().pop(id);
                return Err(Error::RemovedExternally(format!("{} {id}", self.kind)));
            }
        };

        if let Some(cached) = self.entities.lock().get(id).cloned() {
            let fresh = match (cached.modified(), listed_modified) {
                (Some(have), Some(want)) => have >= want,
                (_, None) => true,
                (None, Some(_)) => false,
            };
            if fresh {
                return Ok(cached);
            }
        }

        let fetched = self.backend.get(id).await?;
        self.entities.lock().put(id.to_owned(), fetched.clone());
        Ok(fetched)
    }

    /// Persist an entity; both cache levels absorb the new `modified`.
    pub async fn put(&self, mut entity: T) -> Result<DateTime<Utc>> {
        let _gate = self.write_gate.lock().await;
        let modified = self.backend.put(&entity).await?;
        entity.set_modified(modified);

        {
            let mut listing = self.listing.write();
            listing.items.insert(
                entity.id().to_owned(),
                IdDesc {
                    id: entity.id().to_owned(),
                    name: entity.name().to_owned(),
                    created: None,
                    modified: Some(modified),
                    description: entity.description().to_owned(),
                },
            );
        }
        self.entities.lock().put(entity.id().to_owned(), entity);
        Ok(modified)
    }

    /// Delete an entity, purging both cache levels.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.backend.delete(id).await?;
        self.listing.write().items.remove(id);
        self.entities.lock().pop(id);
        Ok(())
    }

    /// Force the next read to consult the service again.
    pub fn invalidate_listing(&self) {
        self.listing.write().fetched_at = None;
    }

    async fn refresh_listing_if_stale(&self) -> Result<()> {
        let stale = {
            let listing = self.listing.read();
            match listing.fetched_at {
                Some(at) => at.elapsed() > self.ttl,
                None => true,
            }
        };
        if !stale {
            return Ok(());
        }

        let fresh = self.backend.list().await?;
        let mut listing = self.listing.write();
        listing.items = fresh.into_iter().map(|d| (d.id.clone(), d)).collect();
        listing.fetched_at = Some(Instant::now());
        Ok(())
    }
}
