//! Cached adapters to the collaborator services.
//!
//! The Project/Storage service is wrapped in per-kind two-level caches
//! (TTL'd listing map + LRU full entities); the Scene and Build services
//! are thin typed clients. All HTTP goes through one retry engine:
//! bounded retry with exponential backoff on transient failures, no
//! retry on 4xx.

pub mod build;
pub mod cache;
pub mod client;
pub mod scene_service;

pub use build::{BuildClient, PublishOutcome};
pub use cache::{CachedStore, CatalogBackend, CatalogEntity};
pub use client::PersistenceClient;
pub use scene_service::SceneServiceClient;
