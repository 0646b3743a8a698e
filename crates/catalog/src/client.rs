//! Typed client for the Project/Storage service.
//!
//! Wraps a `reqwest::Client` and translates CRUD on scenes, projects,
//! object types and models into HTTP calls, with automatic retry +
//! exponential backoff on transient (5xx / timeout) failures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use arcor_domain::config::ServicesConfig;
use arcor_domain::listing::IdDesc;
use arcor_domain::object_type::{ObjectModel, ObjectType};
use arcor_domain::project::Project;
use arcor_domain::scene::Scene;
use arcor_domain::{Error, Result};

use crate::cache::CatalogBackend;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Created once and reused for the process lifetime; the underlying
/// `reqwest::Client` keeps a connection pool.
#[derive(Debug, Clone)]
pub struct PersistenceClient {
    http: Client,
    base_url: String,
    max_retries: u32,
}

impl PersistenceClient {
    pub fn new(cfg: &ServicesConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.persistence_url.trim_end_matches('/').to_owned(),
            max_retries: cfg.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ── retry engine ─────────────────────────────────────────────────

    /// Execute with retry + jittered exponential backoff on 5xx and
    /// timeouts. 4xx is permanent and surfaces immediately.
    async fn execute_with_retry(
        &self,
        endpoint: &str,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        use rand::Rng;

        let mut last_err = Error::Http(format!("{endpoint}: no attempt made"));

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let base_ms = 100 * 2u64.pow(attempt - 1);
                // Jitter desynchronizes retries across callers.
                let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
                tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
            }

            match build_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        let body = resp.text().await.unwrap_or_default();
                        tracing::warn!(endpoint, %status, attempt, "transient catalog error");
                        last_err = Error::Service {
                            service: "persistence".to_owned(),
                            message: format!("{endpoint} returned {status}: {body}"),
                        };
                        continue;
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(Error::NotFound(endpoint.to_owned()));
                    }
                    if status.is_client_error() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(Error::Service {
                            service: "persistence".to_owned(),
                            message: format!("{endpoint} returned {status}: {body}"),
                        });
                    }
                    return Ok(resp);
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(endpoint, attempt, "catalog request timed out");
                    last_err = Error::Http(format!("{endpoint} timed out"));
                }
                Err(e) => return Err(Error::Http(e.to_string())),
            }
        }
        Err(last_err)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .execute_with_retry(path, || self.http.get(&url))
            .await?;
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    /// PUT an entity; the service answers with the assigned `modified`.
    async fn put_json<B: Serialize>(&self, path: &str, body: &B) -> Result<DateTime<Utc>> {
        let url = self.url(path);
        let resp = self
            .execute_with_retry(path, || self.http.put(&url).json(body))
            .await?;
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        self.execute_with_retry(path, || self.http.delete(&url))
            .await?;
        Ok(())
    }

    // ── typed surface ────────────────────────────────────────────────

    pub async fn list_scenes(&self) -> Result<Vec<IdDesc>> {
        self.get_json("/scenes").await
    }

    pub async fn get_scene(&self, id: &str) -> Result<Scene> {
        self.get_json(&format!("/scenes/{id}")).await
    }

    pub async fn put_scene(&self, scene: &Scene) -> Result<DateTime<Utc>> {
        self.put_json("/scenes", scene).await
    }

    pub async fn delete_scene(&self, id: &str) -> Result<()> {
        self.delete(&format!("/scenes/{id}")).await
    }

    pub async fn list_projects(&self) -> Result<Vec<IdDesc>> {
        self.get_json("/projects").await
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        self.get_json(&format!("/projects/{id}")).await
    }

    pub async fn put_project(&self, project: &Project) -> Result<DateTime<Utc>> {
        self.put_json("/projects", project).await
    }

    pub async fn delete_project(&self, id: &str) -> Result<()> {
        self.delete(&format!("/projects/{id}")).await
    }

    pub async fn list_object_types(&self) -> Result<Vec<IdDesc>> {
        self.get_json("/object_types").await
    }

    pub async fn get_object_type(&self, id: &str) -> Result<ObjectType> {
        self.get_json(&format!("/object_types/{id}")).await
    }

    pub async fn put_object_type(&self, ot: &ObjectType) -> Result<DateTime<Utc>> {
        self.put_json("/object_types", ot).await
    }

    pub async fn delete_object_type(&self, id: &str) -> Result<()> {
        self.delete(&format!("/object_types/{id}")).await
    }

    pub async fn get_model(&self, id: &str, kind: &str) -> Result<ObjectModel> {
        self.get_json(&format!("/models/{id}/{kind}")).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SceneBackend(pub PersistenceClient);

#[async_trait]
impl CatalogBackend<Scene> for SceneBackend {
    async fn list(&self) -> Result<Vec<IdDesc>> {
        self.0.list_scenes().await
    }
    async fn get(&self, id: &str) -> Result<Scene> {
        self.0.get_scene(id).await
    }
    async fn put(&self, entity: &Scene) -> Result<DateTime<Utc>> {
        self.0.put_scene(entity).await
    }
    async fn delete(&self, id: &str) -> Result<()> {
        self.0.delete_scene(id).await
    }
}

pub struct ProjectBackend(pub PersistenceClient);

#[async_trait]
impl CatalogBackend<Project> for ProjectBackend {
    async fn list(&self) -> Result<Vec<IdDesc>> {
        self.0.list_projects().await
    }
    async fn get(&self, id: &str) -> Result<Project> {
        self.0.get_project(id).await
    }
    async fn put(&self, entity: &Project) -> Result<DateTime<Utc>> {
        self.0.put_project(entity).await
    }
    async fn delete(&self, id: &str) -> Result<()> {
        self.0.delete_project(id).await
    }
}

pub struct ObjectTypeBackend(pub PersistenceClient);

#[async_trait]
impl CatalogBackend<ObjectType> for ObjectTypeBackend {
    async fn list(&self) -> Result<Vec<IdDesc>> {
        self.0.list_object_types().await
    }
    async fn get(&self, id: &str) -> Result<ObjectType> {
        self.0.get_object_type(id).await
    }
    async fn put(&self, entity: &ObjectType) -> Result<DateTime<Utc>> {
        self.0.put_object_type(entity).await
    }
    async fn delete(&self, id: &str) -> Result<()> {
        self.0.delete_object_type(id).await
    }
}
