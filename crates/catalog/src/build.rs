//! Client for the Build service.
//!
//! One endpoint matters to the control plane: publishing a project as an
//! execution package zip. A 4xx answer means the package must be rebuilt
//! before it can be served; a 5xx is fatal for the attempt.

use std::time::Duration;

use reqwest::Client;

use arcor_domain::config::ServicesConfig;
use arcor_domain::{Error, Result};

#[derive(Debug, Clone)]
pub struct BuildClient {
    http: Client,
    base_url: String,
}

/// Outcome of a publish request.
#[derive(Debug)]
pub enum PublishOutcome {
    /// The zip archive bytes.
    Package(Vec<u8>),
    /// The service answered 4xx: no current build exists for the id.
    NeedsRebuild(String),
}

impl BuildClient {
    pub fn new(cfg: &ServicesConfig) -> Result<Self> {
        let http = Client::builder()
            // Package downloads can be large; give them more room than
            // the regular service timeout.
            .timeout(Duration::from_millis(cfg.timeout_ms * 4))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.build_url.trim_end_matches('/').to_owned(),
        })
    }

    /// `GET /project/<id>/publish?packageName=<name>` → zip bytes.
    pub async fn publish(&self, project_id: &str, package_name: &str) -> Result<PublishOutcome> {
        let url = format!("{}/project/{project_id}/publish", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("packageName", package_name)])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(PublishOutcome::NeedsRebuild(format!(
                "build service refused {project_id}: {status} {body}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Service {
                service: "build".to_owned(),
                message: format!("publish returned {status}: {body}"),
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(PublishOutcome::Package(bytes.to_vec()))
    }
}
