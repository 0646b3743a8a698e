//! Client for the Scene service: collision geometry, mesh focusing and
//! robot-space geometry reads used by object aiming.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use arcor_domain::config::ServicesConfig;
use arcor_domain::math::{Pose, Position};
use arcor_domain::object_type::ObjectModel;
use arcor_domain::scene::SceneObject;
use arcor_domain::{Error, Result};

#[derive(Debug, Clone)]
pub struct SceneServiceClient {
    http: Client,
    base_url: String,
}

/// Inputs of the mesh focus computation: the model's reference points
/// and the robot poses recorded at each of them, index-aligned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshFocusRequest {
    pub mesh_focus_points: Vec<Pose>,
    pub robot_space_points: Vec<Pose>,
}

impl SceneServiceClient {
    pub fn new(cfg: &ServicesConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.scene_service_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Service {
                service: "scene".to_owned(),
                message: format!("{what} returned {status}: {body}"),
            });
        }
        Ok(resp)
    }

    /// Upsert the collision shape of one scene object.
    pub async fn upsert_collision(
        &self,
        object: &SceneObject,
        model: &ObjectModel,
    ) -> Result<()> {
        let body = serde_json::json!({
            "id": object.id,
            "pose": object.pose,
            "model": model,
        });
        let resp = self
            .http
            .put(self.url(&format!("/collisions/{}", object.id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::check(resp, "collision upsert").await?;
        Ok(())
    }

    pub async fn delete_collision(&self, object_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/collisions/{object_id}")))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::check(resp, "collision delete").await?;
        Ok(())
    }

    /// Compute the pose aligning a mesh with the recorded robot points.
    pub async fn focus(&self, request: &MeshFocusRequest) -> Result<Pose> {
        let resp = self
            .http
            .put(self.url("/utils/focus"))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let resp = Self::check(resp, "mesh focus").await?;
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    /// Current pose of a robot end effector, in scene space.
    pub async fn end_effector_pose(
        &self,
        robot_id: &str,
        end_effector: &str,
        arm: Option<&str>,
    ) -> Result<Pose> {
        let mut req = self
            .http
            .get(self.url(&format!("/robots/{robot_id}/eef/{end_effector}/pose")));
        if let Some(arm) = arm {
            req = req.query(&[("arm", arm)]);
        }
        let resp = req.send().await.map_err(|e| Error::Http(e.to_string()))?;
        let resp = Self::check(resp, "eef pose").await?;
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    /// Whether a straight line between the two points is collision-free.
    pub async fn line_safe(&self, from: &Position, to: &Position) -> Result<bool> {
        let body = serde_json::json!({ "from": from, "to": to });
        let resp = self
            .http
            .put(self.url("/utils/line-safe"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let resp = Self::check(resp, "line check").await?;
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }
}
