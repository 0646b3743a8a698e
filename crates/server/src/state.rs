use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use arcor_catalog::scene_service::MeshFocusRequest;
use arcor_catalog::{BuildClient, CachedStore, SceneServiceClient};
use arcor_domain::config::Config;
use arcor_domain::math::Pose;
use arcor_domain::object_type::{ObjectModel, ObjectType};
use arcor_domain::project::Project;
use arcor_domain::scene::{Scene, SceneObject};
use arcor_domain::Result;
use arcor_protocol::frames::ChangeType;
use arcor_protocol::{events, EventFrame};

use crate::aiming::AimingTable;
use crate::clients::ClientRegistry;
use crate::locks::LockTable;
use crate::manager_link::ManagerLink;
use crate::object_types::{ModelFetcher, ObjectTypeGraph};
use crate::session::Session;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scene service seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The slice of the Scene service the server consumes. Behind a trait
/// so tests can run against an in-memory stub.
#[async_trait]
pub trait SceneService: Send + Sync {
    async fn upsert_collision(&self, object: &SceneObject, model: &ObjectModel) -> Result<()>;
    async fn delete_collision(&self, object_id: &str) -> Result<()>;
    async fn focus(&self, request: &MeshFocusRequest) -> Result<Pose>;
    async fn end_effector_pose(
        &self,
        robot_id: &str,
        end_effector: &str,
        arm: Option<&str>,
    ) -> Result<Pose>;
}

#[async_trait]
impl SceneService for SceneServiceClient {
    async fn upsert_collision(&self, object: &SceneObject, model: &ObjectModel) -> Result<()> {
        SceneServiceClient::upsert_collision(self, object, model).await
    }
    async fn delete_collision(&self, object_id: &str) -> Result<()> {
        SceneServiceClient::delete_collision(self, object_id).await
    }
    async fn focus(&self, request: &MeshFocusRequest) -> Result<Pose> {
        SceneServiceClient::focus(self, request).await
    }
    async fn end_effector_pose(
        &self,
        robot_id: &str,
        end_effector: &str,
        arm: Option<&str>,
    ) -> Result<Pose> {
        SceneServiceClient::end_effector_pose(self, robot_id, end_effector, arm).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Application state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared state handed to the websocket handler and every RPC task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ClientRegistry>,
    pub locks: Arc<LockTable>,
    pub aiming: Arc<AimingTable>,
    /// The single open editing session; only touched synchronously.
    pub session: Arc<RwLock<Session>>,
    pub scenes: Arc<CachedStore<Scene>>,
    pub projects: Arc<CachedStore<Project>>,
    pub object_type_store: Arc<CachedStore<ObjectType>>,
    pub graph: Arc<ObjectTypeGraph>,
    pub models: Arc<dyn ModelFetcher>,
    pub scene_service: Arc<dyn SceneService>,
    /// `None` when the build service is not configured (tests).
    pub build: Option<Arc<BuildClient>>,
    /// `None` while no execution manager link is up (tests).
    pub manager: Option<Arc<ManagerLink>>,
}

impl AppState {
    /// Refresh the object-type graph and fan out the deltas as
    /// `ChangedObjectTypes` events, one per non-empty change kind.
    pub async fn refresh_object_types(&self) -> Result<()> {
        let delta = self.graph.refresh(&self.object_type_store, &*self.models).await?;
        for (change, types) in [
            (ChangeType::Add, &delta.added),
            (ChangeType::Update, &delta.updated),
            (ChangeType::Remove, &delta.removed),
        ] {
            if types.is_empty() {
                continue;
            }
            self.registry.broadcast(
                &EventFrame::with_change(
                    events::CHANGED_OBJECT_TYPES,
                    serde_json::to_value(types)?,
                    change,
                ),
                None,
            );
        }
        Ok(())
    }

    /// Drop everything a user holds (locks, aiming) and tell peers.
    /// Runs when the auto-release timer fires.
    pub fn release_user(&self, user: &str) {
        let released = self.locks.release_user(user);
        if !released.is_empty() {
            self.registry.broadcast(
                &EventFrame::new(
                    events::OBJECTS_UNLOCKED,
                    serde_json::json!({ "objectIds": released, "owner": user }),
                ),
                None,
            );
        }
        let _ = self.aiming.cancel(user);
        self.registry.clear_release(user);
    }
}
