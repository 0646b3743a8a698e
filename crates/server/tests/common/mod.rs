//! Shared fixture: an [`AppState`] wired to in-memory catalog backends
//! and a scripted Scene service, plus helpers to register peers and
//! drive RPCs the way the websocket layer would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use arcor_catalog::scene_service::MeshFocusRequest;
use arcor_catalog::{CachedStore, CatalogBackend};
use arcor_domain::listing::IdDesc;
use arcor_domain::math::{Orientation, Pose, Position};
use arcor_domain::object_type::{
    ActionMeta, Mesh, ModelKind, ObjectModel, ObjectType, ParameterMeta,
};
use arcor_domain::project::Project;
use arcor_domain::scene::{Scene, SceneObject};
use arcor_domain::{Error, Result};
use arcor_protocol::outbox::Outbox;
use arcor_protocol::{RpcRequest, RpcResponse};
use arcor_server::aiming::AimingTable;
use arcor_server::clients::ClientRegistry;
use arcor_server::locks::LockTable;
use arcor_server::object_types::{ModelFetcher, ObjectTypeGraph};
use arcor_server::session::Session;
use arcor_server::state::{AppState, SceneService};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryCollection<T> {
    pub items: Mutex<HashMap<String, T>>,
}

impl<T> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }
}

macro_rules! memory_backend {
    ($ty:ty) => {
        #[async_trait]
        impl CatalogBackend<$ty> for MemoryCollection<$ty> {
            async fn list(&self) -> Result<Vec<IdDesc>> {
                Ok(self
                    .items
                    .lock()
                    .values()
                    .map(|e| IdDesc {
                        id: e.id.clone(),
                        name: e.name.clone(),
                        created: e.created,
                        modified: e.modified,
                        description: e.description.clone(),
                    })
                    .collect())
            }
            async fn get(&self, id: &str) -> Result<$ty> {
                self.items
                    .lock()
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(id.to_owned()))
            }
            async fn put(&self, entity: &$ty) -> Result<DateTime<Utc>> {
                let modified = Utc::now();
                let mut stored = entity.clone();
                stored.modified = Some(modified);
                self.items.lock().insert(stored.id.clone(), stored);
                Ok(modified)
            }
            async fn delete(&self, id: &str) -> Result<()> {
                self.items.lock().remove(id);
                Ok(())
            }
        }
    };
}

memory_backend!(Scene);
memory_backend!(Project);

// Object types have no separate name field; impl by hand.
#[async_trait]
impl CatalogBackend<ObjectType> for MemoryCollection<ObjectType> {
    async fn list(&self) -> Result<Vec<IdDesc>> {
        Ok(self
            .items
            .lock()
            .values()
            .map(|e| IdDesc {
                id: e.id.clone(),
                name: e.id.clone(),
                created: e.created,
                modified: e.modified,
                description: e.description.clone(),
            })
            .collect())
    }
    async fn get(&self, id: &str) -> Result<ObjectType> {
        self.items
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }
    async fn put(&self, entity: &ObjectType) -> Result<DateTime<Utc>> {
        let modified = Utc::now();
        let mut stored = entity.clone();
        stored.modified = Some(modified);
        self.items.lock().insert(stored.id.clone(), stored);
        Ok(modified)
    }
    async fn delete(&self, id: &str) -> Result<()> {
        self.items.lock().remove(id);
        Ok(())
    }
}

pub struct NullModels;

#[async_trait]
impl ModelFetcher for NullModels {
    async fn mesh_model(&self, id: &str) -> Result<ObjectModel> {
        Err(Error::NotFound(format!("model {id}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted scene service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct StubSceneService {
    pub focus_calls: Mutex<Vec<MeshFocusRequest>>,
    pub eef_calls: Mutex<Vec<String>>,
}

pub fn pose_at(x: f64) -> Pose {
    Pose {
        position: Position::new(x, 0.0, 0.0),
        orientation: Orientation::default(),
    }
}

#[async_trait]
impl SceneService for StubSceneService {
    async fn upsert_collision(&self, _object: &SceneObject, _model: &ObjectModel) -> Result<()> {
        Ok(())
    }
    async fn delete_collision(&self, _object_id: &str) -> Result<()> {
        Ok(())
    }
    async fn focus(&self, request: &MeshFocusRequest) -> Result<Pose> {
        self.focus_calls.lock().push(request.clone());
        Ok(pose_at(42.0))
    }
    async fn end_effector_pose(
        &self,
        robot_id: &str,
        _end_effector: &str,
        _arm: Option<&str>,
    ) -> Result<Pose> {
        self.eef_calls.lock().push(robot_id.to_owned());
        Ok(pose_at(self.eef_calls.lock().len() as f64))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TestEnv {
    pub state: AppState,
    pub scenes: Arc<MemoryCollection<Scene>>,
    pub projects: Arc<MemoryCollection<Project>>,
    pub object_types: Arc<MemoryCollection<ObjectType>>,
    pub scene_service: Arc<StubSceneService>,
    next_rpc_id: AtomicU64,
}

fn action(name: &str, params: &[(&str, &str)], returns: &[&str]) -> ActionMeta {
    ActionMeta {
        name: name.to_owned(),
        description: None,
        parameters: params
            .iter()
            .map(|(n, t)| ParameterMeta {
                name: (*n).to_owned(),
                param_type: (*t).to_owned(),
                description: None,
                default_value: None,
            })
            .collect(),
        returns: returns.iter().map(|r| (*r).to_owned()).collect(),
        disabled: false,
        problem: None,
        origins: None,
    }
}

fn object_type(id: &str, base: &str, actions: Vec<ActionMeta>, model: Option<ObjectModel>) -> ObjectType {
    ObjectType {
        id: id.to_owned(),
        base: base.to_owned(),
        description: String::new(),
        source: String::new(),
        built_in: false,
        is_abstract: false,
        has_pose: false,
        disabled: false,
        problem: None,
        model,
        settings: Vec::new(),
        actions,
        created: None,
        modified: Some(Utc::now()),
    }
}

/// Mesh model with two focus points.
pub fn mesh_model() -> ObjectModel {
    ObjectModel {
        id: "tester-mesh".to_owned(),
        kind: ModelKind::Mesh,
        mesh: Some(Mesh {
            id: "tester-mesh".to_owned(),
            uri: None,
            focus_points: vec![pose_at(0.1), pose_at(0.2)],
        }),
    }
}

pub async fn env() -> TestEnv {
    let scenes = Arc::new(MemoryCollection::<Scene>::default());
    let projects = Arc::new(MemoryCollection::<Project>::default());
    let object_types = Arc::new(MemoryCollection::<ObjectType>::default());

    // A small but real type graph: a generic base, an abstract device,
    // a robot, a random generator, a conveyor with a settings schema and
    // a mesh-modelled device to aim at.
    {
        let mut device = object_type("Device", "", vec![], None);
        device.is_abstract = true;
        let mut conveyor = object_type("Conveyor", "Generic", vec![], None);
        conveyor.settings.push(ParameterMeta {
            name: "speed".to_owned(),
            param_type: "double".to_owned(),
            description: None,
            default_value: Some("0.5".to_owned()),
        });

        let mut items = object_types.items.lock();
        for ot in [
            object_type("Generic", "", vec![], None),
            device,
            conveyor,
            object_type("Robot", "Generic", vec![action("home", &[], &[])], None),
            object_type(
                "RandomActions",
                "Generic",
                vec![action("random_double", &[("min_time", "double")], &["double"])],
                None,
            ),
            object_type("Tester", "Generic", vec![], Some(mesh_model())),
        ] {
            items.insert(ot.id.clone(), ot);
        }
    }

    let scene_service = Arc::new(StubSceneService::default());
    let state = AppState {
        config: Arc::new(arcor_domain::config::Config::default()),
        registry: Arc::new(ClientRegistry::new(64)),
        locks: Arc::new(LockTable::new()),
        aiming: Arc::new(AimingTable::new()),
        session: Arc::new(RwLock::new(Session::default())),
        scenes: Arc::new(CachedStore::new(
            "scene",
            scenes.clone(),
            Duration::ZERO,
            8,
        )),
        projects: Arc::new(CachedStore::new(
            "project",
            projects.clone(),
            Duration::ZERO,
            8,
        )),
        object_type_store: Arc::new(CachedStore::new(
            "object type",
            object_types.clone(),
            Duration::ZERO,
            8,
        )),
        graph: Arc::new(ObjectTypeGraph::new()),
        models: Arc::new(NullModels),
        scene_service: scene_service.clone(),
        build: None,
        manager: None,
    };
    state.refresh_object_types().await.unwrap();

    TestEnv {
        state,
        scenes,
        projects,
        object_types,
        scene_service,
        next_rpc_id: AtomicU64::new(1),
    }
}

impl TestEnv {
    /// Register a peer connection and bind a user to it.
    pub async fn login(&self, user: &str) -> (u64, Arc<Outbox>) {
        let (peer, outbox) = self.state.registry.register_connection();
        let response = self
            .call(peer, "RegisterUser", serde_json::json!({ "userName": user }))
            .await;
        assert!(response.result, "login failed: {:?}", response.messages);
        (peer, outbox)
    }

    pub async fn call(&self, peer: u64, request: &str, args: serde_json::Value) -> RpcResponse {
        self.call_inner(peer, request, args, false).await
    }

    pub async fn dry_call(&self, peer: u64, request: &str, args: serde_json::Value) -> RpcResponse {
        self.call_inner(peer, request, args, true).await
    }

    async fn call_inner(
        &self,
        peer: u64,
        request: &str,
        args: serde_json::Value,
        dry_run: bool,
    ) -> RpcResponse {
        let id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        arcor_server::rpc::dispatch(
            &self.state,
            peer,
            RpcRequest {
                request: request.to_owned(),
                id,
                args,
                dry_run,
            },
        )
        .await
    }

    /// Expect success, returning the data payload.
    pub async fn ok(&self, peer: u64, request: &str, args: serde_json::Value) -> serde_json::Value {
        let response = self.call(peer, request, args).await;
        assert!(
            response.result,
            "{request} failed: {:?}",
            response.messages
        );
        response.data
    }

    /// Expect failure, returning the first message.
    pub async fn err(&self, peer: u64, request: &str, args: serde_json::Value) -> String {
        let response = self.call(peer, request, args).await;
        assert!(!response.result, "{request} unexpectedly succeeded");
        response.messages.first().cloned().unwrap_or_default()
    }
}

/// Drain an outbox into (event name, frame) pairs, non-blocking.
pub fn drain_events(outbox: &Outbox) -> Vec<(String, serde_json::Value)> {
    let mut out = Vec::new();
    while let Some(frame) = try_pop(outbox) {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
            out.push((event.to_owned(), value));
        }
    }
    out
}

fn try_pop(outbox: &Outbox) -> Option<String> {
    if outbox.is_empty() {
        None
    } else {
        // pop() resolves immediately when the queue is non-empty.
        futures_util::FutureExt::now_or_never(outbox.pop())
            .flatten()
            .map(|f| f.text)
    }
}
