//! RPC dispatch.
//!
//! Every state-changing handler follows the same envelope: validate
//! inputs, confirm the relevant ids are writeable by the caller, apply
//! the mutation in memory, mark the session dirty, emit the `Changed`
//! events. Nothing persists until an explicit save. A `dryRun` request
//! performs the validation steps and stops before the mutation.

pub mod aiming;
pub mod lock;
pub mod objects;
pub mod project;
pub mod scene;
pub mod users;

use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;

use arcor_domain::{Error, Result};
use arcor_protocol::execution::is_execution_rpc;
use arcor_protocol::{EventFrame, RpcRequest, RpcResponse};

use crate::locks::Topology;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one request's handler needs.
pub struct Ctx<'a> {
    pub state: &'a AppState,
    pub peer_id: u64,
    pub user: String,
    pub dry_run: bool,
}

impl Ctx<'_> {
    /// Fan an event out to every peer. No-op under dry run.
    pub fn broadcast(&self, frame: EventFrame) {
        if !self.dry_run {
            self.state.registry.broadcast(&frame, None);
        }
    }

    /// Fan out excluding the calling peer (lock events).
    pub fn broadcast_to_others(&self, frame: EventFrame) {
        if !self.dry_run {
            self.state.registry.broadcast(&frame, Some(self.peer_id));
        }
    }

    /// Check that mutating each id does not collide with someone
    /// else's lock. The caller's own locks always satisfy this.
    pub fn ensure_writeable<S: AsRef<str>>(&self, topology: &Topology, ids: &[S]) -> Result<()> {
        for id in ids {
            if let Some(message) =
                self.state
                    .locks
                    .conflicts_for(id.as_ref(), &self.user, topology)
            {
                return Err(Error::Lock(message));
            }
        }
        Ok(())
    }

    /// Aiming requires explicitly held write locks, not mere absence of
    /// conflicts.
    pub fn require_write_lock(&self, topology: &Topology, id: &str) -> Result<()> {
        if self.state.locks.is_write_locked_by(id, &self.user, topology) {
            Ok(())
        } else {
            Err(Error::Lock(format!(
                "Object {id} must be write-locked first."
            )))
        }
    }
}

/// Parse the `args` object of a request into a typed value.
pub fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| Error::Validation(format!("Invalid arguments: {e}.")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle one request frame end to end, producing the response frame.
pub async fn dispatch(state: &AppState, peer_id: u64, request: RpcRequest) -> RpcResponse {
    let started = Instant::now();
    let name = request.request.clone();
    let id = request.id;

    let result = route(state, peer_id, request).await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if elapsed_ms > state.config.server.rpc_warn_ms {
        tracing::warn!(request = %name, elapsed_ms, "RPC exceeded soft deadline");
    }

    match result {
        Ok(data) => RpcResponse::ok(&name, id, data),
        Err(e) => {
            match e {
                Error::Validation(_)
                | Error::Lock(_)
                | Error::State(_)
                | Error::NotFound(_)
                | Error::RemovedExternally(_) => {
                    tracing::debug!(request = %name, error = %e, "request refused");
                }
                ref other => {
                    tracing::error!(request = %name, error = %other, "request failed");
                }
            }
            RpcResponse::error(&name, id, vec![e.user_message()])
        }
    }
}

async fn route(state: &AppState, peer_id: u64, request: RpcRequest) -> Result<Value> {
    if request.request == "RegisterUser" {
        return users::register(state, peer_id, &request.args, request.dry_run).await;
    }

    let user = state
        .registry
        .user_of(peer_id)
        .ok_or_else(|| Error::Validation("Register a user first.".to_owned()))?;
    let ctx = Ctx {
        state,
        peer_id,
        user,
        dry_run: request.dry_run,
    };

    // Execution RPCs tunnel to the manager verbatim.
    if is_execution_rpc(&request.request) {
        return proxy_to_manager(&ctx, &request).await;
    }

    let args = request.args;
    match request.request.as_str() {
        // Scenes.
        "ListScenes" => scene::list(&ctx).await,
        "NewScene" => scene::new_scene(&ctx, args).await,
        "OpenScene" => scene::open(&ctx, args).await,
        "SaveScene" => scene::save(&ctx).await,
        "CloseScene" => scene::close(&ctx, args).await,
        "DeleteScene" => scene::delete(&ctx, args).await,
        "RenameScene" => scene::rename(&ctx, args).await,
        "AddObjectToScene" => scene::add_object(&ctx, args).await,
        "UpdateObjectPose" => scene::update_object_pose(&ctx, args).await,
        "RenameObject" => scene::rename_object(&ctx, args).await,
        "RemoveFromScene" => scene::remove_object(&ctx, args).await,

        // Projects.
        "ListProjects" => project::list(&ctx).await,
        "NewProject" => project::new_project(&ctx, args).await,
        "OpenProject" => project::open(&ctx, args).await,
        "SaveProject" => project::save(&ctx).await,
        "CloseProject" => project::close(&ctx, args).await,
        "DeleteProject" => project::delete(&ctx, args).await,
        "RenameProject" => project::rename(&ctx, args).await,
        "AddActionPoint" => project::add_action_point(&ctx, args).await,
        "RemoveActionPoint" => project::remove_action_point(&ctx, args).await,
        "RenameActionPoint" => project::rename_action_point(&ctx, args).await,
        "UpdateActionPointPosition" => project::update_action_point_position(&ctx, args).await,
        "AddAction" => project::add_action(&ctx, args).await,
        "UpdateAction" => project::update_action(&ctx, args).await,
        "RemoveAction" => project::remove_action(&ctx, args).await,
        "AddLogicItem" => project::add_logic_item(&ctx, args).await,
        "UpdateLogicItem" => project::update_logic_item(&ctx, args).await,
        "RemoveLogicItem" => project::remove_logic_item(&ctx, args).await,
        "AddProjectParameter" => project::add_parameter(&ctx, args).await,
        "UpdateProjectParameter" => project::update_parameter(&ctx, args).await,
        "RemoveProjectParameter" => project::remove_parameter(&ctx, args).await,
        "AddOverride" => project::add_override(&ctx, args).await,
        "UpdateOverride" => project::update_override(&ctx, args).await,
        "DeleteOverride" => project::delete_override(&ctx, args).await,
        "BuildProject" => project::build(&ctx, args).await,

        // Object types.
        "GetObjectTypes" => objects::get_object_types(&ctx).await,
        "GetActions" => objects::get_actions(&ctx, args).await,

        // Locks.
        "ReadLock" => lock::read_lock(&ctx, args).await,
        "ReadUnlock" => lock::read_unlock(&ctx, args).await,
        "WriteLock" => lock::write_lock(&ctx, args).await,
        "WriteUnlock" => lock::write_unlock(&ctx, args).await,
        "UpdateLock" => lock::update_lock(&ctx, args).await,

        // Object aiming.
        "ObjectAimingStart" => aiming::start(&ctx, args).await,
        "ObjectAimingAddPoint" => aiming::add_point(&ctx, args).await,
        "ObjectAimingCancel" => aiming::cancel(&ctx).await,
        "ObjectAimingDone" => aiming::done(&ctx).await,

        unknown => Err(Error::Validation(format!("Unknown request '{unknown}'."))),
    }
}

/// Forward an execution RPC over the manager link; the manager's
/// verdict maps back onto this caller's response.
async fn proxy_to_manager(ctx: &Ctx<'_>, request: &RpcRequest) -> Result<Value> {
    let link = ctx.state.manager.as_ref().ok_or_else(|| Error::Service {
        service: "execution".to_owned(),
        message: "not configured".to_owned(),
    })?;
    let response = link
        .call(&request.request, request.args.clone(), request.dry_run)
        .await?;
    if response.result {
        Ok(response.data)
    } else {
        Err(Error::State(response.messages.join(" ")))
    }
}
