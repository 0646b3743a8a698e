//! Websocket endpoint of the execution manager.
//!
//! Flow:
//! 1. A peer (normally the server's proxy link) connects.
//! 2. The manager immediately pushes a state snapshot so reconnecting
//!    peers converge without polling.
//! 3. Each inbound request frame spawns a task; the response echoes the
//!    request `id`. Framing errors are logged and dropped.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;

use arcor_domain::Error;
use arcor_protocol::execution::{
    PackageIdArgs, PackageListData, RunPackageArgs, UploadPackageArgs,
};
use arcor_protocol::{events, ChangeType, EventFrame, Frame, RpcRequest, RpcResponse};

use crate::state::AppState;

/// How long one websocket send may take before the peer is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn manager_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (peer_id, outbox) = state.hub.register();
    tracing::info!(peer_id, "peer connected");

    // Snapshot-on-connect: current package state and, during a run, the
    // current action and last exception.
    for frame in state.supervisor.snapshot_events() {
        state.hub.broadcast_to(peer_id, &frame);
    }

    // Writer task: drains the peer's outbox into the socket.
    let writer_outbox = outbox.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_outbox.pop().await {
            let send = ws_sink.send(Message::Text(frame.text));
            match tokio::time::timeout(SEND_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
    });

    // Reader loop: every request spawns its own task.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match Frame::parse(&text) {
                Ok(Frame::Request(request)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let response = dispatch(&state, request).await;
                        state.hub.respond(peer_id, &response);
                    });
                }
                Ok(_) => {
                    tracing::debug!(peer_id, "ignoring non-request frame");
                }
                Err(e) => {
                    tracing::error!(peer_id, error = %e, "dropping malformed frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.remove(peer_id);
    writer.abort();
    tracing::info!(peer_id, "peer disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, Error> {
    serde_json::from_value(args.clone())
        .map_err(|e| Error::Validation(format!("Invalid arguments: {e}.")))
}

async fn dispatch(state: &AppState, request: RpcRequest) -> RpcResponse {
    let name = request.request.clone();
    let id = request.id;
    match handle(state, &request).await {
        Ok(data) => RpcResponse::ok(&name, id, data),
        Err(e) => {
            match e {
                Error::Validation(_) | Error::State(_) | Error::NotFound(_) => {
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

async fn handle(state: &AppState, request: &RpcRequest) -> Result<Value, Error> {
    match request.request.as_str() {
        "RunPackage" => {
            let args: RunPackageArgs = parse_args(&request.args)?;
            if request.dry_run {
                let current = state.supervisor.state_data().state;
                if !current.can_run() {
                    return Err(Error::State(current.refuse("run")));
                }
                return Ok(Value::Null);
            }
            state
                .supervisor
                .run_package(&args.id, args.breakpoints, args.start_paused)
                .await?;
            Ok(Value::Null)
        }
        "StopPackage" => {
            if request.dry_run {
                let current = state.supervisor.state_data().state;
                if !current.can_stop() {
                    return Err(Error::State(current.refuse("stop")));
                }
                return Ok(Value::Null);
            }
            state.supervisor.stop().await?;
            Ok(Value::Null)
        }
        "PausePackage" => {
            if request.dry_run {
                let current = state.supervisor.state_data().state;
                if !current.can_pause() {
                    return Err(Error::State(current.refuse("pause")));
                }
                return Ok(Value::Null);
            }
            state.supervisor.pause().await?;
            Ok(Value::Null)
        }
        "ResumePackage" => {
            if request.dry_run {
                let current = state.supervisor.state_data().state;
                if !current.can_resume() {
                    return Err(Error::State(current.refuse("resume")));
                }
                return Ok(Value::Null);
            }
            state.supervisor.resume().await?;
            Ok(Value::Null)
        }
        "PackageState" => Ok(serde_json::to_value(state.supervisor.state_data())?),
        "ListPackages" => {
            let store = state.store.clone();
            let packages = tokio::task::spawn_blocking(move || store.list())
                .await
                .map_err(|e| Error::Other(e.to_string()))??;
            Ok(serde_json::to_value(PackageListData { packages })?)
        }
        "UploadPackage" => {
            let args: UploadPackageArgs = parse_args(&request.args)?;
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(args.data.as_bytes())
                .map_err(|e| Error::Validation(format!("Invalid package data: {e}.")))?;
            if request.dry_run {
                return Ok(Value::Null);
            }
            let updating = state.store.exists(&args.id);
            let store = state.store.clone();
            let pkg_id = args.id.clone();
            let summary = tokio::task::spawn_blocking(move || store.upload(&pkg_id, &bytes))
                .await
                .map_err(|e| Error::Other(e.to_string()))??;
            state.hub.broadcast(&EventFrame::with_change(
                events::PACKAGE_CHANGED,
                serde_json::to_value(&summary)?,
                if updating {
                    ChangeType::Update
                } else {
                    ChangeType::Add
                },
            ));
            Ok(Value::Null)
        }
        "DeletePackage" => {
            let args: PackageIdArgs = parse_args(&request.args)?;
            if state.supervisor.running_package().as_deref() == Some(args.id.as_str()) {
                return Err(Error::State(format!(
                    "Package {} is currently running.",
                    args.id
                )));
            }
            if request.dry_run {
                if !state.store.exists(&args.id) {
                    return Err(Error::NotFound(format!("Package {}", args.id)));
                }
                return Ok(Value::Null);
            }
            let summary = state.store.info(&args.id)?;
            state.store.delete(&args.id)?;
            state.hub.broadcast(&EventFrame::with_change(
                events::PACKAGE_CHANGED,
                serde_json::to_value(&summary)?,
                ChangeType::Remove,
            ));
            Ok(Value::Null)
        }
        "PackageInfo" => {
            let args: PackageIdArgs = parse_args(&request.args)?;
            Ok(serde_json::to_value(state.store.info(&args.id)?)?)
        }
        unknown => Err(Error::Validation(format!("Unknown request '{unknown}'."))),
    }
}
