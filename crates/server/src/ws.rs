//! UI websocket endpoint.
//!
//! Every inbound request frame spawns its own task; responses echo the
//! request id, so out-of-order completion is fine. On disconnect the
//! user's locks survive for the auto-release window.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use arcor_protocol::Frame;

use crate::rpc;
use crate::state::AppState;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn ui_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (peer_id, outbox) = state.registry.register_connection();
    tracing::info!(peer_id, "client connected");

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

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match Frame::parse(&text) {
                Ok(Frame::Request(request)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let response = rpc::dispatch(&state, peer_id, request).await;
                        state.registry.respond(peer_id, &response);
                    });
                }
                Ok(_) => {
                    tracing::debug!(peer_id, "ignoring non-request frame from client");
                }
                Err(e) => {
                    // Framing errors get no response; the connection stays.
                    tracing::error!(peer_id, error = %e, "dropping malformed frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let user = state.registry.remove_connection(peer_id);
    writer.abort();
    tracing::info!(peer_id, user = user.as_deref().unwrap_or("-"), "client disconnected");

    // Locks survive a short disconnect; the timer drops them unless the
    // user re-registers first.
    if let Some(user) = user {
        if !state.registry.is_user_connected(&user) {
            arm_auto_release(state, user);
        }
    }
}

fn arm_auto_release(state: AppState, user: String) {
    let token = state.registry.arm_release(&user);
    let window = Duration::from_secs(state.config.server.lock_release_secs);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(window) => {
                tracing::info!(user = %user, "auto-releasing locks after disconnect");
                state.release_user(&user);
            }
            _ = token.cancelled() => {
                tracing::debug!(user = %user, "auto-release cancelled by re-login");
            }
        }
    });
}
