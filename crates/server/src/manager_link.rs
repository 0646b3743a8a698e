//! Persistent websocket link to the execution manager.
//!
//! The server proxies execution RPCs over this link with its own
//! correlation ids and relays every manager event to the UI peers,
//! preserving manager order. The link reconnects with backoff; while
//! disconnected, execution RPCs fail as a domain error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use arcor_domain::{Error, Result};
use arcor_protocol::execution::PackageState;
use arcor_protocol::{events, EventFrame, Frame, RpcRequest, RpcResponse};

use crate::clients::ClientRegistry;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct ManagerLink {
    url: String,
    registry: Arc<ClientRegistry>,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>,
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// Package whose run this server initiated; drives `ShowMainScreen`
    /// when the post-run `Stopped` arrives.
    last_run: Mutex<Option<String>>,
    call_timeout: Duration,
}

impl ManagerLink {
    pub fn new(url: &str, registry: Arc<ClientRegistry>, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_owned(),
            registry,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            last_run: Mutex::new(None),
            call_timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Run the connect loop until shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let link = self.clone();
        tokio::spawn(async move {
            let mut delay = RECONNECT_MIN;
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                tracing::info!(url = %link.url, "connecting to execution manager");
                let result = tokio::select! {
                    r = link.connect_and_run() => r,
                    _ = shutdown.cancelled() => return,
                };
                match result {
                    Ok(()) => {
                        tracing::warn!("execution manager connection closed");
                        delay = RECONNECT_MIN;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "execution manager connection failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
                delay = (delay * 2).min(RECONNECT_MAX);
            }
        });
    }

    /// One connection lifecycle: connect, pump frames, clean up.
    async fn connect_and_run(&self) -> std::result::Result<(), anyhow::Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        *self.outbound.lock() = Some(outbound_tx);
        tracing::info!("connected to execution manager");

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => match Frame::parse(&text) {
                    Ok(Frame::Response(response)) => self.complete(response),
                    Ok(Frame::Event(event)) => self.relay_event(event),
                    Ok(Frame::Request(_)) => {
                        tracing::debug!("ignoring request frame from manager");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dropping malformed manager frame");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        *self.outbound.lock() = None;
        self.fail_pending("execution manager disconnected");
        writer.abort();
        Ok(())
    }

    // ── RPC proxying ─────────────────────────────────────────────────

    /// Forward an execution RPC and await the correlated response.
    /// The caller rewrites the returned response onto its own `id`.
    pub async fn call(&self, request: &str, args: Value, dry_run: bool) -> Result<RpcResponse> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| Error::Service {
                service: "execution".to_owned(),
                message: "not connected".to_owned(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = RpcRequest {
            request: request.to_owned(),
            id,
            args: args.clone(),
            dry_run,
        };
        let text = serde_json::to_string(&frame)?;
        if sender.send(text).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Service {
                service: "execution".to_owned(),
                message: "send failed".to_owned(),
            });
        }

        let response = match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(Error::Service {
                    service: "execution".to_owned(),
                    message: "disconnected before responding".to_owned(),
                });
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(Error::Service {
                    service: "execution".to_owned(),
                    message: format!("no response within {:?}", self.call_timeout),
                });
            }
        };

        if response.result && request == "RunPackage" && !dry_run {
            let package = args.get("id").and_then(Value::as_str).map(str::to_owned);
            *self.last_run.lock() = package;
        }
        Ok(response)
    }

    fn complete(&self, response: RpcResponse) {
        if let Some(tx) = self.pending.lock().remove(&response.id) {
            let _ = tx.send(response);
        } else {
            tracing::warn!(id = response.id, "response for unknown correlation id");
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        let count = drained.len();
        for (id, tx) in drained {
            let _ = tx.send(RpcResponse::error("", id, vec![reason.to_owned()]));
        }
        if count > 0 {
            tracing::warn!(count, "failed in-flight execution RPCs");
        }
    }

    // ── event relay ──────────────────────────────────────────────────

    /// Push a manager event to every UI peer, in manager order, and
    /// derive the post-run main-screen hint.
    fn relay_event(&self, frame: EventFrame) {
        let stopped = frame.event == events::PACKAGE_STATE
            && frame
                .data
                .get("state")
                .and_then(|s| serde_json::from_value::<PackageState>(s.clone()).ok())
                == Some(PackageState::Stopped);

        self.registry.broadcast(&frame, None);

        if stopped {
            if let Some(package_id) = self.last_run.lock().take() {
                self.registry.broadcast(
                    &EventFrame::new(
                        events::SHOW_MAIN_SCREEN,
                        serde_json::json!({
                            "what": "PackagesList",
                            "highlight": package_id,
                        }),
                    ),
                    None,
                );
            }
        }
    }
}
