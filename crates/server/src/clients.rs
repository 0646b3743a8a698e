//! Registry of UI websocket peers and their identities.
//!
//! A connection starts with a pending identity; `RegisterUser` binds a
//! user name to it. A user who disconnects keeps their locks until the
//! auto-release timer fires; re-registering within the window cancels
//! the timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use arcor_domain::{Error, Result};
use arcor_protocol::outbox::{Outbox, OutboundFrame};
use arcor_protocol::{EventFrame, RpcResponse};

struct Peer {
    outbox: Arc<Outbox>,
    user_name: Option<String>,
}

pub struct ClientRegistry {
    peers: Mutex<HashMap<u64, Peer>>,
    /// Pending lock auto-release timers, keyed by user name.
    release_timers: Mutex<HashMap<String, CancellationToken>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ClientRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            release_timers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    // ── connections ──────────────────────────────────────────────────

    pub fn register_connection(&self) -> (u64, Arc<Outbox>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.queue_capacity));
        self.peers.lock().insert(
            id,
            Peer {
                outbox: outbox.clone(),
                user_name: None,
            },
        );
        (id, outbox)
    }

    /// Bind a user name to a pending connection. Rejects a name already
    /// bound to another live connection; returns whether a pending
    /// auto-release was cancelled (a quick re-login).
    pub fn set_user(&self, peer_id: u64, name: &str) -> Result<bool> {
        {
            let mut peers = self.peers.lock();
            let taken = peers
                .iter()
                .any(|(id, p)| *id != peer_id && p.user_name.as_deref() == Some(name));
            if taken {
                return Err(Error::Validation(format!(
                    "User name '{name}' is already in use."
                )));
            }
            let peer = peers
                .get_mut(&peer_id)
                .ok_or_else(|| Error::NotFound(format!("Connection {peer_id}")))?;
            if peer.user_name.is_some() {
                return Err(Error::Validation("User already registered.".to_owned()));
            }
            peer.user_name = Some(name.to_owned());
        }
        Ok(self.cancel_release(name))
    }

    pub fn user_of(&self, peer_id: u64) -> Option<String> {
        self.peers.lock().get(&peer_id)?.user_name.clone()
    }

    /// Drop a connection; returns the user name that was bound to it.
    pub fn remove_connection(&self, peer_id: u64) -> Option<String> {
        let peer = self.peers.lock().remove(&peer_id)?;
        peer.outbox.close();
        peer.user_name
    }

    pub fn is_user_connected(&self, name: &str) -> bool {
        self.peers
            .lock()
            .values()
            .any(|p| p.user_name.as_deref() == Some(name))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    // ── auto-release timers ──────────────────────────────────────────

    /// Arm the lock auto-release for a disconnected user; the returned
    /// token is cancelled if the user logs back in within the window.
    pub fn arm_release(&self, user: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.release_timers
            .lock()
            .insert(user.to_owned(), token.clone());
        token
    }

    /// Cancel a pending release; `true` when one was armed.
    pub fn cancel_release(&self, user: &str) -> bool {
        if let Some(token) = self.release_timers.lock().remove(user) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Forget a fired timer.
    pub fn clear_release(&self, user: &str) {
        self.release_timers.lock().remove(user);
    }

    // ── delivery ─────────────────────────────────────────────────────

    /// Fan an event out to every registered peer, optionally excluding
    /// one (lock events never echo to their owner).
    pub fn broadcast(&self, frame: &EventFrame, except: Option<u64>) {
        let text = match serde_json::to_string(frame) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, event = %frame.event, "failed to serialize event");
                return;
            }
        };
        let mut dead = Vec::new();
        {
            let peers = self.peers.lock();
            for (id, peer) in peers.iter() {
                if Some(*id) == except || peer.user_name.is_none() {
                    continue;
                }
                if !peer
                    .outbox
                    .push(OutboundFrame::event(&frame.event, text.clone()))
                {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            tracing::warn!(peer_id = id, "peer cannot keep up, dropping");
            self.remove_connection(id);
        }
    }

    /// Queue an event towards a single peer.
    pub fn send_to(&self, peer_id: u64, frame: &EventFrame) {
        let Some(outbox) = self.peers.lock().get(&peer_id).map(|p| p.outbox.clone()) else {
            return;
        };
        match serde_json::to_string(frame) {
            Ok(text) => {
                if !outbox.push(OutboundFrame::event(&frame.event, text)) {
                    self.remove_connection(peer_id);
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize event"),
        }
    }

    /// Queue an RPC response; responses are never dropped.
    pub fn respond(&self, peer_id: u64, response: &RpcResponse) {
        let Some(outbox) = self.peers.lock().get(&peer_id).map(|p| p.outbox.clone()) else {
            return;
        };
        match serde_json::to_string(response) {
            Ok(text) => {
                if !outbox.push(OutboundFrame::critical(text)) {
                    self.remove_connection(peer_id);
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize response"),
        }
    }
}
