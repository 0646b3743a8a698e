//! Registry of connected websocket peers.
//!
//! Each peer owns a bounded [`Outbox`]; broadcasts serialize once and
//! push into every peer's queue. A peer whose queue rejects a critical
//! frame has its outbox closed, which ends its writer task and thereby
//! the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use arcor_protocol::outbox::{Outbox, OutboundFrame};
use arcor_protocol::{EventFrame, RpcResponse};

pub struct ClientHub {
    peers: Mutex<HashMap<u64, Arc<Outbox>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ClientHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    pub fn register(&self) -> (u64, Arc<Outbox>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.queue_capacity));
        self.peers.lock().insert(id, outbox.clone());
        (id, outbox)
    }

    pub fn remove(&self, peer_id: u64) {
        if let Some(outbox) = self.peers.lock().remove(&peer_id) {
            outbox.close();
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Fan an event out to every connected peer.
    pub fn broadcast(&self, frame: &EventFrame) {
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
            for (id, outbox) in peers.iter() {
                if !outbox.push(OutboundFrame::event(&frame.event, text.clone())) {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            tracing::warn!(peer_id = id, "peer cannot keep up, dropping");
            self.remove(id);
        }
    }

    /// Queue an event towards a single peer (snapshot-on-connect).
    pub fn broadcast_to(&self, peer_id: u64, frame: &EventFrame) {
        let Some(outbox) = self.peers.lock().get(&peer_id).cloned() else {
            return;
        };
        match serde_json::to_string(frame) {
            Ok(text) => {
                if !outbox.push(OutboundFrame::event(&frame.event, text)) {
                    self.remove(peer_id);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, event = %frame.event, "failed to serialize event");
            }
        }
    }

    /// Queue an RPC response towards one peer. Responses are critical.
    pub fn respond(&self, peer_id: u64, response: &RpcResponse) {
        let Some(outbox) = self.peers.lock().get(&peer_id).cloned() else {
            return;
        };
        match serde_json::to_string(response) {
            Ok(text) => {
                if !outbox.push(OutboundFrame::critical(text)) {
                    self.remove(peer_id);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
            }
        }
    }
}
