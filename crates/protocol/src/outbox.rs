//! Bounded per-peer outbound queue implementing the backpressure
//! contract: when a peer's queue is full, the oldest droppable event
//! (`ActionStateBefore`/`ActionStateAfter`) gives way; state-bearing
//! frames are never dropped — a peer that cannot absorb them is
//! disconnected instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::events;

/// Whether an event may be shed under backpressure.
pub fn is_droppable(event: &str) -> bool {
    matches!(
        event,
        events::ACTION_STATE_BEFORE | events::ACTION_STATE_AFTER
    )
}

/// One frame queued towards a peer, already serialized.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub text: String,
    pub droppable: bool,
}

impl OutboundFrame {
    pub fn critical(text: String) -> Self {
        Self {
            text,
            droppable: false,
        }
    }

    pub fn event(event_name: &str, text: String) -> Self {
        Self {
            text,
            droppable: is_droppable(event_name),
        }
    }
}

/// Per-peer queue between producers (RPC handlers, broadcasts) and the
/// peer's single writer task.
pub struct Outbox {
    capacity: usize,
    queue: Mutex<VecDeque<OutboundFrame>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame. Returns `false` when the peer must be dropped:
    /// the queue is full of undroppable frames and this one is critical
    /// too.
    pub fn push(&self, frame: OutboundFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|f| f.droppable) {
                    queue.remove(pos);
                } else if frame.droppable {
                    // Shed the newcomer; the backlog is all critical.
                    return true;
                } else {
                    return false;
                }
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Await the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            if let Some(frame) = self.queue.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn droppable(n: usize) -> OutboundFrame {
        OutboundFrame {
            text: format!("d{n}"),
            droppable: true,
        }
    }

    fn critical(n: usize) -> OutboundFrame {
        OutboundFrame {
            text: format!("c{n}"),
            droppable: false,
        }
    }

    #[test]
    fn overflow_sheds_oldest_droppable_first() {
        let outbox = Outbox::new(2);
        assert!(outbox.push(droppable(1)));
        assert!(outbox.push(critical(2)));
        // Full: the droppable frame gives way to the new critical one.
        assert!(outbox.push(critical(3)));
        let queue = outbox.queue.lock();
        let texts: Vec<&str> = queue.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["c2", "c3"]);
    }

    #[test]
    fn all_critical_backlog_rejects_critical_newcomer() {
        let outbox = Outbox::new(2);
        assert!(outbox.push(critical(1)));
        assert!(outbox.push(critical(2)));
        // Droppable newcomer is silently shed...
        assert!(outbox.push(droppable(3)));
        assert_eq!(outbox.len(), 2);
        // ...a critical one signals "disconnect this peer".
        assert!(!outbox.push(critical(4)));
    }

    #[tokio::test]
    async fn pop_drains_then_ends_on_close() {
        let outbox = Outbox::new(4);
        outbox.push(critical(1));
        outbox.close();
        assert_eq!(outbox.pop().await.unwrap().text, "c1");
        assert!(outbox.pop().await.is_none());
    }

    #[test]
    fn classification() {
        assert!(is_droppable("ActionStateBefore"));
        assert!(is_droppable("ActionStateAfter"));
        assert!(!is_droppable("PackageState"));
        assert!(!is_droppable("ProjectException"));
    }
}
