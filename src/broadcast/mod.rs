//! Push channel fan-out.
//!
//! Every connected client gets a bounded queue of session snapshots.
//! Publishing never blocks and never waits on a slow client: when a queue
//! is full the oldest pending snapshot is dropped, so a stalled subscriber
//! can neither stall the core nor pin unbounded memory. Within one
//! subscriber, snapshots always arrive in publish order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::task::TaskStatus;

/// One session as seen by subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub task_id: String,
    pub status: TaskStatus,
    pub cli_type: String,
    pub terminal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    /// Percent of context remaining, when the CLI has reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_remaining: Option<u8>,
}

/// Point-in-time view of the whole pool, as pushed to subscribers and
/// returned by `list_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub sessions: Vec<SessionView>,
    pub active: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub queued: Vec<String>,
    pub published_at: DateTime<Utc>,
}

struct SubscriberShared {
    queue: Mutex<VecDeque<Arc<StatusSnapshot>>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    id: u64,
}

/// Receiving half handed to a client. Dropping it unregisters the client.
pub struct Subscriber {
    shared: Arc<SubscriberShared>,
}

impl Subscriber {
    /// Next snapshot, in publish order. `None` once the broadcaster shuts
    /// down and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<StatusSnapshot>> {
        loop {
            if let Some(snapshot) = self.shared.queue.lock().pop_front() {
                return Some(snapshot);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking variant for poll-style consumers.
    pub fn try_recv(&mut self) -> Option<Arc<StatusSnapshot>> {
        self.shared.queue.lock().pop_front()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

pub struct StatusBroadcaster {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        self.subscribers.lock().push(Arc::clone(&shared));
        Subscriber { shared }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        subscribers.len()
    }

    /// Delivers `snapshot` to every live subscriber, dropping each
    /// subscriber's oldest pending snapshot on overflow.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));

        for sub in subscribers.iter() {
            {
                let mut queue = sub.queue.lock();
                if queue.len() >= sub.capacity {
                    queue.pop_front();
                    debug!(subscriber = sub.id, "subscriber queue full, dropped oldest snapshot");
                }
                queue.push_back(Arc::clone(&snapshot));
            }
            sub.notify.notify_one();
        }
    }

    /// Wakes all subscribers so their `recv` loops can observe shutdown.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_one();
        }
    }
}
