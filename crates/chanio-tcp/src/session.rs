//! Per-connection session state and the server's session registry.

use bytes::Bytes;
use chanio_core::WriteQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;

/// One accepted connection. Holds the write half and pipeline state a
/// session's dedicated task drives; `SessionRegistry` holds the `Arc<Session>`
/// so other tasks (broadcast, send_to, the idle reaper) can reach it without
/// going through the owning task.
pub struct Session {
    pub client_id: u64,
    pub remote_address: String,
    pub(crate) write_half: Mutex<Option<OwnedWriteHalf>>,
    pub(crate) write_queue: Mutex<WriteQueue>,
    pub(crate) write_notify: Notify,
    pub(crate) disconnect_notify: Notify,
    pub(crate) disconnected: std::sync::atomic::AtomicBool,
    pub(crate) last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(client_id: u64, remote_address: String, write_half: OwnedWriteHalf, backpressure_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            remote_address,
            write_half: Mutex::new(Some(write_half)),
            write_queue: Mutex::new(WriteQueue::new(backpressure_threshold)),
            write_notify: Notify::new(),
            disconnect_notify: Notify::new(),
            disconnected: std::sync::atomic::AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Requests that the session's owning task tear the connection down.
    /// Idempotent; safe to call from the idle reaper or from `stop()`.
    pub fn request_disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.disconnect_notify.notify_waiters();
        }
    }

    pub fn enqueue(&self, payload: Bytes) -> chanio_core::EnqueueOutcome {
        let outcome = self.write_queue.lock().enqueue(payload);
        if matches!(outcome, chanio_core::EnqueueOutcome::Accepted { .. }) {
            self.write_notify.notify_one();
        }
        outcome
    }
}

/// Tracks every currently-connected session.
///
/// - `len() <= max_connections` is enforced by [`try_register`] rejecting
///   new sessions once the cap is reached.
/// - An id only ever appears here between `try_register` and `remove`;
///   there is no "half-registered" state.
/// - `remove` is the single atomic point past which `get`/iteration stop
///   observing the session, so no event can be delivered to a session
///   after its disconnect has been processed.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_client_id: AtomicU64,
    max_connections: Option<u32>,
}

impl SessionRegistry {
    pub fn new(max_connections: Option<u32>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Allocates the next monotonically increasing client id.
    pub fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `session` unless the registry is already at capacity.
    /// Returns `false` (and does not insert) when full.
    pub fn try_register(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if let Some(max) = self.max_connections {
            if sessions.len() as u32 >= max {
                return false;
            }
        }
        sessions.insert(session.client_id, session);
        true
    }

    pub fn remove(&self, client_id: u64) -> Option<Arc<Session>> {
        self.sessions.write().remove(&client_id)
    }

    pub fn get(&self, client_id: u64) -> Option<Arc<Session>> {
        self.sessions.read().get(&client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}
