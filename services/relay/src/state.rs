//! Shared relay state: the live-identity table and the queue handle.
//!
//! The identity table is the only in-memory state shared between session
//! tasks.  It is guarded by one `std::sync::Mutex` with short critical
//! sections; handles are cloned out under the lock and every sink send or
//! store await happens outside it.

use hh_protocol::Record;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::storage::MessageStore;

pub type SharedStore = Arc<Mutex<MessageStore>>;
pub type SharedState = Arc<RelayState>;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Which transport a session arrived on.  Control-plane snapshots label
/// these "TCP" and "Web".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Framed,
    Push,
}

impl TransportKind {
    pub fn label(self) -> &'static str {
        match self {
            TransportKind::Framed => "TCP",
            TransportKind::Push => "Web",
        }
    }
}

/// Commands accepted by a session task through its sink.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write this record to the peer.
    Deliver(Record),
    /// Terminate the session (sweeper or operator initiated).
    Close,
}

/// Handle to a live session, stored in the identity table.
///
/// The handle is a weak view: the session task owns the transport, and a
/// failed `tx` send simply means the session is already gone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Guards unregister against racing a re-registration of the same
    /// identity.
    pub token: Uuid,
    pub identity: String,
    pub kind: TransportKind,
    pub tx: mpsc::UnboundedSender<SessionCommand>,
    /// Millisecond stamp of the last inbound activity; written by the
    /// session task, read by the sweeper.
    pub last_activity: Arc<AtomicI64>,
}

impl SessionHandle {
    pub fn new(identity: &str, kind: TransportKind) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            token: Uuid::new_v4(),
            identity: identity.to_owned(),
            kind,
            tx,
            last_activity: Arc::new(AtomicI64::new(hh_protocol::now_ms())),
        };
        (handle, rx)
    }

    /// Refresh the activity stamp.  Monotonic: never moves backwards.
    pub fn touch(&self) {
        self.last_activity
            .fetch_max(hh_protocol::now_ms(), Ordering::Relaxed);
    }
}

/// One row of the control-plane session listing.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub identity: String,
    pub kind: TransportKind,
    pub last_activity: i64,
}

// ---------------------------------------------------------------------------
// RelayState
// ---------------------------------------------------------------------------

pub struct RelayState {
    pub store: SharedStore,
    sessions: StdMutex<HashMap<String, SessionHandle>>,
    /// Operator-facing message log (`logs/messages.log`), the source the
    /// console's `tail` reads.  Absent when the log dir is unavailable.
    message_log: StdMutex<Option<std::fs::File>>,
}

impl RelayState {
    pub fn new(store: MessageStore) -> Self {
        RelayState {
            store: Arc::new(Mutex::new(store)),
            sessions: StdMutex::new(HashMap::new()),
            message_log: StdMutex::new(None),
        }
    }

    /// Attach the append-only message log file.
    pub fn set_message_log(&self, file: std::fs::File) {
        *self.message_log.lock().expect("message log poisoned") = Some(file);
    }

    /// Append one routed record to the message log, if attached.
    pub(crate) fn log_routed(&self, rec: &Record) {
        use std::io::Write;
        let mut guard = self.message_log.lock().expect("message log poisoned");
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", rec.to_wire());
        }
    }

    /// Insert `handle` if its identity is free on both transports.
    /// Returns false when the identity is already live.
    pub(crate) fn insert_session(&self, handle: SessionHandle) -> bool {
        let mut map = self.sessions.lock().expect("session table poisoned");
        if map.contains_key(&handle.identity) {
            false
        } else {
            map.insert(handle.identity.clone(), handle);
            true
        }
    }

    /// Remove `identity` only if the live entry carries `token`.  A late
    /// cleanup from a dead session must not evict a fresh re-registration.
    pub fn unregister(&self, identity: &str, token: Uuid) {
        let mut map = self.sessions.lock().expect("session table poisoned");
        if map.get(identity).is_some_and(|h| h.token == token) {
            map.remove(identity);
        }
    }

    /// Snapshot check across both transports.
    pub fn is_taken(&self, identity: &str) -> bool {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .contains_key(identity)
    }

    /// Clone out the live handle for `identity`, if any.
    pub fn session(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(identity)
            .cloned()
    }

    /// Clone out every live handle except `exclude`.
    pub fn sessions_except(&self, exclude: &str) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .values()
            .filter(|h| h.identity != exclude)
            .cloned()
            .collect()
    }

    /// Clone out every live handle.
    pub fn all_sessions(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.sessions.lock().expect("session table poisoned").len()
    }

    /// Listing rows for the control plane and console.
    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        let mut rows: Vec<SessionSnapshot> = self
            .sessions
            .lock()
            .expect("session table poisoned")
            .values()
            .map(|h| SessionSnapshot {
                identity: h.identity.clone(),
                kind: h.kind,
                last_activity: h.last_activity.load(Ordering::Relaxed),
            })
            .collect();
        rows.sort_by(|a, b| a.identity.cmp(&b.identity));
        rows
    }

    /// FRAMED sessions whose last activity is older than `cutoff_ms`.
    /// Handles are cloned out; the caller disconnects outside the lock.
    pub fn framed_sessions_idle_since(&self, cutoff_ms: i64) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .values()
            .filter(|h| {
                h.kind == TransportKind::Framed
                    && h.last_activity.load(Ordering::Relaxed) < cutoff_ms
            })
            .cloned()
            .collect()
    }
}
