//! Routing core: registration, store-and-forward delivery, replay.
//!
//! Single authority over who is reachable.  Every routable record is
//! persisted PENDING before any delivery attempt; a persistence failure
//! aborts routing for that record (logged, never transmitted).

use hh_protocol::{Record, RecordKind};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::state::{RelayState, SessionCommand, SessionHandle};
use crate::storage::StoreError;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    /// Identity already live on either transport; the incumbent is left
    /// untouched.
    DuplicateId,
    /// Empty or whitespace-only identity.
    EmptyId,
}

/// What `route` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Persisted and written to the recipient's live sink.
    Delivered,
    /// Persisted; no live recipient, left PENDING for replay.
    Queued,
    /// Persisted; broadcast fan-out reached `usize` live sessions.
    Broadcast(usize),
    /// ACK / HEARTBEAT / STATUS: not routable, not persisted.
    Ignored,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("record not persisted: {0}")]
    Storage(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Identity validation
// ---------------------------------------------------------------------------

/// Identities are non-empty printable strings.  Control characters are
/// rejected so an identity can always appear verbatim in wire lines and
/// operator output.
pub fn valid_identity(identity: &str) -> bool {
    let trimmed = identity.trim();
    !trimmed.is_empty() && !trimmed.chars().any(char::is_control)
}

// ---------------------------------------------------------------------------
// Routing operations
// ---------------------------------------------------------------------------

impl RelayState {
    /// Register a session under its identity.
    ///
    /// On success the identity's full pending backlog is enqueued into the
    /// new session's sink before this returns, so the session task can
    /// flush it before reading its first inbound record.
    pub async fn register(&self, handle: SessionHandle) -> RegisterOutcome {
        if !valid_identity(&handle.identity) {
            return RegisterOutcome::EmptyId;
        }
        let identity = handle.identity.clone();
        if !self.insert_session(handle) {
            return RegisterOutcome::DuplicateId;
        }

        {
            let mut store = self.store.lock().await;
            if let Err(e) = store.upsert_last_seen(&identity) {
                warn!(identity = %identity, error = %e, "last-seen upsert failed");
            }
        }
        match self.flush_pending(&identity).await {
            Ok(0) => {}
            Ok(n) => info!(identity = %identity, count = n, "replayed pending records"),
            Err(e) => error!(identity = %identity, error = %e, "pending replay failed"),
        }
        RegisterOutcome::Accepted
    }

    /// Persist and deliver one record.
    ///
    /// DIRECT: best-effort write to the recipient's live sink on either
    /// transport; absent recipients keep the row PENDING.  BROADCAST:
    /// write to every live session except the originator.  All other
    /// kinds are ignored here (the per-session inbound loop consumes
    /// them) and never persisted.
    pub async fn route(&self, rec: Record) -> Result<RouteOutcome, RouteError> {
        if !rec.kind.is_routable() {
            return Ok(RouteOutcome::Ignored);
        }

        // Store-before-route: nothing is transmitted unless the PENDING
        // row is durable.
        {
            let mut store = self.store.lock().await;
            if let Err(e) = store.store(&rec) {
                error!(id = %rec.id, error = %e, "store failed; record not routed");
                return Err(RouteError::Storage(e));
            }
        }
        self.log_routed(&rec);

        if rec.kind == RecordKind::Broadcast {
            let targets = self.sessions_except(&rec.from);
            let mut reached = 0usize;
            for handle in targets {
                if handle.tx.send(SessionCommand::Deliver(rec.clone())).is_ok() {
                    reached += 1;
                }
            }
            return Ok(RouteOutcome::Broadcast(reached));
        }

        let target = rec.to.as_deref().and_then(|to| self.session(to));
        match target {
            Some(handle) => {
                if handle.tx.send(SessionCommand::Deliver(rec)).is_ok() {
                    Ok(RouteOutcome::Delivered)
                } else {
                    // Session died between lookup and send; the row stays
                    // PENDING for replay.
                    Ok(RouteOutcome::Queued)
                }
            }
            None => Ok(RouteOutcome::Queued),
        }
    }

    /// Enqueue the full pending backlog for `identity` into its live
    /// session's sink, in replay order.  Returns the number enqueued;
    /// zero when the identity has no live session.
    pub async fn flush_pending(&self, identity: &str) -> Result<usize, RouteError> {
        let pending = {
            let store = self.store.lock().await;
            store.pending_for(identity)?
        };
        if pending.is_empty() {
            return Ok(0);
        }
        let Some(handle) = self.session(identity) else {
            return Ok(0);
        };
        let mut sent = 0usize;
        for rec in pending {
            if handle.tx.send(SessionCommand::Deliver(rec)).is_err() {
                // Sink gone; the remaining rows stay PENDING.
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Terminate `identity`'s session if present.  Returns whether a live
    /// session was told to close.
    pub fn force_disconnect(&self, identity: &str) -> bool {
        match self.session(identity) {
            Some(handle) => {
                info!(identity = %identity, transport = handle.kind.label(), "force disconnect");
                handle.tx.send(SessionCommand::Close).is_ok()
            }
            None => false,
        }
    }

    /// Tell every live session to close (shutdown path).
    pub fn close_all_sessions(&self) {
        for handle in self.all_sessions() {
            let _ = handle.tx.send(SessionCommand::Close);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-session inbound dispatch
// ---------------------------------------------------------------------------

/// Handle one parsed inbound record from a live session.  Shared by both
/// transports: HEARTBEAT refreshes liveness only, ACK resolves delivery
/// tracking, everything else is offered to the router.
pub async fn handle_inbound(state: &RelayState, identity: &str, rec: Record) {
    {
        let mut store = state.store.lock().await;
        if let Err(e) = store.upsert_last_seen(identity) {
            warn!(identity = %identity, error = %e, "last-seen upsert failed");
        }
    }

    match rec.kind {
        RecordKind::Heartbeat => {}
        RecordKind::Ack => {
            let mut store = state.store.lock().await;
            if let Err(e) = store.mark_delivered(&rec.body) {
                warn!(identity = %identity, acked = %rec.body, error = %e, "ack not applied");
            }
        }
        _ => {
            // Storage failures are logged inside route; the session keeps
            // running either way.
            let _ = state.route(rec).await;
        }
    }
}
