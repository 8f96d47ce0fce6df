//! Zombie sweeper: periodic cleanup of framed sessions that stopped
//! sending traffic.
//!
//! One timer with period equal to the connection timeout.  Victims are
//! gathered under the identity-table lock, then told to close outside it
//! so no I/O happens while the table is held.  Push sessions are not
//! swept; their liveness comes from the socket's own close events.

use std::time::Duration;
use tracing::info;

use crate::state::{SessionCommand, SharedState};

pub async fn run_sweeper(state: SharedState, timeout: Duration) {
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    let mut interval = tokio::time::interval(timeout);
    // The first tick fires immediately; skip it so a freshly-started
    // server never sweeps sessions younger than one full period.
    interval.tick().await;

    loop {
        interval.tick().await;
        let cutoff = hh_protocol::now_ms() - timeout_ms;
        let victims = state.framed_sessions_idle_since(cutoff);
        for handle in victims {
            info!(identity = %handle.identity, "sweeping timed-out session");
            let _ = handle.tx.send(SessionCommand::Close);
        }
    }
}
