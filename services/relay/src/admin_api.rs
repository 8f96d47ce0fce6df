//! Admin control-plane listener.
//!
//! Plaintext line protocol on a dedicated port, one request per
//! connection: first line is the shared-secret password, second line is
//! `VERB [ARG]`, the response is a single line, then the connection
//! closes.  With no password configured every request is rejected.
//!
//! Verbs: `GET_DATA`, `GET_PENDING <identity>`, `ADMIN_BROADCAST <text>`,
//! `ADMIN_KICK <identity>`.

use hh_protocol::{Priority, Record};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::state::SharedState;

pub const AUTH_FAILED: &str = "ERROR:AUTH_FAILED";
pub const UNKNOWN_COMMAND: &str = "ERROR:UNKNOWN_COMMAND";

/// Identity stamped on operator-initiated broadcasts.
pub const ADMIN_IDENTITY: &str = "_admin_";

/// Run the control-plane accept loop.
pub async fn run_admin_listener(
    state: SharedState,
    listener: TcpListener,
    password: Option<String>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "admin accept failed");
                continue;
            }
        };
        let state = state.clone();
        let password = password.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_admin_conn(state, stream, password).await {
                info!(peer = %peer, error = %e, "admin connection error");
            }
        });
    }
}

async fn handle_admin_conn(
    state: SharedState,
    stream: TcpStream,
    password: Option<String>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let supplied = match lines.next_line().await? {
        Some(line) => line,
        None => return Ok(()),
    };
    // An unset or empty expected password rejects everything.
    let authorized = password.as_deref().is_some_and(|p| !p.is_empty() && p == supplied);
    if !authorized {
        write_half.write_all(AUTH_FAILED.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        return Ok(());
    }

    let request = match lines.next_line().await? {
        Some(line) => line,
        None => return Ok(()),
    };
    let response = dispatch(&state, request.trim()).await;
    write_half.write_all(response.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

/// Execute one control-plane request and produce the single response line.
pub async fn dispatch(state: &SharedState, request: &str) -> String {
    let (verb, arg) = match request.split_once(' ') {
        Some((v, a)) => (v, a.trim()),
        None => (request, ""),
    };

    match verb {
        "GET_DATA" => get_data(state).await,
        "GET_PENDING" => get_pending(state, arg).await,
        "ADMIN_BROADCAST" => admin_broadcast(state, arg).await,
        "ADMIN_KICK" => {
            let kicked = state.force_disconnect(arg);
            info!(identity = %arg, kicked, "admin kick");
            json!({ "kicked": kicked }).to_string()
        }
        _ => UNKNOWN_COMMAND.to_owned(),
    }
}

// Response shapes are serde structs so the wire keeps the documented key
// order (`stats`, `clients`, `clientsWithPending`).

#[derive(serde::Serialize)]
struct DataResponse {
    stats: Stats,
    clients: Vec<ClientRow>,
    #[serde(rename = "clientsWithPending")]
    clients_with_pending: Vec<String>,
}

#[derive(serde::Serialize)]
struct Stats {
    #[serde(rename = "onlineClients")]
    online_clients: usize,
    #[serde(rename = "pendingMessages")]
    pending_messages: i64,
}

#[derive(serde::Serialize)]
struct ClientRow {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "type")]
    transport: &'static str,
    #[serde(rename = "lastSeen")]
    last_seen: i64,
}

/// Full state snapshot: stats, live sessions, identities with pending
/// direct traffic.
async fn get_data(state: &SharedState) -> String {
    let sessions = state.session_snapshots();
    let (pending, with_pending) = {
        let store = state.store.lock().await;
        (
            store.pending_count().unwrap_or(0),
            store.identities_with_pending_direct().unwrap_or_default(),
        )
    };
    let response = DataResponse {
        stats: Stats {
            online_clients: sessions.len(),
            pending_messages: pending,
        },
        clients: sessions
            .iter()
            .map(|s| ClientRow {
                client_id: s.identity.clone(),
                transport: s.kind.label(),
                last_seen: s.last_activity,
            })
            .collect(),
        clients_with_pending: with_pending,
    };
    serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_owned())
}

async fn get_pending(state: &SharedState, identity: &str) -> String {
    let rows = {
        let store = state.store.lock().await;
        store.pending_summaries_for(identity).unwrap_or_default()
    };
    serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_owned())
}

/// Operator broadcast: HIGH priority, `_admin_` origin, routed through
/// the normal core so it is persisted and fanned out like any other.
async fn admin_broadcast(state: &SharedState, text: &str) -> String {
    let rec = Record::broadcast(ADMIN_IDENTITY, text, Priority::High);
    match state.route(rec).await {
        Ok(outcome) => {
            info!(?outcome, "admin broadcast routed");
            json!({ "broadcast": true }).to_string()
        }
        Err(e) => {
            warn!(error = %e, "admin broadcast failed");
            json!({ "broadcast": false, "error": e.to_string() }).to_string()
        }
    }
}
