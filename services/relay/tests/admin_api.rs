/// Control-plane tests over a real TCP listener: auth gating, state
/// snapshots, targeted queue inspection, operator broadcast and kick.
use hh_protocol::{Priority, Record};
use relay::admin_api;
use relay::state::{RelayState, SessionCommand, SessionHandle, TransportKind};
use relay::storage::MessageStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn fresh_state() -> Arc<RelayState> {
    Arc::new(RelayState::new(
        MessageStore::open_in_memory().expect("open store"),
    ))
}

async fn start_admin(state: Arc<RelayState>, password: Option<&str>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(admin_api::run_admin_listener(
        state,
        listener,
        password.map(str::to_owned),
    ));
    addr
}

/// One full control-plane exchange: password line, request line, single
/// response line.
async fn request(addr: SocketAddr, password: &str, verb: &str) -> String {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(format!("{password}\n{verb}\n").as_bytes())
        .await
        .expect("send request");

    tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("timed out waiting for response")
        .expect("read response")
        .expect("server closed without responding")
}

async fn register(
    state: &Arc<RelayState>,
    identity: &str,
    kind: TransportKind,
) -> mpsc::UnboundedReceiver<SessionCommand> {
    let (handle, rx) = SessionHandle::new(identity, kind);
    assert_eq!(
        state.register(handle).await,
        relay::router::RegisterOutcome::Accepted
    );
    rx
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wrong_password_is_rejected_with_the_literal_error() {
    // S6 first half.
    let addr = start_admin(fresh_state(), Some("secret")).await;
    let reply = request(addr, "not-the-secret", "GET_DATA").await;
    assert_eq!(reply, "ERROR:AUTH_FAILED");
}

#[tokio::test]
async fn unset_password_rejects_everything() {
    let addr = start_admin(fresh_state(), None).await;
    let reply = request(addr, "anything", "GET_DATA").await;
    assert_eq!(reply, "ERROR:AUTH_FAILED");
}

#[tokio::test]
async fn empty_configured_password_rejects_everything() {
    let addr = start_admin(fresh_state(), Some("")).await;
    let reply = request(addr, "", "GET_DATA").await;
    assert_eq!(reply, "ERROR:AUTH_FAILED");
}

#[tokio::test]
async fn connection_closes_after_one_request() {
    let addr = start_admin(fresh_state(), Some("secret")).await;
    let stream = TcpStream::connect(addr).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"secret\nGET_DATA\nGET_DATA\n")
        .await
        .expect("send");

    let first = lines.next_line().await.expect("read").expect("response");
    assert!(first.starts_with('{'));
    // the second request must never be answered
    let second = tokio::time::timeout(Duration::from_millis(500), lines.next_line()).await;
    assert!(matches!(second, Ok(Ok(None))), "connection should close");
}

// ---------------------------------------------------------------------------
// GET_DATA / GET_PENDING
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_data_reports_sessions_and_pending() {
    let state = fresh_state();
    let _framed_rx = register(&state, "alpha", TransportKind::Framed).await;
    let _push_rx = register(&state, "webby", TransportKind::Push).await;
    state
        .route(Record::direct("alpha", "bravo", "queued", Priority::Normal))
        .await
        .expect("route");

    let addr = start_admin(state, Some("secret")).await;
    let reply = request(addr, "secret", "GET_DATA").await;
    let parsed: serde_json::Value = serde_json::from_str(&reply).expect("valid JSON");

    assert_eq!(parsed["stats"]["onlineClients"], 2);
    assert_eq!(parsed["stats"]["pendingMessages"], 1);

    let clients = parsed["clients"].as_array().expect("clients array");
    let types: Vec<(&str, &str)> = clients
        .iter()
        .map(|c| {
            (
                c["clientId"].as_str().expect("clientId"),
                c["type"].as_str().expect("type"),
            )
        })
        .collect();
    assert!(types.contains(&("alpha", "TCP")));
    assert!(types.contains(&("webby", "Web")));

    assert_eq!(
        parsed["clientsWithPending"],
        serde_json::json!(["bravo"])
    );
    // compact encoding: no whitespace outside of values
    assert!(!reply.contains(": "));
}

#[tokio::test]
async fn get_pending_lists_from_priority_body_in_replay_order() {
    let state = fresh_state();
    for (body, priority, ts) in [
        ("n", Priority::Normal, 100_i64),
        ("h", Priority::High, 200),
        ("l", Priority::Low, 300),
    ] {
        let mut rec = Record::direct("alpha", "charlie", body, priority);
        rec.timestamp = ts;
        state.route(rec).await.expect("route");
    }

    let addr = start_admin(state, Some("secret")).await;
    let reply = request(addr, "secret", "GET_PENDING charlie").await;
    let parsed: serde_json::Value = serde_json::from_str(&reply).expect("valid JSON");
    let rows = parsed.as_array().expect("array");
    let bodies: Vec<&str> = rows.iter().map(|r| r["body"].as_str().unwrap()).collect();
    assert_eq!(bodies, vec!["h", "n", "l"]);
    assert_eq!(rows[0]["from"], "alpha");
    assert_eq!(rows[0]["priority"], 2);
}

// ---------------------------------------------------------------------------
// ADMIN_BROADCAST / ADMIN_KICK
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_broadcast_is_high_priority_persisted_and_fanned_out() {
    // S6 second half.
    let state = fresh_state();
    let mut alpha_rx = register(&state, "alpha", TransportKind::Framed).await;
    let mut web_rx = register(&state, "webby", TransportKind::Push).await;

    let addr = start_admin(state.clone(), Some("secret")).await;
    let reply = request(addr, "secret", "ADMIN_BROADCAST shelter at gate 4").await;
    assert_eq!(reply, r#"{"broadcast":true}"#);

    for rx in [&mut alpha_rx, &mut web_rx] {
        match rx.try_recv() {
            Ok(SessionCommand::Deliver(rec)) => {
                assert_eq!(rec.from, admin_api::ADMIN_IDENTITY);
                assert_eq!(rec.priority, Priority::High);
                assert_eq!(rec.body, "shelter at gate 4");
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    let store = state.store.lock().await;
    assert_eq!(store.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn admin_kick_disconnects_the_identity() {
    let state = fresh_state();
    let mut alpha_rx = register(&state, "alpha", TransportKind::Framed).await;

    let addr = start_admin(state, Some("secret")).await;
    let reply = request(addr, "secret", "ADMIN_KICK alpha").await;
    assert_eq!(reply, r#"{"kicked":true}"#);
    assert!(matches!(alpha_rx.try_recv(), Ok(SessionCommand::Close)));

    let reply = request(addr, "secret", "ADMIN_KICK ghost").await;
    assert_eq!(reply, r#"{"kicked":false}"#);
}

#[tokio::test]
async fn unknown_verb_is_an_error_line() {
    let addr = start_admin(fresh_state(), Some("secret")).await;
    let reply = request(addr, "secret", "SELF_DESTRUCT now").await;
    assert_eq!(reply, "ERROR:UNKNOWN_COMMAND");
}
