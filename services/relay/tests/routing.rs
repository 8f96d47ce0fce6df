/// Routing-core tests: registration uniqueness, store-before-route,
/// broadcast exclusion, replay on registration, delivery tracking.
use hh_protocol::{Priority, Record};
use relay::router::{RegisterOutcome, RouteOutcome};
use relay::state::{RelayState, SessionCommand, SessionHandle, TransportKind};
use relay::storage::MessageStore;
use std::sync::Arc;
use tokio::sync::mpsc;

fn fresh_state() -> Arc<RelayState> {
    Arc::new(RelayState::new(
        MessageStore::open_in_memory().expect("open store"),
    ))
}

/// Register a fake session and return its command receiver and handle.
async fn register(
    state: &Arc<RelayState>,
    identity: &str,
    kind: TransportKind,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionCommand>) {
    let (handle, rx) = SessionHandle::new(identity, kind);
    let outcome = state.register(handle.clone()).await;
    assert_eq!(outcome, RegisterOutcome::Accepted, "identity: {identity}");
    (handle, rx)
}

fn expect_delivery(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Record {
    match rx.try_recv() {
        Ok(SessionCommand::Deliver(rec)) => rec,
        other => panic!("expected Deliver, got {other:?}"),
    }
}

fn expect_silence(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) {
    assert!(rx.try_recv().is_err(), "sink should have been quiet");
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_and_whitespace_identities_are_rejected() {
    let state = fresh_state();
    for bad in ["", "   ", "\t"] {
        let (handle, _rx) = SessionHandle::new(bad, TransportKind::Framed);
        assert_eq!(state.register(handle).await, RegisterOutcome::EmptyId);
    }
}

#[tokio::test]
async fn duplicate_identity_is_rejected_across_transports() {
    let state = fresh_state();
    let (_alpha, _alpha_rx) = register(&state, "alpha", TransportKind::Framed).await;

    // a push session with the same identity must bounce, incumbent untouched
    let (push_handle, _push_rx) = SessionHandle::new("alpha", TransportKind::Push);
    assert_eq!(
        state.register(push_handle).await,
        RegisterOutcome::DuplicateId
    );
    assert!(state.is_taken("alpha"));
    assert_eq!(state.online_count(), 1);
}

#[tokio::test]
async fn register_succeeds_iff_not_taken() {
    let state = fresh_state();
    assert!(!state.is_taken("alpha"));
    let (_h, _rx) = register(&state, "alpha", TransportKind::Push).await;
    assert!(state.is_taken("alpha"));
}

#[tokio::test]
async fn stale_unregister_does_not_evict_fresh_session() {
    let state = fresh_state();
    let (old, _old_rx) = register(&state, "alpha", TransportKind::Framed).await;
    state.unregister("alpha", old.token);
    assert!(!state.is_taken("alpha"));

    let (_new, _new_rx) = register(&state, "alpha", TransportKind::Framed).await;
    // the dead session's cleanup races in late — it must be a no-op
    state.unregister("alpha", old.token);
    assert!(state.is_taken("alpha"));
}

#[tokio::test]
async fn identity_is_reusable_after_session_ends() {
    let state = fresh_state();
    let (old, _old_rx) = register(&state, "alpha", TransportKind::Framed).await;
    state.unregister("alpha", old.token);
    let (_h, _rx) = register(&state, "alpha", TransportKind::Push).await;
    assert!(state.is_taken("alpha"));
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_is_persisted_before_delivery_and_delivered_live() {
    let state = fresh_state();
    let (_b, mut bravo_rx) = register(&state, "bravo", TransportKind::Framed).await;

    let rec = Record::direct("alpha", "bravo", "hi", Priority::Normal);
    let outcome = state.route(rec.clone()).await.expect("route");
    assert_eq!(outcome, RouteOutcome::Delivered);

    // durable row exists even though delivery already happened
    {
        let store = state.store.lock().await;
        assert_eq!(store.pending_count().unwrap(), 1);
    }
    assert_eq!(expect_delivery(&mut bravo_rx).id, rec.id);
}

#[tokio::test]
async fn direct_to_offline_recipient_stays_pending() {
    let state = fresh_state();
    let rec = Record::direct("alpha", "bravo", "hold for you", Priority::Normal);
    let outcome = state.route(rec).await.expect("route");
    assert_eq!(outcome, RouteOutcome::Queued);

    let store = state.store.lock().await;
    assert_eq!(store.pending_for("bravo").unwrap().len(), 1);
}

#[tokio::test]
async fn broadcast_excludes_originator() {
    let state = fresh_state();
    let (_a, mut alpha_rx) = register(&state, "alpha", TransportKind::Framed).await;
    let (_b, mut bravo_rx) = register(&state, "bravo", TransportKind::Push).await;
    let (_c, mut charlie_rx) = register(&state, "charlie", TransportKind::Framed).await;

    let rec = Record::broadcast("alpha", "all hear", Priority::Normal);
    let outcome = state.route(rec.clone()).await.expect("route");
    assert_eq!(outcome, RouteOutcome::Broadcast(2));

    assert_eq!(expect_delivery(&mut bravo_rx).body, "all hear");
    assert_eq!(expect_delivery(&mut charlie_rx).body, "all hear");
    expect_silence(&mut alpha_rx);
}

#[tokio::test]
async fn non_routable_kinds_are_ignored_and_not_persisted() {
    let state = fresh_state();
    for rec in [
        Record::status("alpha", "online"),
        Record::ack("alpha", "m1"),
        Record::heartbeat("alpha"),
    ] {
        assert_eq!(state.route(rec).await.expect("route"), RouteOutcome::Ignored);
    }
    let store = state.store.lock().await;
    assert_eq!(store.total_count().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_direct_replays_on_registration_and_ack_ends_it() {
    // S1: alpha sends to bravo while bravo is away; bravo connects, gets
    // the record, acks it, and nothing remains pending.
    let state = fresh_state();
    let rec = Record::direct("alpha", "bravo", "hold for you", Priority::Normal);
    state.route(rec.clone()).await.expect("route");

    let (_b, mut bravo_rx) = register(&state, "bravo", TransportKind::Push).await;
    let replayed = expect_delivery(&mut bravo_rx);
    assert_eq!(replayed.id, rec.id);
    assert_eq!(replayed.body, "hold for you");

    {
        let mut store = state.store.lock().await;
        store.mark_delivered(&rec.id).unwrap();
        assert!(store.pending_for("bravo").unwrap().is_empty());
    }
}

#[tokio::test]
async fn replay_follows_priority_then_time_order() {
    // S3: queued NORMAL("n"), HIGH("h"), LOW("l") replay as h, n, l.
    let state = fresh_state();
    for (body, priority) in [
        ("n", Priority::Normal),
        ("h", Priority::High),
        ("l", Priority::Low),
    ] {
        let mut rec = Record::direct("alpha", "charlie", body, priority);
        rec.timestamp = match body {
            "n" => 100,
            "h" => 200,
            _ => 300,
        };
        state.route(rec).await.expect("route");
    }

    let (_c, mut charlie_rx) = register(&state, "charlie", TransportKind::Framed).await;
    let order: Vec<String> = (0..3)
        .map(|_| expect_delivery(&mut charlie_rx).body)
        .collect();
    assert_eq!(order, vec!["h", "n", "l"]);
}

#[tokio::test]
async fn broadcast_never_replays_to_its_originator() {
    // S2 tail: alpha's own broadcast must not come back on reconnect,
    // while a late-joining delta receives it.
    let state = fresh_state();
    let (alpha, mut alpha_rx) = register(&state, "alpha", TransportKind::Framed).await;
    state
        .route(Record::broadcast("alpha", "all hear", Priority::Normal))
        .await
        .expect("route");
    expect_silence(&mut alpha_rx);

    // delta joins later and gets the replay
    let (_d, mut delta_rx) = register(&state, "delta", TransportKind::Push).await;
    assert_eq!(expect_delivery(&mut delta_rx).body, "all hear");

    // alpha reconnects and does not
    state.unregister("alpha", alpha.token);
    let (_a2, mut alpha2_rx) = register(&state, "alpha", TransportKind::Framed).await;
    expect_silence(&mut alpha2_rx);
}

#[tokio::test]
async fn flush_pending_without_live_session_sends_nothing() {
    let state = fresh_state();
    state
        .route(Record::direct("alpha", "bravo", "x", Priority::Normal))
        .await
        .expect("route");
    assert_eq!(state.flush_pending("bravo").await.expect("flush"), 0);
}

// ---------------------------------------------------------------------------
// Force disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn force_disconnect_reaches_the_live_session() {
    let state = fresh_state();
    let (_a, mut alpha_rx) = register(&state, "alpha", TransportKind::Framed).await;

    assert!(state.force_disconnect("alpha"));
    assert!(matches!(alpha_rx.try_recv(), Ok(SessionCommand::Close)));
    assert!(!state.force_disconnect("ghost"));
}
