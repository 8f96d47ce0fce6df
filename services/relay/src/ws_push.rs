//! Web push-socket listener: browser sessions under the same identity
//! space as the framed transport.
//!
//! The first inbound frame is the identity-bearing record.  A STATUS
//! first frame registers only; a DIRECT or BROADCAST first frame both
//! registers and routes.  Everything after registration is handled
//! exactly like the framed inbound loop.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use hh_protocol::{error_line, reject_codes, Record};
use tracing::{info, warn};

use crate::router::{handle_inbound, RegisterOutcome};
use crate::state::{SessionCommand, SessionHandle, SharedState, TransportKind};

pub async fn ws_push_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_push_socket(socket, state))
}

async fn send_reject(socket: &mut WebSocket, code: &str) {
    let _ = socket.send(Message::Text(error_line(code).into())).await;
}

async fn handle_push_socket(mut socket: WebSocket, state: SharedState) {
    // First frame: the identity-bearing record.
    let first = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(data))) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                info!(error = %e, "push socket error before registration");
                return;
            }
        }
    };

    let Some(first_rec) = Record::from_wire(&first) else {
        send_reject(&mut socket, reject_codes::INVALID_RECORD).await;
        return;
    };
    let identity = first_rec.from.clone();

    let (handle, mut rx) = SessionHandle::new(&identity, TransportKind::Push);
    let token = handle.token;

    match state.register(handle.clone()).await {
        RegisterOutcome::Accepted => {
            info!(identity = %identity, "push session registered");
        }
        RegisterOutcome::DuplicateId => {
            send_reject(&mut socket, reject_codes::ID_TAKEN).await;
            return;
        }
        RegisterOutcome::EmptyId => {
            send_reject(&mut socket, reject_codes::EMPTY_ID).await;
            return;
        }
    }

    // A routable first frame is real traffic, not just a registration.
    if first_rec.kind.is_routable() {
        let _ = state.route(first_rec).await;
    }

    // Flush the replay enqueued by register before the first inbound read.
    let mut alive = true;
    while let Ok(cmd) = rx.try_recv() {
        if !apply_command(&mut socket, cmd).await {
            alive = false;
            break;
        }
    }

    while alive {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle.touch();
                        match Record::from_wire(&text) {
                            Some(rec) => handle_inbound(&state, &identity, rec).await,
                            None => {
                                warn!(identity = %identity, payload = %text, "discarding malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        handle.touch();
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => alive = false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        info!(identity = %identity, error = %e, "push socket error");
                        alive = false;
                    }
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => alive = apply_command(&mut socket, cmd).await,
                    None => alive = false,
                }
            }
        }
    }

    state.unregister(&identity, token);
    info!(identity = %identity, "push session closed");
}

/// Execute one sink command.  Returns false when the session must end.
async fn apply_command(socket: &mut WebSocket, cmd: SessionCommand) -> bool {
    match cmd {
        SessionCommand::Deliver(rec) => socket
            .send(Message::Text(rec.to_wire().into()))
            .await
            .is_ok(),
        SessionCommand::Close => {
            let _ = socket.send(Message::Close(None)).await;
            false
        }
    }
}
