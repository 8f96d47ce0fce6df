//! Framed TLS listener and per-session loop.
//!
//! Programmatic endpoints connect over TLS and speak line-delimited wire
//! records.  The first line after the handshake is the proposed identity;
//! everything after registration is one record per line.
//!
//! Each session runs two tasks: a reader task that turns the stream into
//! a line channel, and the session task that owns the write half.  The
//! session task is the only writer on its transport, so outbound lines go
//! out in enqueue order with no interleaving.

use hh_protocol::{error_line, reject_codes, Record};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::router::{handle_inbound, RegisterOutcome};
use crate::state::{SessionCommand, SessionHandle, SharedState, TransportKind};

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Run the framed accept loop.  Each accepted connection completes the
/// TLS handshake before any application read, then runs its own session
/// task until disconnect.
pub async fn run_framed_listener(state: SharedState, listener: TcpListener, tls: TlsAcceptor) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "framed accept failed");
                continue;
            }
        };
        let tls = tls.clone();
        let state = state.clone();
        tokio::spawn(async move {
            match tls.accept(stream).await {
                Ok(tls_stream) => {
                    info!(peer = %peer, "framed connection established");
                    run_session(state, tls_stream).await;
                }
                Err(e) => {
                    info!(peer = %peer, error = %e, "TLS handshake failed");
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Per-session loop
// ---------------------------------------------------------------------------

/// Drive one framed session over any byte stream.
///
/// Generic over the transport so tests can run it on an in-memory duplex
/// pipe; production passes the TLS stream.
pub async fn run_session<S>(state: SharedState, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut lines = spawn_line_reader(read_half);
    let mut writer = write_half;

    // Step 1: exactly one identity line.
    let Some(identity) = lines.recv().await else {
        return;
    };
    let identity = identity.trim().to_owned();

    let (handle, mut rx) = SessionHandle::new(&identity, TransportKind::Framed);
    let token = handle.token;

    match state.register(handle.clone()).await {
        RegisterOutcome::Accepted => {
            info!(identity = %identity, "framed session registered");
        }
        RegisterOutcome::DuplicateId => {
            let _ = write_line(&mut writer, &error_line(reject_codes::ID_TAKEN)).await;
            return;
        }
        RegisterOutcome::EmptyId => {
            let _ = write_line(&mut writer, &error_line(reject_codes::EMPTY_ID)).await;
            return;
        }
    }

    // The replay enqueued by register is flushed before the first inbound
    // read, preserving the replay-before-inbound ordering guarantee.
    let mut alive = true;
    while let Ok(cmd) = rx.try_recv() {
        if !apply_command(&mut writer, cmd).await {
            alive = false;
            break;
        }
    }

    while alive {
        tokio::select! {
            line = lines.recv() => {
                match line {
                    Some(line) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        handle.touch();
                        match Record::from_wire(trimmed) {
                            Some(rec) => handle_inbound(&state, &identity, rec).await,
                            None => {
                                warn!(identity = %identity, payload = %trimmed, "discarding malformed record");
                            }
                        }
                    }
                    // EOF or read error in the reader task.
                    None => alive = false,
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => alive = apply_command(&mut writer, cmd).await,
                    None => alive = false,
                }
            }
        }
    }

    state.unregister(&identity, token);
    let _ = writer.shutdown().await;
    info!(identity = %identity, "framed session closed");
}

/// Turn the read half into a channel of lines.
///
/// The channel indirection keeps the session loop's `select!` cancel-safe:
/// `recv` never loses a partially-read line the way a raw `read_line`
/// would.  The reader task ends (dropping its sender) on EOF or error.
fn spawn_line_reader<R>(read_half: R) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(std::mem::take(&mut line)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Execute one sink command.  Returns false when the session must end
/// (close requested or the transport write failed).
async fn apply_command<W>(writer: &mut W, cmd: SessionCommand) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    match cmd {
        SessionCommand::Deliver(rec) => write_line(writer, &rec.to_wire()).await,
        SessionCommand::Close => false,
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = String::with_capacity(line.len() + 1);
    framed.push_str(line);
    framed.push('\n');
    writer.write_all(framed.as_bytes()).await.is_ok() && writer.flush().await.is_ok()
}
