// relay: HelpHub relay server.
//
// Four listeners converge on one routing core: the framed TLS stream for
// programmatic endpoints, the web push socket, the admin control plane,
// and standard input for the local console.

use relay::state::RelayState;
use relay::storage::MessageStore;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let cfg = match relay::config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => fatal(&format!("failed to load config: {e}")),
    };

    let keystore_password = match env::var("KEYSTORE_PASSWORD") {
        Ok(p) if !p.is_empty() => p,
        _ => fatal("KEYSTORE_PASSWORD is not set; cannot unlock the keystore"),
    };
    let admin_password = env::var("ADMIN_PASSWORD").ok().filter(|p| !p.is_empty());
    if admin_password.is_none() {
        warn!("ADMIN_PASSWORD is not set; every control-plane request will be rejected");
    }

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        fatal(&format!(
            "cannot create data directory '{}': {e}",
            cfg.data_dir.display()
        ));
    }

    let store = match MessageStore::open(&cfg.storage_path()) {
        Ok(s) => s,
        Err(e) => fatal(&format!(
            "cannot open storage '{}': {e}",
            cfg.storage_path().display()
        )),
    };
    info!(path = %cfg.storage_path().display(), "durable queue ready");

    let tls = match relay::tls::load_tls_acceptor(&cfg.keystore_path, &keystore_password) {
        Ok(t) => t,
        Err(e) => fatal(&format!(
            "cannot load keystore '{}': {e}",
            cfg.keystore_path.display()
        )),
    };

    let state = Arc::new(RelayState::new(store));

    // The message log is best-effort: its absence only disables `tail`.
    match std::fs::create_dir_all(&cfg.log_dir).and_then(|()| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(cfg.message_log_path())
    }) {
        Ok(file) => state.set_message_log(file),
        Err(e) => warn!(
            path = %cfg.message_log_path().display(),
            error = %e,
            "message log unavailable"
        ),
    }

    let framed_listener = bind_or_exit(cfg.framed_port, "framed").await;
    let web_listener = bind_or_exit(cfg.web_port, "web").await;
    let admin_listener = bind_or_exit(cfg.admin_port, "admin").await;

    tokio::spawn(relay::framed::run_framed_listener(
        state.clone(),
        framed_listener,
        tls,
    ));
    tokio::spawn(relay::admin_api::run_admin_listener(
        state.clone(),
        admin_listener,
        admin_password,
    ));
    let sweeper = tokio::spawn(relay::sweeper::run_sweeper(
        state.clone(),
        Duration::from_secs(cfg.connection_timeout_secs),
    ));
    tokio::spawn(relay::console::run_console(
        state.clone(),
        cfg.message_log_path(),
    ));

    let discovery = relay::discovery::announce(&cfg.service_name, cfg.web_port);
    relay::discovery::log_lan_addresses(cfg.web_port);

    info!(
        framed = cfg.framed_port,
        web = cfg.web_port,
        admin = cfg.admin_port,
        "relay listening"
    );

    let router = relay::build_router(state.clone(), cfg.webapp_dir.clone());
    if let Err(e) = axum::serve(web_listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        fatal(&format!("web listener failed: {e}"));
    }

    // Shutdown: unregister discovery, stop the sweeper, close every
    // session; the queue is released when the state drops.
    if let Some(d) = discovery {
        d.shutdown();
    }
    sweeper.abort();
    state.close_all_sessions();
    info!("relay shut down gracefully");
}

async fn bind_or_exit(port: u16, name: &str) -> TcpListener {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => fatal(&format!("cannot bind {name} listener on port {port}: {e}")),
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("FATAL: {message}");
    std::process::exit(1);
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
