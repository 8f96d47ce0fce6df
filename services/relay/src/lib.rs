// relay: HelpHub relay server library.
// Exposes modules for integration testing.

pub mod admin_api;
pub mod config;
pub mod console;
pub mod discovery;
pub mod framed;
pub mod router;
pub mod state;
pub mod storage;
pub mod sweeper;
pub mod tls;
pub mod ws_push;

pub use state::{RelayState, SharedState};

use axum::{routing::get, Router};
use std::path::PathBuf;
use tower_http::services::{ServeDir, ServeFile};

/// Build the HTTP router: the push-socket upgrade plus the web client's
/// static assets with an index fallback.
pub fn build_router(state: SharedState, webapp_dir: PathBuf) -> Router {
    let index = webapp_dir.join("index.html");
    let assets = ServeDir::new(webapp_dir).fallback(ServeFile::new(index));
    Router::new()
        .route("/ws", get(ws_push::ws_push_handler))
        .fallback_service(assets)
        .with_state(state)
}
