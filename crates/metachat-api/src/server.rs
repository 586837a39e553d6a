//! Control surface server: builds the axum router and runs the listener.

use crate::routes::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use metachat_types::message::normalize_name;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Top-level paths owned by the control surface itself.
const RESERVED_PATHS: [&str; 2] = ["health", "rooms"];

/// Build the full router: built-in routes plus every backend webhook,
/// nested under `/{normalized backend name}`.
pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health))
        .route("/rooms/{room}", post(routes::post_room))
        .with_state(state.clone());

    for backend in state.backends() {
        let Some(hook) = backend.webhook() else {
            continue;
        };
        let name = normalize_name(backend.name());
        if RESERVED_PATHS.contains(&name.as_str()) {
            warn!(backend = %backend.name(), "Webhook path is reserved, not mounting");
            continue;
        }
        info!(backend = %backend.name(), path = %format!("/{name}"), "Webhook mounted");
        app = app.nest(&format!("/{name}"), hook);
    }

    app.layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Control surface listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
