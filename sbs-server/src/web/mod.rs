//! Web server: axum JSON API over the live dispatcher.
//!
//! Handlers never touch the cache or the database directly; every request
//! becomes a dispatcher command answered on a oneshot channel.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::dispatcher::DispatcherHandle;

pub mod routes;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub dispatcher: DispatcherHandle,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// API routes, with anything else served from `web_root`.
pub fn build_router(state: Arc<AppState>, web_root: impl AsRef<Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/active", get(routes::api_active))
        .route("/planes", get(routes::api_planes))
        .route("/planes/:icao", get(routes::api_plane_detail))
        .route("/locations", get(routes::api_locations_missing_key))
        .route("/locations/:icao", get(routes::api_locations))
        .route("/favicon.ico", get(|| async { StatusCode::NOT_FOUND }))
        .fallback_service(ServeDir::new(web_root.as_ref()))
        .with_state(state)
        .layer(cors)
}

/// Serve `app` on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("SBS tracker listening on http://{addr}");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
