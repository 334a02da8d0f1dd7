//! Admin control surface.
//!
//! # Data Flow
//! ```text
//! origin-form request on the proxy port
//!     → admin_router (health, /admin/*)
//!     → handlers.rs (ModeManager, CacheStore, AuditLog)
//!     → anything else falls through to Dispatcher::handle_origin
//! ```
//!
//! # Design Decisions
//! - No authentication; the acting user is recorded, not verified
//! - Every admin-supplied domain is normalized and checked before it reaches disk

pub mod handlers;

use axum::{
    extract::{Request, State},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};

use self::handlers::*;
use crate::http::server::AppState;

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/status", get(get_status))
        .route("/admin/mode/{mode}", post(set_mode))
        .route("/admin/domains/{domain}/mode/{mode}", put(set_domain_mode))
        .route("/admin/domains/{domain}/mode", delete(clear_domain_mode))
        .route("/admin/hybrid", post(set_hybrid))
        .route("/admin/cache", get(list_cache).delete(clear_cache))
        .route(
            "/admin/cache/{domain}",
            get(list_domain_cache).delete(clear_domain_cache),
        )
        .route("/admin/audit", get(get_audit))
        .fallback(transparent)
        .with_state(state)
}

/// Origin-form request that is not an admin path: proxy it to its Host.
async fn transparent(State(state): State<AppState>, request: Request) -> Response {
    state.dispatcher.handle_origin(request).await
}
