//! Control Plane Server (spec.md §4.9): the remote backend's HTTP
//! counterpart, a thin axum `Router` over a SQLite-backed party/peer/relay
//! registry.
//!
//! No teacher file maps directly onto this crate (the teacher's portal is
//! an Elixir/Phoenix application, out of reach for a Rust corpus); it is
//! grounded instead in the teacher's own narrower axum servers
//! (`relay/server/src/control_endpoint.rs`, `bin-shared/src/
//! http_health_check.rs`) for the `Router`/`State`/`axum::serve` shape, and
//! in general `sqlx` idiom for persistence (see DESIGN.md).

mod auth;
pub mod cleanup;
mod db;
mod handlers;

pub use auth::{generate_token, DEFAULT_TOKEN_TTL};
pub use db::connect;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub token_ttl: Arc<Duration>,
}

impl AppState {
    pub fn new(pool: SqlitePool, token_ttl: Duration) -> Self {
        Self {
            pool,
            token_ttl: Arc::new(token_ttl),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database unavailable")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Database(error) => {
                tracing::error!(%error, "database error serving request");
                (StatusCode::SERVICE_UNAVAILABLE, "database unavailable".to_string())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Assembles the full route table described in spec.md §6.1/§4.9.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(handlers::register))
        .route("/parties", post(handlers::create_party))
        .route("/parties/{party_id}/join", post(handlers::join_party))
        .route(
            "/parties/{party_id}/peers/{peer_id}",
            delete(handlers::delete_peer).get(handlers::get_peer),
        )
        .route("/parties/{party_id}", get(handlers::get_party))
        .route("/parties/{party_id}/peers", get(handlers::list_peers))
        .route(
            "/parties/{party_id}/peers/{peer_id}/heartbeat",
            post(handlers::heartbeat),
        )
        .route("/relays", post(handlers::register_relay).get(handlers::list_relays))
        .route("/health", get(handlers::health))
        .with_state(state)
}
