//! LogKV HTTP Facade
//!
//! HTTP/JSON API over the storage engine. The surface is deliberately
//! small - the engine is the interesting part, this crate is routing:
//!
//! - `GET /db/:key?type=<string|int64>` - look a key up; `type` omitted
//!   or `string` means string. `200` with `{"key": .., "value": ..}`
//!   (int64 values are JSON numbers), `400` on not-found, unknown type,
//!   or wrong type.
//! - `POST /db/:key?type=<string|int64>` with form field `value` - store
//!   a value. Empty values and non-integer int64 bodies are rejected with
//!   `400`.
//! - `GET /health` - liveness probe target, `200 OK`.

use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};

use logkv_storage::Database;

pub mod handlers;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// Create the facade router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/db/:key",
            get(handlers::get_value).post(handlers::put_value),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
}
