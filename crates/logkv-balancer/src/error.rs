//! Balancer error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
    /// The transport to a backend failed; the backend gets marked
    /// unhealthy and the client sees a 503.
    #[error("backend {url} unavailable: {source}")]
    BackendUnavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The incoming request body could not be read.
    #[error("failed to read request body: {0}")]
    RequestBody(#[from] axum::Error),

    /// Every backend in the pool is marked unhealthy.
    #[error("no healthy backend in the pool")]
    NoHealthyBackend,
}
