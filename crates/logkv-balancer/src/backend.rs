//! Backend - One Downstream Server
//!
//! A [`Backend`] is one member of the pool: its URL, an atomic in-flight
//! connection counter, an atomic health flag, and the two operations the
//! balancer needs - [`Upstream::forward`] and [`Upstream::check_health`].
//!
//! The counter is incremented before the request is dispatched and
//! decremented after the response has been relayed, whether the call
//! succeeded or not; `balance()` reads it with acquire ordering, which is
//! what keeps the pool fair under concurrent load. The per-request
//! timeout covers the whole exchange - connecting, the request, and
//! reading the response body - so a stalled backend cannot pin a relay
//! task indefinitely.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::error::BalancerError;

/// Response header naming the backend that served the request, added
/// when tracing is enabled.
pub const TRACE_HEADER: &str = "lb-from";

/// Settings shared by every backend in the pool.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Dispatch to backends over https instead of http.
    pub https: bool,
    /// Per-request timeout, also used for health probes.
    pub timeout: Duration,
    /// Add the `lb-from` response header.
    pub trace: bool,
}

impl ForwardConfig {
    fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}

/// The seam between the pool and its members. Production code uses
/// [`Backend`]; tests drop in mocks.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// host:port of this backend.
    fn url(&self) -> &str;

    /// In-flight request count.
    fn connections(&self) -> i64;

    fn is_healthy(&self) -> bool;

    /// Relay `req` to this backend and return the response to send to
    /// the client. Never fails outward: a transport error becomes a 503
    /// and flips the health flag.
    async fn forward(&self, req: Request) -> Response;

    /// Probe `GET /health`; healthy iff it answers 200 within the
    /// timeout.
    async fn check_health(&self);
}

/// A real downstream HTTP server.
pub struct Backend {
    url: String,
    connections: AtomicI64,
    healthy: AtomicBool,
    client: reqwest::Client,
    config: ForwardConfig,
}

impl Backend {
    /// `initially_healthy` is the flag's value before the first probe;
    /// the health service's initial round overwrites it either way.
    pub fn new(
        url: impl Into<String>,
        initially_healthy: bool,
        client: reqwest::Client,
        config: ForwardConfig,
    ) -> Self {
        Self {
            url: url.into(),
            connections: AtomicI64::new(0),
            healthy: AtomicBool::new(initially_healthy),
            client,
            config,
        }
    }

    async fn proxy(&self, req: Request) -> Result<Response, BalancerError> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}://{}{}", self.config.scheme(), self.url, path_and_query);

        // Replay the request against the backend origin; the Host header
        // must name the backend, so drop the client's.
        let mut headers = parts.headers;
        headers.remove(header::HOST);

        let unavailable = |source| BalancerError::BackendUnavailable {
            url: self.url.clone(),
            source,
        };

        let resp = self
            .client
            .request(parts.method, &target)
            .headers(headers)
            .body(body)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(unavailable)?;

        let status = resp.status();
        let resp_headers = resp.headers().clone();
        // The timeout set above also bounds this read.
        let bytes = resp.bytes().await.map_err(unavailable)?;

        debug!(backend = %self.url, status = %status, "fwd");

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = resp_headers;
        if self.config.trace {
            if let Ok(value) = HeaderValue::from_str(&self.url) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(TRACE_HEADER), value);
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for Backend {
    fn url(&self) -> &str {
        &self.url
    }

    fn connections(&self) -> i64 {
        self.connections.load(Ordering::Acquire)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    async fn forward(&self, req: Request) -> Response {
        self.connections.fetch_add(1, Ordering::AcqRel);
        let result = self.proxy(req).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                warn!(backend = %self.url, error = %e, "forward failed, backend marked unhealthy");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        };
        self.connections.fetch_sub(1, Ordering::AcqRel);
        response
    }

    async fn check_health(&self) {
        let url = format!("{}://{}/health", self.config.scheme(), self.url);
        let healthy = matches!(
            self.client
                .get(&url)
                .timeout(self.config.timeout)
                .send()
                .await,
            Ok(resp) if resp.status() == StatusCode::OK
        );
        self.healthy.store(healthy, Ordering::Release);
        debug!(backend = %self.url, healthy, "health probe");
    }
}
