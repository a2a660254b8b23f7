//! Demo Application Backend
//!
//! One of the application servers the load balancer fronts. It does
//! three things:
//!
//! - answers `GET /health` with `200 OK` or `500 FAILURE` according to a
//!   toggleable health flag (with `--debug`, `POST /inverse-health`
//!   flips it - handy for watching the balancer drop a backend)
//! - proxies `GET /api/v1/some-data?key=<k>` to the KV service's
//!   `/db/<k>`, optionally delaying the response by `--delay-ms` to make
//!   load spread visible
//! - counts incoming requests by their `lb-from` header and serves the
//!   tally at `GET /report`
//!
//! On startup it seeds the KV service with the deployment date under a
//! well-known key, so a fresh cluster has something to read immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Key the startup marker is stored under in the KV service.
const START_DATE_KEY: &str = "backend-start-date";

#[derive(Parser, Debug)]
#[command(name = "logkv-backend", about = "Demo application backend for LogKV")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Artificial response delay in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Initial health state.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    health: bool,

    /// Expose POST /inverse-health for flipping the health flag.
    #[arg(long)]
    debug: bool,

    /// host:port of the KV service.
    #[arg(long, default_value = "localhost:8100")]
    db_url: String,
}

#[derive(Clone)]
struct BackendState {
    healthy: Arc<AtomicBool>,
    /// Requests seen, keyed by the balancer instance that forwarded them.
    report: Arc<RwLock<HashMap<String, u64>>>,
    client: reqwest::Client,
    db_url: String,
    delay: Duration,
}

#[derive(Debug, Deserialize)]
struct DataQuery {
    #[serde(default)]
    key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let state = BackendState {
        healthy: Arc::new(AtomicBool::new(args.health)),
        report: Arc::new(RwLock::new(HashMap::new())),
        client: reqwest::Client::new(),
        db_url: args.db_url.clone(),
        delay: Duration::from_millis(args.delay_ms),
    };

    seed_start_date(&state).await;

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/some-data", get(some_data))
        .route("/report", get(report));
    if args.debug {
        router = router.route("/inverse-health", post(inverse_health));
    }
    let router = router.with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, db_url = %args.db_url, "backend listening");

    axum::serve(listener, router).await.context("server error")?;
    Ok(())
}

/// Store today's date in the KV service. A cold KV service is not fatal;
/// the marker is a convenience, not a dependency.
async fn seed_start_date(state: &BackendState) {
    let url = format!("http://{}/db/{}", state.db_url, START_DATE_KEY);
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let form = [("value", today.as_str())];

    match state.client.post(&url).form(&form).send().await {
        Ok(resp) if resp.status().is_success() => {
            info!(key = START_DATE_KEY, value = %today, "seeded start date")
        }
        Ok(resp) => warn!(status = %resp.status(), "seeding start date rejected"),
        Err(e) => warn!(error = %e, "KV service unreachable, start date not seeded"),
    }
}

async fn health(State(state): State<BackendState>) -> Response {
    if state.healthy.load(Ordering::Acquire) {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "FAILURE").into_response()
    }
}

async fn inverse_health(State(state): State<BackendState>) -> StatusCode {
    state.healthy.fetch_xor(true, Ordering::AcqRel);
    StatusCode::OK
}

/// Proxy a read to the KV service, mirroring its status and body.
async fn some_data(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Query(query): Query<DataQuery>,
) -> Response {
    let from = headers
        .get("lb-from")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("direct")
        .to_string();
    *state.report.write().await.entry(from).or_insert(0) += 1;

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let url = format!("http://{}/db/{}", state.db_url, query.key);
    match state.client.get(&url).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            match resp.bytes().await {
                Ok(body) => (status, Body::from(body)).into_response(),
                Err(e) => {
                    warn!(error = %e, "reading KV response failed");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Err(e) => {
            warn!(error = %e, %url, "KV service request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn report(State(state): State<BackendState>) -> Json<HashMap<String, u64>> {
    Json(state.report.read().await.clone())
}
