//! LogKV Load Balancer
//!
//! Entry point: build the pool from `--servers`, probe every backend
//! once, then serve. All unmatched paths are forwarded to the selected
//! backend.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p logkv-balancer -- \
//!     --servers server1:8080,server2:8080,~server3:8080 \
//!     --port 8090 --timeout-sec 3 --health-interval 10 --trace
//! ```
//!
//! A `~` prefix marks a backend that begins marked unhealthy; the first
//! probe round decides its real state either way.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::Request, extract::State, response::Response, Router};
use clap::Parser;

use logkv_balancer::{Backend, ForwardConfig, HealthService, Pool, Upstream};

#[derive(Parser, Debug)]
#[command(name = "logkv-balancer", about = "Least-connections load balancer")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8090)]
    port: u16,

    /// Request (and probe) timeout in seconds.
    #[arg(long, default_value_t = 3)]
    timeout_sec: u64,

    /// Seconds between health probes per backend.
    #[arg(long, default_value_t = 10)]
    health_interval: u64,

    /// Dispatch to backends over https.
    #[arg(long)]
    https: bool,

    /// Add the lb-from response header naming the chosen backend.
    #[arg(long)]
    trace: bool,

    /// Comma-separated backend list; prefix a URL with `~` if it begins
    /// as unhealthy.
    #[arg(long, default_value = "server1:8080,server2:8080,server3:8080")]
    servers: String,
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

    let config = ForwardConfig {
        https: args.https,
        timeout: Duration::from_secs(args.timeout_sec),
        trace: args.trace,
    };
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(16)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .context("building http client")?;

    let backends: Vec<Arc<dyn Upstream>> = args
        .servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|url| {
            let (url, initially_healthy) = match url.strip_prefix('~') {
                Some(rest) => (rest, false),
                None => (url, true),
            };
            Arc::new(Backend::new(url, initially_healthy, client.clone(), config.clone()))
                as Arc<dyn Upstream>
        })
        .collect();
    anyhow::ensure!(!backends.is_empty(), "--servers must name at least one backend");

    tracing::info!(
        backends = backends.len(),
        timeout_sec = args.timeout_sec,
        trace = args.trace,
        "starting load balancer"
    );

    // Probe everyone before taking traffic.
    HealthService::new(backends.clone(), Duration::from_secs(args.health_interval))
        .start()
        .await;

    let pool = Arc::new(Pool::new(backends));
    let router = Router::new().fallback(forward).with_state(pool);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "load balancer listening");

    axum::serve(listener, router).await.context("server error")?;
    Ok(())
}

async fn forward(State(pool): State<Arc<Pool>>, req: Request) -> Response {
    pool.handle(req).await
}
