//! LogKV Server
//!
//! Main entry point for the key/value HTTP service: opens the database,
//! serves the `/db/:key` facade, and closes the engine cleanly on ctrl-c.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: port 8100, data in ./out
//! cargo run -p logkv-server
//!
//! # Custom port and data directory
//! cargo run -p logkv-server -- --port 9000 --dir /var/lib/logkv
//! ```
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG` (default `info`):
//! ```bash
//! RUST_LOG=debug cargo run -p logkv-server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use logkv_server::{create_router, AppState};
use logkv_storage::{Database, DbConfig};

#[derive(Parser, Debug)]
#[command(name = "logkv-server", about = "LogKV key/value HTTP service")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8100)]
    port: u16,

    /// Directory holding the segment files.
    #[arg(long, default_value = "./out")]
    dir: PathBuf,

    /// Segment size threshold in bytes before rollover.
    #[arg(long, default_value_t = 10_000_000)]
    segment_max_size: u64,
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

    let config = DbConfig {
        segment_max_size: args.segment_max_size,
        ..Default::default()
    };
    let db = Arc::new(
        Database::open(&args.dir, config)
            .await
            .with_context(|| format!("opening database in {}", args.dir.display()))?,
    );

    let router = create_router(AppState { db: db.clone() });
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(%addr, dir = %args.dir.display(), "logkv server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    db.close().await.context("closing database")?;
    Ok(())
}
