//! Health Service
//!
//! Probes every backend once, synchronously, before the balancer starts
//! serving - a backend is never selected on a health flag nobody has
//! verified. After that, each backend gets its own probe task firing
//! every `interval`; the tasks are independent, so a slow or failing
//! probe on one backend never delays probes on another.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::info;

use crate::backend::Upstream;

pub struct HealthService {
    backends: Vec<Arc<dyn Upstream>>,
    interval: Duration,
}

impl HealthService {
    pub fn new(backends: Vec<Arc<dyn Upstream>>, interval: Duration) -> Self {
        Self { backends, interval }
    }

    /// Run the initial probe round, then spawn the per-backend probe
    /// tasks. Returns once every backend has been probed at least once.
    pub async fn start(&self) {
        join_all(self.backends.iter().map(|b| b.check_health())).await;
        info!(
            backends = self.backends.len(),
            healthy = self.backends.iter().filter(|b| b.is_healthy()).count(),
            "initial health probe round complete"
        );

        for backend in &self.backends {
            let backend = backend.clone();
            let period = self.interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // The first tick fires immediately and the initial round
                // already covered it.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    backend.check_health().await;
                }
            });
        }
    }
}
