//! Pool - Least-Connections Selection
//!
//! The pool is a fixed list of backends built once at startup; members
//! are never added or removed at runtime. Selection scans the list
//! linearly, skips unhealthy members, and picks the one with the
//! strictly smallest in-flight connection count - ties go to the lowest
//! index, so an idle pool always drains through its first healthy member.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::backend::Upstream;

/// Body of the 503 returned when no backend is healthy.
pub const ALL_BACKENDS_DOWN: &str = "Request handling error: all servers are out of reach";

pub struct Pool {
    backends: Vec<Arc<dyn Upstream>>,
}

impl Pool {
    pub fn new(backends: Vec<Arc<dyn Upstream>>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<dyn Upstream>] {
        &self.backends
    }

    /// The healthy backend with the fewest in-flight connections, or
    /// `None` when every backend is unhealthy.
    pub fn balance(&self) -> Option<Arc<dyn Upstream>> {
        let mut best: Option<(&Arc<dyn Upstream>, i64)> = None;
        for backend in &self.backends {
            if !backend.is_healthy() {
                continue;
            }
            let connections = backend.connections();
            match best {
                Some((_, fewest)) if connections >= fewest => {}
                _ => best = Some((backend, connections)),
            }
        }
        best.map(|(backend, _)| backend.clone())
    }

    /// Route one request: select a backend and forward, or answer 503
    /// when the pool has no healthy member.
    pub async fn handle(&self, req: Request) -> Response {
        match self.balance() {
            Some(backend) => backend.forward(req).await,
            None => {
                error!("no healthy backend available");
                (StatusCode::SERVICE_UNAVAILABLE, ALL_BACKENDS_DOWN).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    struct FixedUpstream {
        name: String,
        connections: AtomicI64,
        healthy: AtomicBool,
    }

    impl FixedUpstream {
        fn new(name: &str, connections: i64, healthy: bool) -> Arc<dyn Upstream> {
            Arc::new(Self {
                name: name.to_string(),
                connections: AtomicI64::new(connections),
                healthy: AtomicBool::new(healthy),
            })
        }
    }

    #[async_trait]
    impl Upstream for FixedUpstream {
        fn url(&self) -> &str {
            &self.name
        }
        fn connections(&self) -> i64 {
            self.connections.load(Ordering::Acquire)
        }
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }
        async fn forward(&self, _req: Request) -> Response {
            Response::new(Body::from(self.name.clone()))
        }
        async fn check_health(&self) {}
    }

    fn selected(pool: &Pool) -> Option<String> {
        pool.balance().map(|b| b.url().to_string())
    }

    #[test]
    fn test_equal_connections_choose_first() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 0, true),
            FixedUpstream::new("1", 0, true),
            FixedUpstream::new("2", 0, true),
        ]);
        assert_eq!(selected(&pool).as_deref(), Some("0"));
    }

    #[test]
    fn test_tie_among_later_backends_chooses_earlier() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 1, true),
            FixedUpstream::new("1", 1, true),
            FixedUpstream::new("2", 0, true),
            FixedUpstream::new("3", 0, true),
        ]);
        assert_eq!(selected(&pool).as_deref(), Some("2"));
    }

    #[test]
    fn test_minimum_in_the_middle() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 1, true),
            FixedUpstream::new("1", 4, true),
            FixedUpstream::new("2", 6, true),
            FixedUpstream::new("3", 0, true),
            FixedUpstream::new("4", 4, true),
        ]);
        assert_eq!(selected(&pool).as_deref(), Some("3"));
    }

    #[test]
    fn test_minimum_at_the_end() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 3, true),
            FixedUpstream::new("1", 2, true),
            FixedUpstream::new("2", 1, true),
        ]);
        assert_eq!(selected(&pool).as_deref(), Some("2"));
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let pool = Pool::new(vec![]);
        assert!(pool.balance().is_none());
    }

    #[test]
    fn test_unhealthy_backends_are_skipped() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 0, false),
            FixedUpstream::new("1", 0, true),
            FixedUpstream::new("2", 0, true),
        ]);
        assert_eq!(selected(&pool).as_deref(), Some("1"));
    }

    #[test]
    fn test_all_unhealthy_selects_nothing() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 0, false),
            FixedUpstream::new("1", 0, false),
        ]);
        assert!(pool.balance().is_none());
    }

    #[test]
    fn test_unhealthy_minimum_is_ignored() {
        let pool = Pool::new(vec![
            FixedUpstream::new("0", 1, false),
            FixedUpstream::new("1", 0, false),
            FixedUpstream::new("2", 10, true),
            FixedUpstream::new("3", 9, true),
            FixedUpstream::new("4", 2, false),
        ]);
        assert_eq!(selected(&pool).as_deref(), Some("3"));
    }

    #[test]
    fn test_large_pool_finds_single_minimum() {
        for minimum in [0usize, 499, 999] {
            let backends = (0..1000)
                .map(|i| FixedUpstream::new(&i.to_string(), i64::from(i != minimum as i32), true))
                .collect();
            let pool = Pool::new(backends);
            assert_eq!(selected(&pool), Some(minimum.to_string()));
        }
    }

    #[tokio::test]
    async fn test_handle_with_all_down_returns_503_with_fixed_body() {
        let pool = Pool::new(vec![FixedUpstream::new("0", 0, false)]);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = pool.handle(req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, ALL_BACKENDS_DOWN.as_bytes());
    }
}
