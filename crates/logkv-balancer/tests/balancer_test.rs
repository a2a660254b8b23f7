//! Balancer scenario tests: least-connections routing under sequential
//! and concurrent load, health-service behavior, and end-to-end
//! forwarding through real HTTP backends.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use logkv_balancer::{
    Backend, ForwardConfig, HealthService, Pool, Upstream, ALL_BACKENDS_DOWN,
};

/// Pool member with scripted behavior: an optional forward delay and an
/// optional always-failing probe.
struct MockUpstream {
    name: String,
    connections: AtomicI64,
    healthy: AtomicBool,
    forward_delay: Duration,
    failing_probe: bool,
    hits: AtomicU64,
}

impl MockUpstream {
    fn new(name: &str) -> Arc<Self> {
        Self::with(name, Duration::ZERO, false)
    }

    fn with(name: &str, forward_delay: Duration, failing_probe: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            connections: AtomicI64::new(0),
            healthy: AtomicBool::new(true),
            forward_delay,
            failing_probe,
            hits: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Upstream for MockUpstream {
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
        self.connections.fetch_add(1, Ordering::AcqRel);
        if !self.forward_delay.is_zero() {
            tokio::time::sleep(self.forward_delay).await;
        }
        self.hits.fetch_add(1, Ordering::AcqRel);
        let response = Response::new(Body::from(self.name.clone()));
        self.connections.fetch_sub(1, Ordering::AcqRel);
        response
    }

    async fn check_health(&self) {
        self.healthy.store(!self.failing_probe, Ordering::Release);
    }
}

fn request() -> Request {
    Request::builder().uri("/").body(Body::empty()).unwrap()
}

async fn body_string(resp: Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ---------------------------------------------------------------
// Least-connections routing
// ---------------------------------------------------------------

#[tokio::test]
async fn test_sequential_requests_all_hit_the_first_backend() {
    let pool = Pool::new(vec![
        MockUpstream::new("0") as Arc<dyn Upstream>,
        MockUpstream::new("1"),
        MockUpstream::new("2"),
    ]);

    for _ in 0..9 {
        let resp = pool.handle(request()).await;
        assert_eq!(body_string(resp).await, "0");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_spread_across_backends() {
    let backends = [
        MockUpstream::with("0", Duration::from_millis(50), false),
        MockUpstream::with("1", Duration::from_millis(50), false),
        MockUpstream::with("2", Duration::from_millis(50), false),
    ];
    let pool = Arc::new(Pool::new(
        backends.iter().map(|b| b.clone() as Arc<dyn Upstream>).collect(),
    ));

    // Stagger the starts so each request observes the previous ones as
    // in-flight; the 50ms forward delay keeps them all overlapping.
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(
            async move { body_string(pool.handle(request()).await).await },
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut served: Vec<String> = Vec::new();
    for task in tasks {
        served.push(task.await.unwrap());
    }
    served.sort();
    assert_eq!(served, vec!["0", "1", "2"]);

    for backend in &backends {
        assert_eq!(backend.hits.load(Ordering::Acquire), 1);
    }
}

// ---------------------------------------------------------------
// Health service
// ---------------------------------------------------------------

#[tokio::test]
async fn test_failing_backend_is_marked_down_and_skipped() {
    let backends = [
        MockUpstream::with("0", Duration::ZERO, false),
        MockUpstream::with("1", Duration::ZERO, true),
        MockUpstream::with("2", Duration::ZERO, false),
    ];
    let upstreams: Vec<Arc<dyn Upstream>> =
        backends.iter().map(|b| b.clone() as Arc<dyn Upstream>).collect();

    HealthService::new(upstreams.clone(), Duration::from_secs(3600))
        .start()
        .await;
    assert!(!backends[1].is_healthy());

    let pool = Pool::new(upstreams);
    for _ in 0..6 {
        let resp = pool.handle(request()).await;
        assert_ne!(body_string(resp).await, "1");
    }
    assert_eq!(backends[1].hits.load(Ordering::Acquire), 0);
}

#[tokio::test]
async fn test_all_backends_down_yields_503_with_fixed_body() {
    let backends = [
        MockUpstream::with("0", Duration::ZERO, true),
        MockUpstream::with("1", Duration::ZERO, true),
    ];
    let upstreams: Vec<Arc<dyn Upstream>> =
        backends.iter().map(|b| b.clone() as Arc<dyn Upstream>).collect();

    HealthService::new(upstreams.clone(), Duration::from_secs(3600))
        .start()
        .await;

    let pool = Pool::new(upstreams);
    let resp = pool.handle(request()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_string(resp).await, ALL_BACKENDS_DOWN);
}

// ---------------------------------------------------------------
// End-to-end forwarding through real HTTP servers
// ---------------------------------------------------------------

/// Spin up a real backend answering /health with 200 and everything else
/// with its own name. Returns its host:port.
async fn spawn_backend(name: &'static str) -> String {
    let router = Router::new()
        .route("/health", get(|| async { "OK" }))
        .fallback(move || async move { name.into_response() });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn forward_config(trace: bool) -> ForwardConfig {
    ForwardConfig {
        https: false,
        timeout: Duration::from_secs(3),
        trace,
    }
}

#[tokio::test]
async fn test_forwarding_relays_response_and_trace_header() {
    let addr = spawn_backend("backend-a").await;
    let client = reqwest::Client::new();
    let backend = Arc::new(Backend::new(
        addr.clone(),
        true,
        client,
        forward_config(true),
    )) as Arc<dyn Upstream>;
    let pool = Pool::new(vec![backend]);

    let resp = pool.handle(request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("lb-from").unwrap().to_str().unwrap(),
        addr
    );
    assert_eq!(body_string(resp).await, "backend-a");
}

#[tokio::test]
async fn test_trace_header_absent_when_disabled() {
    let addr = spawn_backend("backend-b").await;
    let client = reqwest::Client::new();
    let backend = Arc::new(Backend::new(addr, true, client, forward_config(false)))
        as Arc<dyn Upstream>;
    let pool = Pool::new(vec![backend]);

    let resp = pool.handle(request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("lb-from").is_none());
}

#[tokio::test]
async fn test_probe_flips_health_both_ways() {
    let addr = spawn_backend("backend-c").await;
    let client = reqwest::Client::new();

    // Begins marked unhealthy (the `~` case); a probe restores it.
    let backend = Backend::new(addr, false, client.clone(), forward_config(false));
    assert!(!backend.is_healthy());
    backend.check_health().await;
    assert!(backend.is_healthy());

    // A dead address takes it down again.
    let dead = reserve_dead_addr().await;
    let backend = Backend::new(dead, true, client, forward_config(false));
    backend.check_health().await;
    assert!(!backend.is_healthy());
}

#[tokio::test]
async fn test_transport_failure_marks_backend_unhealthy_and_returns_503() {
    let dead = reserve_dead_addr().await;
    let client = reqwest::Client::new();
    let backend = Arc::new(Backend::new(dead, true, client, forward_config(false)));

    let resp = backend.forward(request()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(!backend.is_healthy());
    assert_eq!(backend.connections(), 0);
}

/// An address nothing is listening on: bind an ephemeral port, then drop
/// the listener.
async fn reserve_dead_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("127.0.0.1:{}", addr.port())
}
