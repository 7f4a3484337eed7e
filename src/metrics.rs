//! Prometheus metrics for the worker.
//!
//! This module provides:
//! - [`WorkerMetrics`], the three task metrics labelled by `task_type`
//! - A router serving them at the configured path (`/metrics/` by default)
//! - [`serve_metrics`], which runs that router until shutdown
//!
//! Each [`WorkerMetrics`] owns its registry, so tests can observe a private
//! set of counters while the worker keeps using [`WorkerMetrics::global`].

use crate::config::{CorsConfig, MetricsConfig};
use crate::error::RelayResult;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Label attached to every task metric.
pub const TASK_TYPE_LABEL: &str = "task_type";

/// Worker metrics handle. Cheap to clone.
#[derive(Clone)]
pub struct WorkerMetrics {
    registry: Arc<Registry>,
    processed: IntCounterVec,
    failed: IntCounterVec,
    in_progress: IntGaugeVec,
    in_flight: Arc<AtomicI64>,
    in_flight_peak: Arc<AtomicI64>,
}

impl std::fmt::Debug for WorkerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMetrics")
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> RelayResult<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl WorkerMetrics {
    /// Create the metrics in a fresh registry.
    pub fn new() -> RelayResult<Self> {
        let registry = Registry::new();

        let processed = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "worker_processed_tasks_total",
                    "The total number of processed tasks",
                ),
                &[TASK_TYPE_LABEL],
            )?,
        )?;

        let failed = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "worker_failed_tasks_total",
                    "The total number of times processing failed",
                ),
                &[TASK_TYPE_LABEL],
            )?,
        )?;

        let in_progress = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(
                    "worker_in_progress_tasks",
                    "The number of tasks currently being processed",
                ),
                &[TASK_TYPE_LABEL],
            )?,
        )?;

        Ok(Self {
            registry: Arc::new(registry),
            processed,
            failed,
            in_progress,
            in_flight: Arc::new(AtomicI64::new(0)),
            in_flight_peak: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Process-wide metrics shared by every worker.
    pub fn global() -> RelayResult<Self> {
        static GLOBAL: OnceLock<WorkerMetrics> = OnceLock::new();
        if let Some(metrics) = GLOBAL.get() {
            return Ok(metrics.clone());
        }
        let metrics = Self::new()?;
        Ok(GLOBAL.get_or_init(|| metrics).clone())
    }

    /// Registry the metrics live in; handlers may register their own.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count a task as in progress until the returned guard drops.
    pub fn track_in_progress(&self, task_type: &str) -> InProgressGuard {
        self.in_progress.with_label_values(&[task_type]).inc();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight_peak.fetch_max(now, Ordering::SeqCst);
        InProgressGuard {
            metrics: self.clone(),
            task_type: task_type.to_string(),
        }
    }

    /// Count a finished invocation.
    pub fn record_processed(&self, task_type: &str) {
        self.processed.with_label_values(&[task_type]).inc();
    }

    /// Count a failed invocation.
    pub fn record_failed(&self, task_type: &str) {
        self.failed.with_label_values(&[task_type]).inc();
    }

    /// Current value of `worker_processed_tasks_total{task_type}`.
    pub fn processed(&self, task_type: &str) -> u64 {
        self.processed.with_label_values(&[task_type]).get()
    }

    /// Current value of `worker_failed_tasks_total{task_type}`.
    pub fn failed(&self, task_type: &str) -> u64 {
        self.failed.with_label_values(&[task_type]).get()
    }

    /// Current value of `worker_in_progress_tasks{task_type}`.
    pub fn in_progress(&self, task_type: &str) -> i64 {
        self.in_progress.with_label_values(&[task_type]).get()
    }

    /// In-progress tasks summed over all types.
    pub fn in_progress_total(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest value [`Self::in_progress_total`] has reached.
    pub fn in_progress_peak(&self) -> i64 {
        self.in_flight_peak.load(Ordering::SeqCst)
    }

    /// Encode every metric in the registry in Prometheus text format.
    pub fn render(&self) -> RelayResult<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Decrements the in-progress gauge when dropped, including during unwinds.
#[derive(Debug)]
pub struct InProgressGuard {
    metrics: WorkerMetrics,
    task_type: String,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.metrics
            .in_progress
            .with_label_values(&[self.task_type.as_str()])
            .dec();
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn metrics_handler(State(metrics): State<WorkerMetrics>) -> impl IntoResponse {
    match metrics.render() {
        Ok(buffer) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-store"),
                ],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Router serving `metrics` at `config.path`, wrapped in the configured CORS policy.
pub fn metrics_router(metrics: WorkerMetrics, config: &MetricsConfig) -> Router {
    let router = Router::new()
        .route(&config.path, get(metrics_handler))
        .with_state(metrics);

    if config.cors.enabled {
        router.layer(build_cors_layer(&config.cors))
    } else {
        router
    }
}

fn has_wildcard(values: &[String]) -> bool {
    values.iter().any(|v| v == "*")
}

fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    let any_method = has_wildcard(&config.allowed_methods);
    let any_header = has_wildcard(&config.allowed_headers);
    let any_origin = has_wildcard(&config.allowed_origins);

    let mut cors = CorsLayer::new().max_age(Duration::from_secs(config.max_age_secs));

    if any_method {
        cors = cors.allow_methods(Any);
    } else {
        let methods: Vec<Method> = config
            .allowed_methods
            .iter()
            .filter_map(|m| match Method::from_bytes(m.to_ascii_uppercase().as_bytes()) {
                Ok(method) => Some(method),
                Err(_) => {
                    warn!(method = %m, "Ignoring invalid CORS method");
                    None
                }
            })
            .collect();
        cors = cors.allow_methods(methods);
    }

    if any_header {
        cors = cors.allow_headers(Any);
    } else {
        let headers: Vec<HeaderName> = config
            .allowed_headers
            .iter()
            .filter_map(|h| match HeaderName::from_bytes(h.as_bytes()) {
                Ok(name) => Some(name),
                Err(_) => {
                    warn!(header = %h, "Ignoring invalid CORS header");
                    None
                }
            })
            .collect();
        cors = cors.allow_headers(headers);
    }

    if any_origin {
        if config.allowed_origins.len() > 1 {
            warn!(origins = ?config.allowed_origins, "'*' overrides the other CORS origins");
        }
        cors = cors.allow_origin(Any);
    } else if !config.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(origin) => Some(origin),
                Err(_) => {
                    warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    // Credentials cannot be combined with any wildcard.
    if config.allow_credentials {
        if any_origin || any_method || any_header {
            error!("CORS credentials are not allowed with a wildcard origin, method or header; ignoring");
        } else {
            cors = cors.allow_credentials(true);
        }
    }

    cors
}

/// Serve the metrics router until `shutdown` turns true.
pub async fn serve_metrics(
    config: MetricsConfig,
    metrics: WorkerMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> RelayResult<()> {
    let addr: SocketAddr = config.listen_addr.parse().map_err(|_| {
        crate::error::RelayError::config(format!(
            "Invalid metrics listen address '{}'",
            config.listen_addr
        ))
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, path = %config.path, "Metrics endpoint listening");

    let app = metrics_router(metrics, &config);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            debug!("Metrics endpoint shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_counters_are_labelled_by_task_type() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_processed("system:health_check");
        metrics.record_processed("system:health_check");
        metrics.record_failed("system:license_expiry");

        assert_eq!(metrics.processed("system:health_check"), 2);
        assert_eq!(metrics.processed("system:license_expiry"), 0);
        assert_eq!(metrics.failed("system:license_expiry"), 1);
    }

    #[test]
    fn test_in_progress_guard() {
        let metrics = WorkerMetrics::new().unwrap();
        {
            let _a = metrics.track_in_progress("a");
            let _b = metrics.track_in_progress("b");
            assert_eq!(metrics.in_progress("a"), 1);
            assert_eq!(metrics.in_progress_total(), 2);
        }
        assert_eq!(metrics.in_progress("a"), 0);
        assert_eq!(metrics.in_progress_total(), 0);
        assert_eq!(metrics.in_progress_peak(), 2);
    }

    #[test]
    fn test_guard_drops_on_panic() {
        let metrics = WorkerMetrics::new().unwrap();
        let cloned = metrics.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.track_in_progress("a");
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(metrics.in_progress("a"), 0);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_processed("system:health_check");
        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains("worker_processed_tasks_total{task_type=\"system:health_check\"} 1"));
    }

    #[tokio::test]
    async fn test_router_serves_uncacheable_metrics() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_processed("system:health_check");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = metrics_router(metrics, &MetricsConfig::default());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let lower = response.to_ascii_lowercase();
        assert!(lower.starts_with("http/1.1 200"));
        assert!(lower.contains("cache-control: no-store"));
        assert!(response.contains("worker_processed_tasks_total"));
    }

    async fn send(app: Router, request: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.to_ascii_lowercase()
    }

    fn cors_config(cors: CorsConfig) -> MetricsConfig {
        MetricsConfig {
            cors: CorsConfig {
                enabled: true,
                ..cors
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cors_headers_follow_config() {
        let config = cors_config(CorsConfig {
            allowed_origins: vec!["https://tracker.example.com".to_string()],
            allow_credentials: true,
            max_age_secs: 600,
            ..Default::default()
        });
        let metrics = WorkerMetrics::new().unwrap();

        let listed = send(
            metrics_router(metrics.clone(), &config),
            "GET /metrics/ HTTP/1.1\r\nHost: localhost\r\nOrigin: https://tracker.example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(listed.starts_with("http/1.1 200"));
        assert!(listed.contains("access-control-allow-origin: https://tracker.example.com"));
        assert!(listed.contains("access-control-allow-credentials: true"));

        let unlisted = send(
            metrics_router(metrics.clone(), &config),
            "GET /metrics/ HTTP/1.1\r\nHost: localhost\r\nOrigin: https://elsewhere.example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(unlisted.starts_with("http/1.1 200"));
        assert!(!unlisted.contains("access-control-allow-origin"));

        let preflight = send(
            metrics_router(metrics, &config),
            "OPTIONS /metrics/ HTTP/1.1\r\nHost: localhost\r\nOrigin: https://tracker.example.com\r\nAccess-Control-Request-Method: GET\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(preflight.contains("access-control-allow-origin: https://tracker.example.com"));
        assert!(preflight.contains("access-control-max-age: 600"));
        assert!(preflight.contains("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn test_cors_wildcards_drop_credentials() {
        let config = cors_config(CorsConfig {
            allowed_origins: vec!["https://tracker.example.com".to_string()],
            allowed_methods: vec!["*".to_string()],
            allowed_headers: vec!["*".to_string()],
            allow_credentials: true,
            ..Default::default()
        });
        let app = metrics_router(WorkerMetrics::new().unwrap(), &config);

        let response = send(
            app,
            "GET /metrics/ HTTP/1.1\r\nHost: localhost\r\nOrigin: https://tracker.example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("http/1.1 200"));
        assert!(response.contains("access-control-allow-origin: https://tracker.example.com"));
        assert!(!response.contains("access-control-allow-credentials"));

        // A wildcard origin with credentials builds as well.
        let config = cors_config(CorsConfig {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: true,
            ..Default::default()
        });
        let _app = metrics_router(WorkerMetrics::new().unwrap(), &config);
    }
}
