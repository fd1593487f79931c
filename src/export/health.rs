use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "meshpop";

/// Prometheus metrics for an ingestion run.
///
/// All metrics use the "meshpop" namespace. The registry is always
/// populated; serving it over HTTP is optional.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Batches the partitioner put on the work queue.
    pub batches_enqueued: Counter,
    /// Batch matrices producers put on the output queue.
    pub batches_emitted: Counter,
    /// Batches discarded, by reason.
    pub batches_dropped: CounterVec,
    /// Batch matrices written into the array.
    pub batches_written: Counter,
    /// Rows returned by the row store.
    pub rows_fetched: Counter,
    /// Rows placed into a batch matrix.
    pub rows_placed: Counter,
    /// Rows skipped, by reason.
    pub rows_skipped: CounterVec,
    /// Array columns written so far.
    pub columns_written: Gauge,
    /// Array columns in total (`N`).
    pub columns_total: Gauge,
    /// Producer threads still running.
    pub workers_active: Gauge,
    /// Messages buffered per queue (work/output).
    pub queue_length: GaugeVec,
    /// Row store query time per batch (5ms-10s buckets).
    pub batch_fetch_duration: Histogram,
    /// Array window write time per batch (1ms-5s buckets).
    pub window_write_duration: Histogram,
    /// Duration of setup phases.
    pub setup_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    ///
    /// An empty `addr` disables the HTTP server.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let batches_enqueued = Counter::with_opts(
            Opts::new(
                "batches_enqueued_total",
                "Total batches put on the work queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_emitted = Counter::with_opts(
            Opts::new(
                "batches_emitted_total",
                "Total batch matrices put on the output queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_dropped = CounterVec::new(
            Opts::new("batches_dropped_total", "Total batches dropped by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let batches_written = Counter::with_opts(
            Opts::new(
                "batches_written_total",
                "Total batch matrices written to the array.",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_fetched = Counter::with_opts(
            Opts::new("rows_fetched_total", "Total rows returned by the row store.")
                .namespace(NAMESPACE),
        )?;
        let rows_placed = Counter::with_opts(
            Opts::new("rows_placed_total", "Total rows placed into batch matrices.")
                .namespace(NAMESPACE),
        )?;
        let rows_skipped = CounterVec::new(
            Opts::new("rows_skipped_total", "Total rows skipped by reason.").namespace(NAMESPACE),
            &["reason"],
        )?;
        let columns_written = Gauge::with_opts(
            Opts::new("columns_written", "Array columns written so far.").namespace(NAMESPACE),
        )?;
        let columns_total = Gauge::with_opts(
            Opts::new("columns_total", "Array columns in total.").namespace(NAMESPACE),
        )?;
        let workers_active = Gauge::with_opts(
            Opts::new("workers_active", "Producer threads still running.").namespace(NAMESPACE),
        )?;
        let queue_length = GaugeVec::new(
            Opts::new("queue_length", "Messages buffered per queue.").namespace(NAMESPACE),
            &["queue"],
        )?;
        let batch_fetch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_fetch_duration_seconds",
                "Row store query time per batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let window_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "window_write_duration_seconds",
                "Array window write time per batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let setup_duration = GaugeVec::new(
            Opts::new("setup_duration_seconds", "Duration of setup phases.").namespace(NAMESPACE),
            &["phase"],
        )?;

        registry.register(Box::new(batches_enqueued.clone()))?;
        registry.register(Box::new(batches_emitted.clone()))?;
        registry.register(Box::new(batches_dropped.clone()))?;
        registry.register(Box::new(batches_written.clone()))?;
        registry.register(Box::new(rows_fetched.clone()))?;
        registry.register(Box::new(rows_placed.clone()))?;
        registry.register(Box::new(rows_skipped.clone()))?;
        registry.register(Box::new(columns_written.clone()))?;
        registry.register(Box::new(columns_total.clone()))?;
        registry.register(Box::new(workers_active.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(batch_fetch_duration.clone()))?;
        registry.register(Box::new(window_write_duration.clone()))?;
        registry.register(Box::new(setup_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            batches_enqueued,
            batches_emitted,
            batches_dropped,
            batches_written,
            rows_fetched,
            rows_placed,
            rows_skipped,
            columns_written,
            columns_total,
            workers_active,
            queue_length,
            batch_fetch_duration,
            window_write_duration,
            setup_duration,
        })
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving `/metrics` and `/healthz`.
    ///
    /// Does nothing when no address is configured. Must be called from
    /// within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Ok(());
        }

        // Accept the ":9090" shorthand for all interfaces.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let metrics = HealthMetrics::new("").unwrap();
        metrics.batches_enqueued.inc();
        metrics
            .batches_dropped
            .with_label_values(&["query"])
            .inc_by(2.0);

        let text = metrics.render().unwrap();
        assert!(text.contains("meshpop_batches_enqueued_total 1"));
        assert!(text.contains("meshpop_batches_dropped_total{reason=\"query\"} 2"));
    }

    #[tokio::test]
    async fn test_start_without_addr_is_noop() {
        let metrics = HealthMetrics::new("").unwrap();
        metrics.start().await.unwrap();
        assert!(metrics.shutdown.lock().is_none());
        metrics.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_server() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.start().await.unwrap();
        assert!(metrics.shutdown.lock().is_some());
        metrics.stop().await.unwrap();
        assert!(metrics.shutdown.lock().is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_addr() {
        let metrics = HealthMetrics::new("not-an-addr").unwrap();
        let err = metrics.start().await.unwrap_err();
        assert!(err.to_string().contains("listening on not-an-addr"));
    }
}
