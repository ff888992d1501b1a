use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "campaign_dimensions";

/// Prometheus metrics for the dimension pipeline.
///
/// All metrics use the "campaign_dimensions" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Pipeline ===
    /// Visit contexts run through the dimension.
    pub visits_processed: Counter,
    /// Interactions whose aggregation failed and produced no records.
    pub visits_failed: Counter,
    /// Aggregate records emitted.
    pub records_emitted: Counter,
    /// Input lines that could not be decoded, by error kind.
    pub input_parse_errors: CounterVec,
    /// Time to aggregate one interaction (100us-10s buckets).
    pub interaction_processing_duration: Histogram,

    // === Aggregation ===
    /// Message events that produced no record, by reason.
    pub events_skipped: CounterVec,
    /// First-occurrence checks by result.
    pub unique_checks: CounterVec,
    /// Entries held by the unique-event cache.
    pub unique_cache_entries: Gauge,

    // === Contact store ===
    /// Contact lookups by outcome (found/not_found/error).
    pub contact_lookups: CounterVec,
    /// Contact lookup duration including retries.
    pub contact_lookup_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let visits_processed = Counter::with_opts(
            Opts::new("visits_processed_total", "Total visit contexts processed.")
                .namespace(NAMESPACE),
        )?;
        let visits_failed = Counter::with_opts(
            Opts::new(
                "visits_failed_total",
                "Total interactions whose aggregation failed.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_emitted = Counter::with_opts(
            Opts::new("records_emitted_total", "Total aggregate records emitted.")
                .namespace(NAMESPACE),
        )?;
        let input_parse_errors = CounterVec::new(
            Opts::new(
                "input_parse_errors_total",
                "Input lines that could not be decoded by error kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let interaction_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "interaction_processing_duration_seconds",
                "Time to aggregate one interaction.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;

        let events_skipped = CounterVec::new(
            Opts::new(
                "events_skipped_total",
                "Message events that produced no record by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let unique_checks = CounterVec::new(
            Opts::new(
                "unique_checks_total",
                "First-occurrence checks by result.",
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;
        let unique_cache_entries = Gauge::with_opts(
            Opts::new(
                "unique_cache_entries",
                "Confirmed first occurrences held in memory.",
            )
            .namespace(NAMESPACE),
        )?;

        let contact_lookups = CounterVec::new(
            Opts::new(
                "contact_lookups_total",
                "Contact store lookups by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let contact_lookup_duration = Histogram::with_opts(
            HistogramOpts::new(
                "contact_lookup_duration_seconds",
                "Contact store lookup duration including retries.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(visits_processed.clone()))?;
        registry.register(Box::new(visits_failed.clone()))?;
        registry.register(Box::new(records_emitted.clone()))?;
        registry.register(Box::new(input_parse_errors.clone()))?;
        registry.register(Box::new(interaction_processing_duration.clone()))?;
        registry.register(Box::new(events_skipped.clone()))?;
        registry.register(Box::new(unique_checks.clone()))?;
        registry.register(Box::new(unique_cache_entries.clone()))?;
        registry.register(Box::new(contact_lookups.clone()))?;
        registry.register(Box::new(contact_lookup_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            visits_processed,
            visits_failed,
            records_emitted,
            input_parse_errors,
            interaction_processing_duration,
            events_skipped,
            unique_checks,
            unique_cache_entries,
            contact_lookups,
            contact_lookup_duration,
        })
    }

    /// Records the outcome of one contact lookup.
    pub fn record_contact_lookup(&self, status: &str, duration: std::time::Duration) {
        self.contact_lookups.with_label_values(&[status]).inc();
        self.contact_lookup_duration
            .observe(duration.as_secs_f64());
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
