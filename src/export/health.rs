use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for daemon health.
///
/// All metrics use the "bpfchaind" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Successful program starts by name/direction/iface.
    pub program_starts: CounterVec,
    /// Program stops by name/direction/iface.
    pub program_stops: CounterVec,
    /// Applied configuration updates by name/direction/iface.
    pub program_updates: CounterVec,
    /// Failed configuration updates by name/direction/iface.
    pub program_update_failures: CounterVec,
    /// Whether a program is running (1) or not (0), with its version.
    pub programs_running: GaugeVec,
    /// Latest aggregated monitor-map value per program metric.
    pub monitor_map_value: GaugeVec,
    /// Number of installed programs per interface and hook, root included.
    pub chain_length: GaugeVec,
    /// Wall time of Reconcile calls.
    pub reconcile_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let program_starts = CounterVec::new(
            Opts::new("program_starts_total", "Successful program starts.").namespace("bpfchaind"),
            &["name", "direction", "iface"],
        )?;
        let program_stops = CounterVec::new(
            Opts::new("program_stops_total", "Program stops.").namespace("bpfchaind"),
            &["name", "direction", "iface"],
        )?;
        let program_updates = CounterVec::new(
            Opts::new("program_updates_total", "Applied configuration updates.")
                .namespace("bpfchaind"),
            &["name", "direction", "iface"],
        )?;
        let program_update_failures = CounterVec::new(
            Opts::new(
                "program_update_failures_total",
                "Failed configuration updates.",
            )
            .namespace("bpfchaind"),
            &["name", "direction", "iface"],
        )?;
        let programs_running = GaugeVec::new(
            Opts::new("programs_running", "Program liveness (1 running, 0 stopped).")
                .namespace("bpfchaind"),
            &["name", "version", "direction", "iface"],
        )?;
        let monitor_map_value = GaugeVec::new(
            Opts::new("monitor_map_value", "Aggregated monitor-map samples.")
                .namespace("bpfchaind"),
            &["program", "metric", "iface"],
        )?;
        let chain_length = GaugeVec::new(
            Opts::new("chain_length", "Installed programs per interface and hook.")
                .namespace("bpfchaind"),
            &["iface", "hook"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Wall time of Reconcile calls.")
                .namespace("bpfchaind")
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;

        registry.register(Box::new(program_starts.clone()))?;
        registry.register(Box::new(program_stops.clone()))?;
        registry.register(Box::new(program_updates.clone()))?;
        registry.register(Box::new(program_update_failures.clone()))?;
        registry.register(Box::new(programs_running.clone()))?;
        registry.register(Box::new(monitor_map_value.clone()))?;
        registry.register(Box::new(chain_length.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            program_starts,
            program_stops,
            program_updates,
            program_update_failures,
            programs_running,
            monitor_map_value,
            chain_length,
            reconcile_duration,
        })
    }

    /// Start the HTTP server exposing /healthz and /metrics.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("parsing health listen address {}", self.addr))?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health server to {addr}"))?;

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics))
            .with_state(Arc::clone(self));

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "health server exited");
            }
        });

        tracing::info!(addr = %addr, "health server started");
        Ok(())
    }

    /// Stop the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        Ok(())
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(health): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = health.registry.gather();

    let mut buf = Vec::with_capacity(4096);
    match encoder.encode(&families, &mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new("127.0.0.1:0").unwrap();
        health
            .program_starts
            .with_label_values(&["ratelimit", "xdp_ingress", "eth0"])
            .inc();
        health
            .programs_running
            .with_label_values(&["ratelimit", "1.0.0", "xdp_ingress", "eth0"])
            .set(1.0);

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&health.registry.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("bpfchaind_program_starts_total"));
        assert!(text.contains("bpfchaind_programs_running"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").unwrap());
        health.start().await.unwrap();
        health.stop().await.unwrap();
    }
}
