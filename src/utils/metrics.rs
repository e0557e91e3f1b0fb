//! Prometheus metrics for collective observability.
//!
//! A `CollectiveMetrics` is created by the embedding process and handed to the
//! components that record into it.

use crate::utils::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
#[cfg(feature = "metrics-server")]
use tracing::info;

/// Collective call counters, communicator gauges and rendezvous timings.
pub struct CollectiveMetrics {
    pub registry: Registry,

    pub collective_calls: IntCounterVec,
    pub collective_failures: IntCounterVec,

    pub live_communicators: IntGauge,
    pub tracker_releases: IntCounter,

    /// Blocking time of join and split.
    pub rendezvous_time: Histogram,
}

impl CollectiveMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let collective_calls = IntCounterVec::new(
            Opts::new("spmd_collective_calls_total", "Collective entry points invoked"),
            &["op"],
        )?;
        registry.register(Box::new(collective_calls.clone()))?;

        let collective_failures = IntCounterVec::new(
            Opts::new("spmd_collective_failures_total", "Collective entry points that failed"),
            &["op"],
        )?;
        registry.register(Box::new(collective_failures.clone()))?;

        let live_communicators = IntGauge::with_opts(Opts::new(
            "spmd_live_communicators",
            "Communicators created and not yet destroyed",
        ))?;
        registry.register(Box::new(live_communicators.clone()))?;

        let tracker_releases = IntCounter::with_opts(Opts::new(
            "spmd_tracker_releases_total",
            "Tracked resources released",
        ))?;
        registry.register(Box::new(tracker_releases.clone()))?;

        let rendezvous_time = Histogram::with_opts(
            HistogramOpts::new("spmd_rendezvous_seconds", "Time blocked in join or split")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )?;
        registry.register(Box::new(rendezvous_time.clone()))?;

        Ok(Self {
            registry,
            collective_calls,
            collective_failures,
            live_communicators,
            tracker_releases,
            rendezvous_time,
        })
    }

    /// Count one call of `op`, and a failure if `ok` is false.
    pub fn record_call(&self, op: &str, ok: bool) {
        self.collective_calls.with_label_values(&[op]).inc();
        if !ok {
            self.collective_failures.with_label_values(&[op]).inc();
        }
    }

    pub fn record_rendezvous(&self, elapsed: Duration) {
        self.rendezvous_time.observe(elapsed.as_secs_f64());
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Serve the text exposition of `metrics` over HTTP on `port`.
///
/// Every request is answered with the current metrics, whatever its path.
#[cfg(feature = "metrics-server")]
pub async fn serve_metrics(
    metrics: std::sync::Arc<CollectiveMetrics>,
    port: u16,
) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let body = metrics.gather().unwrap_or_else(|e| format!("# {}\n", e));
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}
