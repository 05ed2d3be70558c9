#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Minimal metrics for fractal render runs.
//!
//! Exposes a small set of Prometheus metrics:
//! - `fractal_dispatches_total`: Render dispatches completed (all devices)
//! - `fractal_pixels_total`: Pixels rendered (all devices)
//! - `fractal_devices`: Devices found by the last enumeration
//! - `fractal_cpu_workers`: Worker threads used by the CPU engine
//! - `fractal_last_batch_seconds`: Wall time of the last timed batch
//! - `fractal_batch_seconds_total`: Wall time summed over all timed batches
//!
//! Optionally runs a Warp-based HTTP endpoint (`/metrics`) when the
//! `http-exporter` feature is enabled.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntCounter, IntGauge, Registry};

#[cfg(feature = "http-exporter")]
use {
    anyhow::Result,
    prometheus::{Encoder, TextEncoder},
    std::net::SocketAddr,
    warp::Filter,
};

#[cfg(not(feature = "http-exporter"))]
use anyhow::Result;

// ---------------------------------------------------------------------------
// Global Registry
// ---------------------------------------------------------------------------

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<M>(metric: M, name: &str) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        log::warn!("failed to register metric {name}: {e}");
    }
    metric
}

// ---------------------------------------------------------------------------
// Counter Metrics
// ---------------------------------------------------------------------------

static DISPATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fractal_dispatches_total", "Render dispatches completed")
        .expect("create fractal_dispatches_total");
    register(c, "fractal_dispatches_total")
});

static PIXELS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fractal_pixels_total", "Pixels rendered across all devices")
        .expect("create fractal_pixels_total");
    register(c, "fractal_pixels_total")
});

// ---------------------------------------------------------------------------
// Gauge Metrics
// ---------------------------------------------------------------------------

static DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("fractal_devices", "Compute devices found by the last enumeration")
        .expect("create fractal_devices");
    register(g, "fractal_devices")
});

static CPU_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("fractal_cpu_workers", "Worker threads used by the CPU engine")
        .expect("create fractal_cpu_workers");
    register(g, "fractal_cpu_workers")
});

static LAST_BATCH_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new(
        "fractal_last_batch_seconds",
        "Wall time of the most recent timed render batch",
    )
    .expect("create fractal_last_batch_seconds");
    register(g, "fractal_last_batch_seconds")
});

static BATCH_SECONDS_TOTAL: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new(
        "fractal_batch_seconds_total",
        "Wall time summed over all timed render batches",
    )
    .expect("create fractal_batch_seconds_total");
    register(g, "fractal_batch_seconds_total")
});

// ---------------------------------------------------------------------------
// Public API - Recording
// ---------------------------------------------------------------------------

/// Record one completed dispatch of `pixels` pixels.
pub fn record_dispatch(pixels: u64) {
    DISPATCHES_TOTAL.inc();
    PIXELS_TOTAL.inc_by(pixels);
}

/// Record the wall time of a finished batch.
pub fn record_batch(seconds: f64) {
    LAST_BATCH_SECONDS.set(seconds);
    BATCH_SECONDS_TOTAL.add(seconds);
}

// ---------------------------------------------------------------------------
// Public API - Gauges
// ---------------------------------------------------------------------------

/// Set the number of enumerated devices.
pub fn set_devices(n: i64) {
    DEVICES.set(n);
}

/// Set the number of CPU worker threads.
pub fn set_cpu_workers(n: i64) {
    CPU_WORKERS.set(n);
}

// ---------------------------------------------------------------------------
// Public API - Snapshot
// ---------------------------------------------------------------------------

/// Total dispatches recorded so far.
pub fn dispatches_total() -> u64 {
    DISPATCHES_TOTAL.get()
}

/// Render the registry in the Prometheus text format.
pub fn gather_text() -> String {
    use prometheus::{Encoder, TextEncoder};

    // Touch every metric so an idle registry still lists them.
    Lazy::force(&DISPATCHES_TOTAL);
    Lazy::force(&PIXELS_TOTAL);
    Lazy::force(&DEVICES);
    Lazy::force(&CPU_WORKERS);
    Lazy::force(&LAST_BATCH_SECONDS);
    Lazy::force(&BATCH_SECONDS_TOTAL);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::with_capacity(4096);
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        log::warn!("failed to encode metrics: {e}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// HTTP Exporter
// ---------------------------------------------------------------------------

/// Start the Prometheus HTTP exporter on `0.0.0.0:port`.
///
/// Spawns the exporter as a background task and returns immediately.
/// Serves plaintext metrics at `GET /metrics`.
#[cfg(feature = "http-exporter")]
pub async fn start_http_exporter(port: u16) -> Result<()> {
    let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
        let encoder = TextEncoder::new();
        warp::http::Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(gather_text())
    });

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    tokio::spawn(async move {
        warp::serve(metrics_route).run(addr).await;
    });
    log::info!("Metrics exporter listening on http://{addr}/metrics");

    Ok(())
}

/// No-op when HTTP exporter feature is disabled.
#[cfg(not(feature = "http-exporter"))]
pub async fn start_http_exporter(_port: u16) -> Result<()> {
    log::warn!(
        "metrics::start_http_exporter called but 'http-exporter' feature is disabled; ignoring"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_accumulate() {
        let before = dispatches_total();
        record_dispatch(16);
        record_dispatch(16);
        assert!(dispatches_total() >= before + 2);
    }

    #[test]
    fn text_export_lists_all_metrics() {
        set_devices(3);
        record_batch(0.25);
        let text = gather_text();
        for name in [
            "fractal_dispatches_total",
            "fractal_pixels_total",
            "fractal_devices",
            "fractal_cpu_workers",
            "fractal_last_batch_seconds",
            "fractal_batch_seconds_total",
        ] {
            assert!(text.contains(name), "missing {name} in:\n{text}");
        }
    }
}
