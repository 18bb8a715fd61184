//! Prometheus metrics, registered once at process startup and exported over
//! `/metrics` by both binaries (mirrors `rchd::http_api::metrics_handler`
//! plus the `rchd::metrics` module it calls into).

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    /// Jobs created, labeled by nothing beyond the counter itself.
    pub static ref JOBS_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("tcg_jobs_created_total", "Improvement jobs created"),
        &[],
    )
    .expect("metric name is valid");

    /// Jobs reaching a terminal state, labeled by status.
    pub static ref JOBS_TERMINAL_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("tcg_jobs_terminal_total", "Improvement jobs reaching a terminal state"),
        &["status"],
    )
    .expect("metric name is valid");

    /// Coverage scan duration in seconds.
    pub static ref SCAN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("tcg_scan_duration_seconds", "Coverage scan duration"),
        &[],
    )
    .expect("metric name is valid");

    /// Number of generate/validate attempts consumed per job.
    pub static ref GENERATION_ATTEMPTS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("tcg_generation_attempts", "Generate/validate attempts per job")
            .buckets(vec![1.0, 2.0, 3.0]),
        &[],
    )
    .expect("metric name is valid");

    /// Clone directories currently held by an in-flight job.
    pub static ref ACTIVE_CLONES: IntGauge = IntGauge::new(
        "tcg_active_clones",
        "Clone directories currently held by an in-flight job",
    )
    .expect("metric name is valid");
}

/// Register all metrics with the global registry. Idempotent-safe to call
/// once per process at startup; a second call in the same process would
/// panic on duplicate registration, so callers guard with `std::sync::Once`
/// if they might initialize twice (tests do, via [`register_for_test`]).
pub fn register() {
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_TERMINAL_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SCAN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(GENERATION_ATTEMPTS.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_CLONES.clone()));
}

/// Encode the current metric snapshot in the Prometheus text exposition
/// format, for the `/metrics` HTTP handler.
pub fn encode() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn register_for_test() {
        INIT.call_once(register);
    }

    #[test]
    fn encode_reflects_counter_increments() {
        register_for_test();
        JOBS_CREATED_TOTAL.with_label_values(&[]).inc();
        let output = encode().unwrap();
        assert!(output.contains("tcg_jobs_created_total"));
    }
}
