//! Prometheus metrics instrumentation for simrun.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `simrun_runs_started_total` - Runs handed to the dispatcher
//! - `simrun_runs_finished_total` - Runs finalized, by terminal state
//! - `simrun_engine_busy_total` - Busy replies to start requests
//!
//! ## Gauges
//! - `simrun_dispatcher_in_flight` - Runs currently holding a worker
//!
//! ## Histograms
//! - `simrun_run_duration_seconds` - Time a run spends being driven, by terminal state
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, HistogramVec, IntCounter, IntGauge, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for simrun metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RUNS_STARTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "simrun_runs_started_total",
        "Total number of runs handed to the dispatcher",
    )
    .expect("simrun_runs_started_total metric creation failed")
});

/// Counter for finalized runs.
///
/// Labels:
/// - `state`: The terminal state (SUCCEEDED, ERROR)
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "simrun_runs_finished_total",
        "Total number of runs finalized",
    );
    CounterVec::new(opts, &["state"]).expect("simrun_runs_finished_total metric creation failed")
});

pub static ENGINE_BUSY_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "simrun_engine_busy_total",
        "Total number of busy replies to start requests",
    )
    .expect("simrun_engine_busy_total metric creation failed")
});

pub static DISPATCHER_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "simrun_dispatcher_in_flight",
        "Number of runs currently holding a dispatcher worker",
    )
    .expect("simrun_dispatcher_in_flight metric creation failed")
});

/// Histogram for how long runs are driven, in seconds.
///
/// Labels:
/// - `state`: The terminal state the driver produced
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(1.0, 2.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "simrun_run_duration_seconds",
        "Run driving duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["state"]).expect("simrun_run_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_STARTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_FINISHED_TOTAL.clone()),
        Box::new(ENGINE_BUSY_TOTAL.clone()),
        Box::new(DISPATCHER_IN_FLIGHT.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Count a run whose driver started.
pub fn record_run_started() {
    RUNS_STARTED_TOTAL.inc();
}

/// Count a finished run by terminal state.
pub fn record_run_finished(state: &str) {
    RUNS_FINISHED_TOTAL.with_label_values(&[state]).inc();
}

/// Count a busy reply to a start request.
pub fn record_engine_busy() {
    ENGINE_BUSY_TOTAL.inc();
}

/// Increment the in-flight driver gauge.
pub fn dispatcher_in_flight_inc() {
    DISPATCHER_IN_FLIGHT.inc();
}

/// Decrement the in-flight driver gauge.
pub fn dispatcher_in_flight_dec() {
    DISPATCHER_IN_FLIGHT.dec();
}

/// Observe how long a run was driven.
pub fn observe_run_duration(state: &str, duration_secs: f64) {
    RUN_DURATION_SECONDS
        .with_label_values(&[state])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
