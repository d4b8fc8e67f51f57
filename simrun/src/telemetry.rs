//! Tracing and telemetry instrumentation for simrun.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics during run lifecycle events. All functions work both with and without
//! the `metrics` feature flag.
//!
//! # Features
//!
//! - Tracing spans for a driven run, each protocol phase and each engine call
//! - Integration with the `metrics` module for Prometheus metrics
//! - Helper functions that only log when features are disabled
//!
//! # Example
//!
//! ```ignore
//! use simrun::telemetry::{phase_span, record_run_started};
//! use tracing::Instrument;
//!
//! record_run_started(run_id);
//! poll_status().instrument(phase_span("simulation_monitoring")).await;
//! ```

use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::{info_span, Span};
use tracing_subscriber::EnvFilter;

use crate::run::{ModelState, RunId};

/// Create the span covering one driven run.
///
/// # Arguments
/// * `run_id` - The run identifier
/// * `driver` - Name of the driver executing the run
#[must_use]
pub fn run_span(run_id: RunId, driver: &str) -> Span {
    info_span!("simrun.run", run_id = %run_id, driver = %driver)
}

/// Create a span for one step of the engine protocol.
#[must_use]
pub fn phase_span(phase: &str) -> Span {
    info_span!("simrun.phase", phase = %phase)
}

/// Create a span for a single request to the engine.
///
/// # Arguments
/// * `call` - Which endpoint is called (start, status, kpi_modules, kpi)
/// * `simulation_id` - Engine simulation id, when the call targets one
#[must_use]
pub fn engine_call_span(call: &str, simulation_id: Option<&str>) -> Span {
    info_span!(
        "simrun.engine_call",
        call = %call,
        simulation_id = simulation_id.unwrap_or(""),
    )
}

/// Record that a run was handed to the dispatcher.
pub fn record_run_started(run_id: RunId) {
    tracing::info!(run_id = %run_id, "run started");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_started();
}

/// Record the terminal state a run was finalized with.
pub fn record_run_finished(run_id: RunId, state: ModelState, reason: Option<&str>) {
    match state {
        ModelState::Succeeded => tracing::info!(run_id = %run_id, state = %state, "run finished"),
        _ => tracing::warn!(
            run_id = %run_id,
            state = %state,
            reason = reason.unwrap_or(""),
            "run finished"
        ),
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(state.as_str());
}

/// Record a busy reply to a start request.
pub fn record_engine_busy(run_id: RunId, attempt: u32) {
    tracing::info!(run_id = %run_id, attempt, "engine busy, start will be retried");

    #[cfg(feature = "metrics")]
    crate::metrics::record_engine_busy();
}

/// Record that a dispatched run obtained a worker.
pub fn record_worker_acquired(run_id: RunId) {
    tracing::debug!(run_id = %run_id, "worker acquired");

    #[cfg(feature = "metrics")]
    crate::metrics::dispatcher_in_flight_inc();
}

/// Record that a dispatched run gave its worker back.
pub fn record_worker_released(run_id: RunId) {
    tracing::debug!(run_id = %run_id, "worker released");

    #[cfg(feature = "metrics")]
    crate::metrics::dispatcher_in_flight_dec();
}

/// Start measuring how long a run is driven.
///
/// Returns a handle that should be passed to [`record_run_end`].
pub fn record_run_start(run_id: RunId) -> RunTimingHandle {
    RunTimingHandle {
        run_id,
        start: Instant::now(),
    }
}

/// Observe the driving duration of a run under its terminal state.
pub fn record_run_end(handle: RunTimingHandle, state: ModelState) {
    let duration_secs = handle.elapsed().as_secs_f64();
    tracing::info!(
        run_id = %handle.run_id,
        state = %state,
        duration_secs,
        "run driven to completion"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_run_duration(state.as_str(), duration_secs);
}

/// Handle for tracking how long a run is driven.
#[derive(Debug)]
pub struct RunTimingHandle {
    run_id: RunId,
    start: Instant,
}

impl RunTimingHandle {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Install a formatting subscriber for binaries and demos.
///
/// `RUST_LOG` overrides `default_filter`. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(default_filter: impl Display) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span() {
        let span = run_span(RunId::new(), "essim");
        assert_eq!(span.metadata().unwrap().name(), "simrun.run");
    }

    #[test]
    fn test_phase_span() {
        let span = phase_span("starting");
        assert_eq!(span.metadata().unwrap().name(), "simrun.phase");
    }

    #[test]
    fn test_engine_call_span() {
        let span = engine_call_span("status", Some("sim-1"));
        assert_eq!(span.metadata().unwrap().name(), "simrun.engine_call");
    }

    #[test]
    fn test_timing_handle() {
        let run_id = RunId::new();
        let handle = record_run_start(run_id);
        assert_eq!(handle.run_id(), run_id);
        std::thread::sleep(Duration::from_millis(5));
        assert!(handle.elapsed() >= Duration::from_millis(5));
        record_run_end(handle, ModelState::Succeeded);
    }

    #[test]
    fn test_record_functions_do_not_panic() {
        let run_id = RunId::new();
        record_run_started(run_id);
        record_engine_busy(run_id, 2);
        record_worker_acquired(run_id);
        record_worker_released(run_id);
        record_run_finished(run_id, ModelState::Error, Some("engine busy"));
    }
}
