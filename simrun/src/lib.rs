//! simrun - run lifecycle adapter for an external simulation engine.
//!
//! Submits long-running simulation jobs to an engine over HTTP, tracks each
//! run through `ACCEPTED → READY → RUNNING → {SUCCEEDED | ERROR}` and polls
//! the engine's two-phase status protocol (simulation progress, then KPI
//! progress) until a terminal outcome is known.
//!
//! # Core Concepts
//!
//! - **Registry**: [`RunRegistry`] is the authoritative map from run id to
//!   [`RunRecord`], serializing updates per record.
//!
//! - **Dispatcher**: [`Dispatcher`] executes at most one driver task per run on
//!   a bounded worker pool, with non-consuming [`Dispatcher::peek`] and
//!   exactly-once [`Dispatcher::take`].
//!
//! - **Driver**: the [`RunDriver`] capability; [`EngineDriver`] implements the
//!   start-with-retry and dual-phase polling protocol against a
//!   [`SimulationEngine`] such as [`HttpEngineClient`].
//!
//! - **Bridge**: [`ResultBridge`] loads model payloads and persists results of
//!   successful runs; [`StorageBridge`] implements it over object, time-series
//!   and model stores.
//!
//! - **Adapter**: [`SimulationAdapter`] ties everything together behind the
//!   request/initialize/run/status/results/remove operations.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use simrun::*;
//!
//! let config = AdapterConfig::from_env()?;
//! let engine = HttpEngineClient::new(&config.engine)?;
//! let adapter = SimulationAdapter::for_engine(config, engine).build()?;
//!
//! let id = adapter.request().model_run_id;
//! adapter.initialize(&id, run_config).await;
//! adapter.run(&id).await;
//! ```

/// The adapter facade and its builder.
pub mod adapter;

/// Storage collaborators and the result bridge.
///
/// Provides [`ObjectStore`], [`TimeSeriesStore`] and [`ModelStore`], the
/// [`ResultBridge`] seam used by the adapter, and [`StorageBridge`] with its
/// profile helpers ([`TimeRange`], [`SeriesPoint`], [`TimeSeries`]).
pub mod bridge;

/// Configuration for the engine client, driver timing and worker pool.
pub mod config;

/// Bounded per-run task execution with cancellation.
pub mod dispatcher;

/// Run drivers and the engine protocol state machine.
pub mod driver;

/// Engine protocol replies and the HTTP client.
pub mod engine;

/// Typed errors of the registry, dispatcher and engine client.
pub mod error;

/// Run event publishing.
///
/// [`RunEventBus`] broadcasts [`RunEvent`]s in process; publishing never
/// waits for subscribers.
pub mod events;

/// KPI catalogue, engine reports and their aggregation.
pub mod kpi;

/// Authoritative run registry with per-record locking.
pub mod registry;

/// Run identifiers, lifecycle states, records and the externally visible run info.
pub mod run;

/// Tracing spans and structured log helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// The `metrics` module provides counters, gauges and histograms for run
/// lifecycle monitoring when the `metrics` feature is enabled.
pub mod metrics;

pub use adapter::*;
pub use bridge::*;
pub use config::*;
pub use dispatcher::*;
pub use driver::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use kpi::*;
pub use registry::*;
pub use run::*;
