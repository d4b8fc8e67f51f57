//! Test doubles for simrun.
//!
//! - [`ScriptedEngine`] replays scripted engine replies and records every call
//!   with its (virtual) time.
//! - [`InMemoryObjectStore`], [`InMemoryTimeSeriesStore`] and [`JsonModelStore`]
//!   stand in for the storage collaborators behind a `StorageBridge`.
//! - [`fixtures`] builds run configurations and KPI reports.

pub mod engine;
pub mod fixtures;
pub mod store;

pub use engine::*;
pub use store::*;
