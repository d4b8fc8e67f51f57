//! Wire protocol of the external simulation engine.
//!
//! The engine is a black-box HTTP service. [`SimulationEngine`] exposes its
//! four calls with replies decoded just enough for the run driver to act on
//! the status code and the fields that matter; [`http::HttpEngineClient`] is
//! the production implementation.

/// HTTP implementation of the engine protocol.
pub mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::kpi::{KpiEntry, KpiModule};

pub use http::HttpEngineClient;

/// Reply to a start request.
#[derive(Clone, Debug, PartialEq)]
pub enum StartReply {
    /// `201` with the engine's simulation id.
    Started { simulation_id: String },
    /// `503`: the engine is busy and the request may be retried.
    Busy,
    /// Any other status, with the engine's `description`.
    Rejected { status: u16, description: String },
}

/// Simulation state reported by the status endpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum SimulationState {
    Running,
    Complete,
    Error,
    Other(String),
}

impl SimulationState {
    /// Decode the engine's `State` field.
    pub fn from_engine(state: &str) -> Self {
        match state {
            "RUNNING" => SimulationState::Running,
            "COMPLETE" => SimulationState::Complete,
            "ERROR" => SimulationState::Error,
            other => SimulationState::Other(other.to_string()),
        }
    }
}

/// Reply to a simulation status poll.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReply {
    pub status: u16,
    /// Present on `200` replies.
    pub state: Option<SimulationState>,
    /// Progress fraction while running, free text otherwise.
    pub description: String,
}

/// Reply to a KPI results poll.
#[derive(Clone, Debug, PartialEq)]
pub enum KpiReply {
    Reports(Vec<KpiEntry>),
    Failed { status: u16 },
}

/// The simulation engine's protocol.
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// `POST {engine}` with the run configuration and embedded model payload.
    async fn start(&self, body: &Value) -> Result<StartReply, EngineError>;

    /// `GET {engine}/{simulation_id}/status`.
    async fn simulation_status(&self, simulation_id: &str) -> Result<StatusReply, EngineError>;

    /// `GET {engine}/kpiModules`. Non-`200` replies are `EngineError::Unexpected`.
    async fn kpi_modules(&self) -> Result<Vec<KpiModule>, EngineError>;

    /// `GET {engine}/{simulation_id}/kpi`.
    async fn kpi_results(&self, simulation_id: &str) -> Result<KpiReply, EngineError>;
}

#[async_trait]
impl<E: SimulationEngine + ?Sized> SimulationEngine for std::sync::Arc<E> {
    async fn start(&self, body: &Value) -> Result<StartReply, EngineError> {
        (**self).start(body).await
    }

    async fn simulation_status(&self, simulation_id: &str) -> Result<StatusReply, EngineError> {
        (**self).simulation_status(simulation_id).await
    }

    async fn kpi_modules(&self) -> Result<Vec<KpiModule>, EngineError> {
        (**self).kpi_modules().await
    }

    async fn kpi_results(&self, simulation_id: &str) -> Result<KpiReply, EngineError> {
        (**self).kpi_results(simulation_id).await
    }
}
