//! Run drivers: the per-run state machines that talk to an engine.
//!
//! [`RunDriver`] is the capability the adapter dispatches; [`EngineDriver`]
//! implements it for the engine protocol in [`crate::engine`]:
//!
//! ```text
//! STARTING --201--> SIMULATION_MONITORING(progress) --COMPLETE--> KPI_MONITORING(progress)
//!    | 503: wait backoff, retry                                      | all KPIs settled
//!    v other                                                         v
//!  ERROR <------------- ERROR / 404 / other status / non-200 ---- SUCCEEDED
//! ```
//!
//! Only the busy reply to a start request is retried. Every other failure,
//! including transport failures, ends the run with a reason.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::DriverConfig;
use crate::dispatcher::CancellationToken;
use crate::engine::{KpiReply, SimulationEngine, SimulationState, StartReply};
use crate::error::EngineError;
use crate::events::{RunEvent, RunEventPayload, RunEventPublisher};
use crate::kpi::{KpiCatalogue, KpiResult, MonitorResult};
use crate::run::{ModelState, RunConfig, RunId};
use crate::telemetry;

/// Key of the start body that carries the base64-encoded model payload.
pub const MODEL_PAYLOAD_KEY: &str = "esdlContents";

/// Everything a driver needs to execute one run.
#[derive(Clone, Debug)]
pub struct DriveRequest {
    pub run_id: RunId,
    pub config: RunConfig,
    /// Serialized description of the system to simulate.
    pub model_payload: Vec<u8>,
    /// Fired when the run is removed; checked at every wait.
    pub cancel: CancellationToken,
}

/// Terminal outcome of driving one run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Succeeded { results: Vec<KpiResult> },
    Failed { reason: String },
    /// The run was cancelled before reaching a terminal engine state.
    Cancelled,
}

impl RunOutcome {
    /// Failed outcome with `reason`.
    pub fn failed(reason: impl Into<String>) -> Self {
        RunOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// Registry state this outcome resolves to.
    pub fn state(&self) -> ModelState {
        match self {
            RunOutcome::Succeeded { .. } => ModelState::Succeeded,
            RunOutcome::Failed { .. } | RunOutcome::Cancelled => ModelState::Error,
        }
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<String> {
        match self {
            RunOutcome::Succeeded { .. } => None,
            RunOutcome::Failed { reason } => Some(reason.clone()),
            RunOutcome::Cancelled => Some("run was cancelled".to_string()),
        }
    }
}

/// A protocol for executing runs against some engine.
#[async_trait]
pub trait RunDriver: Send + Sync + 'static {
    /// Short name used in logs and spans.
    fn name(&self) -> &'static str;

    /// Drive one run to a terminal outcome.
    async fn drive(&self, request: DriveRequest) -> RunOutcome;
}

/// Build the engine start body: the configured body plus the encoded model.
pub fn build_start_body(config: &RunConfig, model_payload: &[u8]) -> Value {
    let mut body = config.start_body.clone();
    body.insert(
        MODEL_PAYLOAD_KEY.to_string(),
        Value::String(STANDARD.encode(model_payload)),
    );
    Value::Object(body)
}

enum Phase {
    Starting {
        attempt: u32,
    },
    SimulationMonitoring {
        simulation_id: String,
        progress: f64,
    },
    KpiMonitoring {
        simulation_id: String,
        catalogue: Option<KpiCatalogue>,
    },
    Finished(RunOutcome),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Starting { .. } => "starting",
            Phase::SimulationMonitoring { .. } => "simulation_monitoring",
            Phase::KpiMonitoring { .. } => "kpi_monitoring",
            Phase::Finished(_) => "finished",
        }
    }
}

/// Driver for the simulation engine's start and dual-phase polling protocol.
pub struct EngineDriver<E> {
    engine: E,
    config: DriverConfig,
    events: Arc<dyn RunEventPublisher>,
}

impl<E> std::fmt::Debug for EngineDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDriver")
            .field("engine_type", &std::any::type_name::<E>())
            .field("config", &self.config)
            .finish()
    }
}

impl<E: SimulationEngine> EngineDriver<E> {
    /// Driver over `engine` publishing to `events`.
    pub fn new(engine: E, config: DriverConfig, events: Arc<dyn RunEventPublisher>) -> Self {
        Self {
            engine,
            config,
            events,
        }
    }

    /// Driver timing configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// The engine client.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    async fn emit(&self, run_id: RunId, payload: RunEventPayload) {
        if let Err(err) = self.events.publish(RunEvent::new(run_id, payload)).await {
            warn!("publishing run event failed: {err}");
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn engine_failure(phase: &str, err: EngineError) -> RunOutcome {
        match err {
            EngineError::Transport(detail) => {
                RunOutcome::failed(format!("engine unreachable during {phase}: {detail}"))
            }
            other => RunOutcome::failed(format!("{phase} failed: {other}")),
        }
    }

    async fn start_step(
        &self,
        run_id: RunId,
        body: &Value,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Phase {
        self.emit(run_id, RunEventPayload::StartAttempt { attempt }).await;
        info!(attempt, "trying to start simulation");

        let reply = match self.engine.start(body).await {
            Ok(reply) => reply,
            Err(err) => return Phase::Finished(Self::engine_failure("start", err)),
        };

        match reply {
            StartReply::Started { simulation_id } => {
                info!(simulation_id = %simulation_id, "simulation started");
                self.emit(
                    run_id,
                    RunEventPayload::SimulationStarted {
                        simulation_id: simulation_id.clone(),
                    },
                )
                .await;
                Phase::SimulationMonitoring {
                    simulation_id,
                    progress: 0.0,
                }
            }
            StartReply::Busy => {
                telemetry::record_engine_busy(run_id, attempt);
                self.emit(run_id, RunEventPayload::EngineBusy { attempt }).await;
                if let Some(max) = self.config.max_start_attempts {
                    if attempt >= max {
                        return Phase::Finished(RunOutcome::failed(format!(
                            "engine busy: gave up after {attempt} start attempts"
                        )));
                    }
                }
                if !self.pause(self.config.start_retry_backoff, cancel).await {
                    return Phase::Finished(RunOutcome::Cancelled);
                }
                Phase::Starting {
                    attempt: attempt + 1,
                }
            }
            StartReply::Rejected {
                status,
                description,
            } => {
                error!(status, "simulation failed to start: {description}");
                Phase::Finished(RunOutcome::failed(description))
            }
        }
    }

    async fn simulation_step(
        &self,
        run_id: RunId,
        simulation_id: String,
        progress: f64,
        cancel: &CancellationToken,
    ) -> Phase {
        let reply = match self.engine.simulation_status(&simulation_id).await {
            Ok(reply) => reply,
            Err(err) => {
                return Phase::Finished(Self::engine_failure("simulation monitoring", err))
            }
        };

        match (reply.status, reply.state) {
            (200, Some(SimulationState::Running)) => {
                let progress = match reply.description.trim().parse::<f64>() {
                    Ok(fraction) => fraction,
                    Err(_) => {
                        debug!(description = %reply.description, "unparsable progress");
                        progress
                    }
                };
                info!("{:.1}% complete", 100.0 * progress);
                self.emit(run_id, RunEventPayload::SimulationProgress { fraction: progress })
                    .await;
                if !self.pause(self.config.poll_interval, cancel).await {
                    return Phase::Finished(RunOutcome::Cancelled);
                }
                Phase::SimulationMonitoring {
                    simulation_id,
                    progress,
                }
            }
            (200, Some(SimulationState::Complete)) => {
                info!("simulation {}", reply.description);
                self.emit(run_id, RunEventPayload::SimulationComplete).await;
                Phase::KpiMonitoring {
                    simulation_id,
                    catalogue: None,
                }
            }
            (200, Some(SimulationState::Error)) => {
                error!("simulation failed: {}", reply.description);
                Phase::Finished(RunOutcome::failed(format!(
                    "simulation failed: {}",
                    reply.description
                )))
            }
            (200, Some(SimulationState::Other(state))) => Phase::Finished(RunOutcome::failed(
                format!("unexpected simulation state {state}: {}", reply.description),
            )),
            (status, _) => {
                error!(status, "progress monitoring failed: {}", reply.description);
                Phase::Finished(RunOutcome::failed(format!(
                    "progress monitoring API error ({status}): {}",
                    reply.description
                )))
            }
        }
    }

    async fn fetch_catalogue(&self) -> Result<KpiCatalogue, RunOutcome> {
        info!("retrieving KPI catalogue");
        match self.engine.kpi_modules().await {
            Ok(modules) => Ok(KpiCatalogue::from_modules(modules)),
            Err(EngineError::Transport(detail)) => Err(RunOutcome::failed(format!(
                "engine unreachable during kpi catalogue: {detail}"
            ))),
            Err(err) => {
                warn!("KPI catalogue unavailable, continuing without names: {err}");
                Ok(KpiCatalogue::default())
            }
        }
    }

    async fn kpi_step(
        &self,
        run_id: RunId,
        simulation_id: String,
        catalogue: Option<KpiCatalogue>,
        cancel: &CancellationToken,
    ) -> Phase {
        let catalogue = match catalogue {
            Some(catalogue) => catalogue,
            None => match self.fetch_catalogue().await {
                Ok(catalogue) => catalogue,
                Err(outcome) => return Phase::Finished(outcome),
            },
        };

        let reply = match self.engine.kpi_results(&simulation_id).await {
            Ok(reply) => reply,
            Err(err) => return Phase::Finished(Self::engine_failure("kpi monitoring", err)),
        };

        match reply {
            KpiReply::Reports(entries) => {
                let monitor = MonitorResult::aggregate(entries, &catalogue);
                self.emit(
                    run_id,
                    RunEventPayload::KpiProgress {
                        results: monitor.results.clone(),
                    },
                )
                .await;
                if monitor.still_calculating {
                    debug!(kpis = monitor.results.len(), "KPIs still calculating");
                    if !self.pause(self.config.poll_interval, cancel).await {
                        return Phase::Finished(RunOutcome::Cancelled);
                    }
                    Phase::KpiMonitoring {
                        simulation_id,
                        catalogue: Some(catalogue),
                    }
                } else {
                    info!(kpis = monitor.results.len(), "KPI modules finished");
                    Phase::Finished(RunOutcome::Succeeded {
                        results: monitor.results,
                    })
                }
            }
            KpiReply::Failed { status } => {
                error!(status, "KPI monitoring failed");
                Phase::Finished(RunOutcome::failed(format!(
                    "KPI monitoring API error ({status})"
                )))
            }
        }
    }

    async fn run_phases(&self, request: DriveRequest) -> RunOutcome {
        let DriveRequest {
            run_id,
            config,
            model_payload,
            cancel,
        } = request;
        let body = build_start_body(&config, &model_payload);
        let mut phase = Phase::Starting { attempt: 1 };

        loop {
            if cancel.is_cancelled() && !matches!(phase, Phase::Finished(_)) {
                phase = Phase::Finished(RunOutcome::Cancelled);
            }
            let phase_name = phase.name();
            phase = match phase {
                Phase::Finished(outcome) => {
                    if outcome == RunOutcome::Cancelled {
                        info!("run cancelled");
                    } else {
                        debug!(state = %outcome.state(), "driver finished");
                    }
                    return outcome;
                }
                Phase::Starting { attempt } => {
                    self.start_step(run_id, &body, attempt, &cancel)
                        .instrument(telemetry::phase_span(phase_name))
                        .await
                }
                Phase::SimulationMonitoring {
                    simulation_id,
                    progress,
                } => {
                    self.simulation_step(run_id, simulation_id, progress, &cancel)
                        .instrument(telemetry::phase_span(phase_name))
                        .await
                }
                Phase::KpiMonitoring {
                    simulation_id,
                    catalogue,
                } => {
                    self.kpi_step(run_id, simulation_id, catalogue, &cancel)
                        .instrument(telemetry::phase_span(phase_name))
                        .await
                }
            };
        }
    }
}

#[async_trait]
impl<E: SimulationEngine + 'static> RunDriver for EngineDriver<E> {
    fn name(&self) -> &'static str {
        "essim"
    }

    async fn drive(&self, request: DriveRequest) -> RunOutcome {
        let span = telemetry::run_span(request.run_id, self.name());
        self.run_phases(request).instrument(span).await
    }
}
