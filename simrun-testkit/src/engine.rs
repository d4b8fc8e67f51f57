use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use simrun::{
    EngineError, KpiEntry, KpiModule, KpiReply, SimulationEngine, SimulationState, StartReply,
    StatusReply,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

/// One request the engine received.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCall {
    Start { body: Value },
    Status { simulation_id: String },
    KpiModules,
    Kpi { simulation_id: String },
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub call: EngineCall,
    pub at: Instant,
}

/// Replies for one endpoint, served in order. The last reply repeats.
type Script<T> = Arc<Mutex<VecDeque<Result<T, EngineError>>>>;

/// Engine that answers from per-endpoint scripts.
///
/// An endpoint with no script answers with a transport error.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    starts: Script<StartReply>,
    statuses: Script<StatusReply>,
    modules: Script<Vec<KpiModule>>,
    kpis: Script<KpiReply>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

fn next<T: Clone>(script: &Script<T>, endpoint: &str) -> Result<T, EngineError> {
    let mut script = script.lock();
    if script.len() > 1 {
        script.pop_front().expect("script has entries")
    } else {
        script
            .front()
            .cloned()
            .unwrap_or_else(|| Err(EngineError::Transport(format!("no scripted {endpoint} reply"))))
    }
}

impl ScriptedEngine {
    /// Engine with empty scripts; unscripted calls fail with a transport error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that starts `sim-1`, reports it running once, completes it and
    /// reports every KPI in `kpi_ids` as successful.
    pub fn happy_path(kpi_ids: &[&str]) -> Self {
        Self::new()
            .with_start(StartReply::Started {
                simulation_id: "sim-1".into(),
            })
            .with_status(running(0.5))
            .with_status(complete())
            .with_modules(
                kpi_ids
                    .iter()
                    .map(|id| crate::fixtures::kpi_module(id))
                    .collect(),
            )
            .with_kpis(
                kpi_ids
                    .iter()
                    .map(|id| crate::fixtures::kpi_success(id, 42.0, "KWH"))
                    .collect(),
            )
    }

    pub fn with_start(self, reply: StartReply) -> Self {
        self.starts.lock().push_back(Ok(reply));
        self
    }

    pub fn with_start_error(self, err: EngineError) -> Self {
        self.starts.lock().push_back(Err(err));
        self
    }

    pub fn with_status(self, reply: StatusReply) -> Self {
        self.statuses.lock().push_back(Ok(reply));
        self
    }

    pub fn with_status_error(self, err: EngineError) -> Self {
        self.statuses.lock().push_back(Err(err));
        self
    }

    pub fn with_modules(self, modules: Vec<KpiModule>) -> Self {
        self.modules.lock().push_back(Ok(modules));
        self
    }

    pub fn with_modules_error(self, err: EngineError) -> Self {
        self.modules.lock().push_back(Err(err));
        self
    }

    pub fn with_kpis(self, entries: Vec<KpiEntry>) -> Self {
        self.kpis.lock().push_back(Ok(KpiReply::Reports(entries)));
        self
    }

    pub fn with_kpi_failure(self, status: u16) -> Self {
        self.kpis.lock().push_back(Ok(KpiReply::Failed { status }));
        self
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    fn count(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|r| matches(&r.call)).count()
    }

    /// Number of start requests.
    pub fn start_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Start { .. }))
    }

    /// Number of status polls.
    pub fn status_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Status { .. }))
    }

    /// Number of KPI catalogue requests.
    pub fn modules_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::KpiModules))
    }

    /// Number of KPI result polls.
    pub fn kpi_count(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Kpi { .. }))
    }

    /// Times at which start requests arrived.
    pub fn start_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|r| matches!(r.call, EngineCall::Start { .. }))
            .map(|r| r.at)
            .collect()
    }

    /// Bodies of all start requests.
    pub fn start_bodies(&self) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter_map(|r| match &r.call {
                EngineCall::Start { body } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn assert_start_count_eq(&self, expected: usize) {
        assert_eq!(
            self.start_count(),
            expected,
            "Expected {} start requests, got {}",
            expected,
            self.start_count()
        );
    }

    fn log(&self, call: EngineCall) {
        self.calls.lock().push(CallRecord {
            call,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl SimulationEngine for ScriptedEngine {
    async fn start(&self, body: &Value) -> Result<StartReply, EngineError> {
        self.log(EngineCall::Start { body: body.clone() });
        next(&self.starts, "start")
    }

    async fn simulation_status(&self, simulation_id: &str) -> Result<StatusReply, EngineError> {
        self.log(EngineCall::Status {
            simulation_id: simulation_id.to_string(),
        });
        next(&self.statuses, "status")
    }

    async fn kpi_modules(&self) -> Result<Vec<KpiModule>, EngineError> {
        self.log(EngineCall::KpiModules);
        next(&self.modules, "kpiModules")
    }

    async fn kpi_results(&self, simulation_id: &str) -> Result<KpiReply, EngineError> {
        self.log(EngineCall::Kpi {
            simulation_id: simulation_id.to_string(),
        });
        next(&self.kpis, "kpi")
    }
}

/// Running status at `fraction` progress.
pub fn running(fraction: f64) -> StatusReply {
    StatusReply {
        status: 200,
        state: Some(SimulationState::Running),
        description: fraction.to_string(),
    }
}

/// Completed simulation status.
pub fn complete() -> StatusReply {
    StatusReply {
        status: 200,
        state: Some(SimulationState::Complete),
        description: "Simulation complete".to_string(),
    }
}

/// Simulation failed with `description`.
pub fn simulation_error(description: &str) -> StatusReply {
    StatusReply {
        status: 200,
        state: Some(SimulationState::Error),
        description: description.to_string(),
    }
}

/// Non-200 status reply.
pub fn status_failure(status: u16, description: &str) -> StatusReply {
    StatusReply {
        status,
        state: None,
        description: description.to_string(),
    }
}
