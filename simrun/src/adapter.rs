//! The adapter facade consumed by the request-handling layer.
//!
//! Every operation takes the run identifier as a string and answers with a
//! [`RunInfo`]. Failures never escape as errors: unknown runs, invalid
//! lifecycle moves and driver failures all come back as an `ERROR` run info
//! carrying a reason.

use std::any::type_name;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::bridge::ResultBridge;
use crate::config::AdapterConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::driver::{DriveRequest, EngineDriver, RunDriver, RunOutcome};
use crate::engine::SimulationEngine;
use crate::error::{DispatchError, RegistryError};
use crate::events::{RunEvent, RunEventBus, RunEventPayload, RunEventPublisher};
use crate::registry::RunRegistry;
use crate::run::{ModelState, RunConfig, RunId, RunInfo, RunResult};
use crate::telemetry;

/// Run lifecycle manager over one driver.
pub struct SimulationAdapter<D: RunDriver> {
    config: AdapterConfig,
    registry: Arc<RunRegistry>,
    dispatcher: Arc<Dispatcher<SettledRun>>,
    driver: Arc<D>,
    bridge: Option<Arc<dyn ResultBridge>>,
    events: Arc<RunEventBus>,
}

impl<D: RunDriver> fmt::Debug for SimulationAdapter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationAdapter")
            .field("driver_type", &type_name::<D>())
            .field("runs", &self.registry.len())
            .field("dispatcher", &self.dispatcher)
            .field("bridge_set", &self.bridge.is_some())
            .finish()
    }
}

fn parse_id(operation: &str, model_run_id: &str) -> Result<RunId, RunInfo> {
    RunId::from_str(model_run_id).map_err(|_| {
        RunInfo::error(model_run_id, format!("{operation}: run {model_run_id} is unknown"))
    })
}

fn failure(operation: &str, run_id: RunId, err: impl fmt::Display) -> RunInfo {
    RunInfo::error(run_id.to_string(), format!("{operation}: {err}"))
}

/// Terminal state of a driver task, with results already persisted.
///
/// `status` and `results` both answer from this value, so a run never looks
/// successful before its results are stored.
#[derive(Clone, Debug, PartialEq)]
struct SettledRun {
    state: ModelState,
    result: Option<RunResult>,
    reason: Option<String>,
}

impl SettledRun {
    fn failed(reason: String) -> Self {
        Self {
            state: ModelState::Error,
            result: None,
            reason: Some(reason),
        }
    }

    fn from_outcome(outcome: RunOutcome) -> Self {
        Self {
            state: outcome.state(),
            reason: outcome.reason(),
            result: match outcome {
                RunOutcome::Succeeded { results } => Some(RunResult::from_kpis(results)),
                _ => None,
            },
        }
    }

    fn info(&self, model_run_id: &str) -> RunInfo {
        let mut info = RunInfo::new(model_run_id, self.state);
        info.result = self.result.clone();
        info.reason = self.reason.clone();
        info
    }
}

/// Persist the KPIs of a succeeded run. A storage failure turns it into `ERROR`.
async fn settle(
    run_id: RunId,
    config: &RunConfig,
    outcome: RunOutcome,
    bridge: Option<&dyn ResultBridge>,
) -> SettledRun {
    match (outcome, bridge) {
        (RunOutcome::Succeeded { results }, Some(bridge)) => {
            match bridge.persist_results(run_id, config, &results).await {
                Ok(result) => SettledRun {
                    state: ModelState::Succeeded,
                    result: Some(result),
                    reason: None,
                },
                Err(err) => {
                    error!(run_id = %run_id, "persisting results failed: {err:#}");
                    SettledRun::failed(format!("failed to persist results: {err:#}"))
                }
            }
        }
        (outcome, _) => SettledRun::from_outcome(outcome),
    }
}

impl<D: RunDriver> SimulationAdapter<D> {
    /// Adapter configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// The run registry backing this adapter.
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// The driver runs are dispatched to.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Subscribe to events of every run driven from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Number of runs whose driver task has not finished.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Create a run in `ACCEPTED`.
    pub fn request(&self) -> RunInfo {
        self.registry.create().info()
    }

    /// Attach the run configuration, moving the run to `READY`.
    pub async fn initialize(&self, model_run_id: &str, config: RunConfig) -> RunInfo {
        let run_id = match parse_id("initialize", model_run_id) {
            Ok(run_id) => run_id,
            Err(info) => return info,
        };
        match self.registry.attach_config(run_id, config).await {
            Ok(record) => record.info(),
            Err(err) => {
                warn!(run_id = %run_id, "initialize rejected: {err}");
                failure("initialize", run_id, err)
            }
        }
    }

    /// Move a `READY` run to `RUNNING` and start driving it.
    pub async fn run(&self, model_run_id: &str) -> RunInfo {
        let run_id = match parse_id("run", model_run_id) {
            Ok(run_id) => run_id,
            Err(info) => return info,
        };
        let mut record = match self.registry.lock(run_id).await {
            Ok(record) => record,
            Err(err) => return failure("run", run_id, err),
        };

        let config = match (&record.config, record.state) {
            (Some(config), ModelState::Ready) => config.clone(),
            (None, ModelState::Accepted) => {
                return failure("run", run_id, RegistryError::NotConfigured(run_id))
            }
            (_, state) => {
                return failure(
                    "run",
                    run_id,
                    RegistryError::InvalidTransition {
                        run_id,
                        from: state,
                        to: ModelState::Running,
                    },
                )
            }
        };

        if let Err(err) = self.submit(run_id, config) {
            return failure("run", run_id, err);
        }
        if let Err(err) = record.advance(ModelState::Running, None, None) {
            self.dispatcher.cancel(run_id);
            return failure("run", run_id, err);
        }
        telemetry::record_run_started(run_id);
        record.info()
    }

    fn submit(&self, run_id: RunId, config: RunConfig) -> Result<(), DispatchError> {
        let driver = Arc::clone(&self.driver);
        let bridge = self.bridge.clone();
        let events = Arc::clone(&self.events);

        self.dispatcher.submit(run_id, move |cancel| async move {
            // Removed while queued for a worker.
            if cancel.is_cancelled() {
                debug!(run_id = %run_id, "run cancelled before start");
                return SettledRun::from_outcome(RunOutcome::Cancelled);
            }
            let timer = telemetry::record_run_start(run_id);
            let model_payload = match &bridge {
                Some(bridge) => bridge.load_model_payload(run_id, &config).await,
                None => Ok(Vec::new()),
            };
            let outcome = match model_payload {
                Ok(model_payload) => {
                    driver
                        .drive(DriveRequest {
                            run_id,
                            config: config.clone(),
                            model_payload,
                            cancel,
                        })
                        .await
                }
                Err(err) => {
                    error!(run_id = %run_id, "loading model payload failed: {err:#}");
                    RunOutcome::failed(format!("failed to load model payload: {err:#}"))
                }
            };

            let cancelled = outcome == RunOutcome::Cancelled;
            let settled = settle(run_id, &config, outcome, bridge.as_deref()).await;
            if !cancelled {
                events.emit(
                    run_id,
                    RunEventPayload::Finished {
                        state: settled.state,
                        reason: settled.reason.clone(),
                    },
                );
            }
            telemetry::record_run_end(timer, settled.state);
            settled
        })?;
        Ok(())
    }

    /// Current view of a run.
    ///
    /// Once the driver task has finished, its settled state is reported
    /// without being consumed; [`results`](Self::results) records it.
    pub async fn status(&self, model_run_id: &str) -> RunInfo {
        let run_id = match parse_id("status", model_run_id) {
            Ok(run_id) => run_id,
            Err(info) => return info,
        };
        let record = match self.registry.get(run_id).await {
            Ok(record) => record,
            Err(err) => return failure("status", run_id, err),
        };
        if record.state != ModelState::Running {
            return record.info();
        }

        match self.dispatcher.peek(run_id) {
            Ok(DispatchOutcome::Completed(settled)) => settled.info(model_run_id),
            Ok(DispatchOutcome::Failed(message)) => RunInfo::error(
                model_run_id,
                format!("run driver terminated unexpectedly: {message}"),
            ),
            Err(_) => record.info(),
        }
    }

    /// Record the settled state of a finished run.
    ///
    /// The first call after the driver task finished consumes its outcome;
    /// later calls answer from the registry.
    pub async fn results(&self, model_run_id: &str) -> RunInfo {
        let run_id = match parse_id("results", model_run_id) {
            Ok(run_id) => run_id,
            Err(info) => return info,
        };
        let mut record = match self.registry.lock(run_id).await {
            Ok(record) => record,
            Err(err) => return failure("results", run_id, err),
        };
        if record.state != ModelState::Running {
            return record.info();
        }

        let settled = match self.dispatcher.take(run_id) {
            Ok(DispatchOutcome::Completed(settled)) => settled,
            Ok(DispatchOutcome::Failed(message)) => {
                SettledRun::failed(format!("run driver terminated unexpectedly: {message}"))
            }
            Err(DispatchError::NotDone(_)) => return record.info(),
            Err(err) => {
                debug!(run_id = %run_id, "no outcome to record: {err}");
                return record.info();
            }
        };

        if let Err(err) = record.advance(settled.state, settled.result, settled.reason) {
            error!(run_id = %run_id, "recording run outcome failed: {err}");
            return failure("results", run_id, err);
        }
        telemetry::record_run_finished(run_id, record.state, record.reason.as_deref());
        record.info()
    }

    /// Forget a run and stop its driver at the next poll boundary.
    pub async fn remove(&self, model_run_id: &str) -> RunInfo {
        let run_id = match parse_id("remove", model_run_id) {
            Ok(run_id) => run_id,
            Err(info) => return info,
        };
        if let Err(err) = self.registry.remove(run_id) {
            return failure("remove", run_id, err);
        }
        if self.dispatcher.cancel(run_id) {
            debug!(run_id = %run_id, "driver task cancelled");
        }
        RunInfo::new(model_run_id, ModelState::Unknown)
    }
}

impl<E: SimulationEngine + 'static> SimulationAdapter<EngineDriver<E>> {
    /// Builder with an [`EngineDriver`] over `engine` sharing the adapter's event bus.
    pub fn for_engine(
        config: AdapterConfig,
        engine: E,
    ) -> SimulationAdapterBuilder<EngineDriver<E>> {
        let events = Arc::new(RunEventBus::new(config.events_capacity()));
        let publisher: Arc<dyn RunEventPublisher> = events.clone();
        let driver = EngineDriver::new(engine, config.driver.clone(), publisher);
        SimulationAdapterBuilder::new(config)
            .with_events(events)
            .with_driver(Arc::new(driver))
    }
}

/// Builder for constructing a `SimulationAdapter` with explicit dependencies.
///
/// The driver is required. Without a result bridge, runs start with an empty
/// model payload and succeed with their KPIs only. Without an event bus, one
/// sized by the configuration is created.
///
/// # Example
///
/// ```ignore
/// use simrun::*;
///
/// let adapter = SimulationAdapter::for_engine(config, HttpEngineClient::new(&config.engine)?)
///     .with_bridge(Arc::new(bridge))
///     .build()?;
/// ```
pub struct SimulationAdapterBuilder<D: RunDriver> {
    config: AdapterConfig,
    driver: Option<Arc<D>>,
    bridge: Option<Arc<dyn ResultBridge>>,
    events: Option<Arc<RunEventBus>>,
}

impl<D: RunDriver> fmt::Debug for SimulationAdapterBuilder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SimulationAdapterBuilder");
        debug.field("config", &self.config);
        debug.field("driver_set", &self.driver.is_some());
        debug.field("bridge_set", &self.bridge.is_some());
        debug.field("events_set", &self.events.is_some());
        if self.driver.is_some() {
            debug.field("driver_type", &type_name::<D>());
        }
        debug.finish()
    }
}

impl<D: RunDriver> SimulationAdapterBuilder<D> {
    /// Start a builder with no dependencies set.
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            driver: None,
            bridge: None,
            events: None,
        }
    }

    /// Set the run driver.
    pub fn with_driver(mut self, driver: Arc<D>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the result bridge for model payloads and result persistence.
    pub fn with_bridge(mut self, bridge: Arc<dyn ResultBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Set the event bus. A driver publishing events should share it.
    pub fn with_events(mut self, events: Arc<RunEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver is missing or the worker pool is empty.
    pub fn build(self) -> anyhow::Result<SimulationAdapter<D>> {
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver dependency missing"))?;
        if self.config.dispatcher.workers == 0 {
            anyhow::bail!("dispatcher needs at least one worker");
        }
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(RunEventBus::new(self.config.events_capacity())));

        Ok(SimulationAdapter {
            registry: Arc::new(RunRegistry::new()),
            dispatcher: Arc::new(Dispatcher::new(&self.config.dispatcher)),
            driver,
            bridge: self.bridge,
            events,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpi::KpiResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Driver answering with a fixed outcome after waiting for cancellation or a delay.
    struct FixedDriver {
        outcome: RunOutcome,
        delay: Duration,
    }

    #[async_trait]
    impl RunDriver for FixedDriver {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn drive(&self, request: DriveRequest) -> RunOutcome {
            tokio::select! {
                _ = request.cancel.cancelled() => RunOutcome::Cancelled,
                _ = tokio::time::sleep(self.delay) => self.outcome.clone(),
            }
        }
    }

    fn adapter(outcome: RunOutcome, delay: Duration) -> SimulationAdapter<FixedDriver> {
        SimulationAdapterBuilder::new(AdapterConfig::default())
            .with_driver(Arc::new(FixedDriver { outcome, delay }))
            .build()
            .unwrap()
    }

    async fn wait_done(adapter: &SimulationAdapter<FixedDriver>, id: &str) -> RunInfo {
        loop {
            let info = adapter.status(id).await;
            if info.state != ModelState::Running {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn build_requires_driver() {
        let err = SimulationAdapterBuilder::<FixedDriver>::new(AdapterConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("driver"));
    }

    #[tokio::test]
    async fn lifecycle_reaches_succeeded_once() {
        let adapter = adapter(RunOutcome::Succeeded { results: vec![] }, Duration::from_millis(20));
        let id = adapter.request().model_run_id;

        assert_eq!(
            adapter.initialize(&id, RunConfig::default()).await.state,
            ModelState::Ready
        );
        assert_eq!(adapter.run(&id).await.state, ModelState::Running);
        assert_eq!(wait_done(&adapter, &id).await.state, ModelState::Succeeded);

        // status peeks, so the registry is still RUNNING until results records it
        assert_eq!(
            adapter.registry().get(id.parse().unwrap()).await.unwrap().state,
            ModelState::Running
        );
        let first = adapter.results(&id).await;
        assert_eq!(first.state, ModelState::Succeeded);
        assert_eq!(first.result, Some(RunResult::from_kpis(vec![])));
        assert_eq!(adapter.results(&id).await, first);
        assert_eq!(adapter.status(&id).await, first);
    }

    #[tokio::test]
    async fn failed_outcome_becomes_error_with_reason() {
        let adapter = adapter(RunOutcome::failed("simulation failed: boom"), Duration::ZERO);
        let id = adapter.request().model_run_id;
        adapter.initialize(&id, RunConfig::default()).await;
        adapter.run(&id).await;
        wait_done(&adapter, &id).await;

        let info = adapter.results(&id).await;
        assert_eq!(info.state, ModelState::Error);
        assert_eq!(info.reason.as_deref(), Some("simulation failed: boom"));
        assert!(info.result.is_none());
    }

    #[tokio::test]
    async fn run_requires_ready_state() {
        let adapter = adapter(RunOutcome::Cancelled, Duration::ZERO);
        let id = adapter.request().model_run_id;

        let info = adapter.run(&id).await;
        assert_eq!(info.state, ModelState::Error);
        assert!(info.reason.unwrap().contains("no configuration"));
        assert_eq!(adapter.status(&id).await.state, ModelState::Accepted);

        adapter.initialize(&id, RunConfig::default()).await;
        assert_eq!(
            adapter.initialize(&id, RunConfig::default()).await.state,
            ModelState::Error
        );
        assert_eq!(adapter.status(&id).await.state, ModelState::Ready);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_errors() {
        let adapter = adapter(RunOutcome::Cancelled, Duration::ZERO);
        let missing = RunId::new().to_string();
        for info in [
            adapter.status(&missing).await,
            adapter.results(&missing).await,
            adapter.run("not-a-run").await,
            adapter.remove(&missing).await,
        ] {
            assert_eq!(info.state, ModelState::Error);
            assert!(info.reason.unwrap().contains("unknown"));
        }
    }

    #[tokio::test]
    async fn remove_cancels_driver() {
        let adapter = adapter(RunOutcome::Succeeded { results: vec![] }, Duration::from_secs(3600));
        let id = adapter.request().model_run_id;
        adapter.initialize(&id, RunConfig::default()).await;
        adapter.run(&id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(adapter.in_flight(), 1);

        assert_eq!(adapter.remove(&id).await.state, ModelState::Unknown);
        assert_eq!(adapter.in_flight(), 0);
        assert_eq!(adapter.status(&id).await.state, ModelState::Error);
        assert!(adapter.registry().is_empty());
    }

    #[derive(Default)]
    struct CountingBridge {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ResultBridge for CountingBridge {
        async fn load_model_payload(
            &self,
            _run_id: RunId,
            _config: &RunConfig,
        ) -> anyhow::Result<Vec<u8>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn persist_results(
            &self,
            _run_id: RunId,
            _config: &RunConfig,
            kpis: &[KpiResult],
        ) -> anyhow::Result<RunResult> {
            Ok(RunResult::from_kpis(kpis.to_vec()))
        }
    }

    #[tokio::test]
    async fn run_removed_while_queued_never_loads_its_model() {
        let bridge = Arc::new(CountingBridge::default());
        let mut config = AdapterConfig::default();
        config.dispatcher.workers = 1;
        let adapter = SimulationAdapterBuilder::new(config)
            .with_driver(Arc::new(FixedDriver {
                outcome: RunOutcome::Succeeded { results: vec![] },
                delay: Duration::from_secs(3600),
            }))
            .with_bridge(bridge.clone())
            .build()
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let id = adapter.request().model_run_id;
            adapter.initialize(&id, RunConfig::default()).await;
            assert_eq!(adapter.run(&id).await.state, ModelState::Running);
            ids.push(id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.loads.load(Ordering::SeqCst), 1);

        adapter.remove(&ids[1]).await;
        adapter.remove(&ids[0]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bridge.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_driver_is_reported_as_error() {
        struct PanickingDriver;

        #[async_trait]
        impl RunDriver for PanickingDriver {
            fn name(&self) -> &'static str {
                "panicking"
            }

            async fn drive(&self, _request: DriveRequest) -> RunOutcome {
                panic!("engine client bug")
            }
        }

        let adapter = SimulationAdapterBuilder::new(AdapterConfig::default())
            .with_driver(Arc::new(PanickingDriver))
            .build()
            .unwrap();
        let id = adapter.request().model_run_id;
        adapter.initialize(&id, RunConfig::default()).await;
        adapter.run(&id).await;

        let info = loop {
            let info = adapter.results(&id).await;
            if info.state != ModelState::Running {
                break info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(info.state, ModelState::Error);
        assert!(info.reason.unwrap().contains("engine client bug"));
    }
}
