use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::kpi::KpiResult;
use crate::run::{ModelState, RunId};

/// Observation emitted while a run is driven.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub payload: RunEventPayload,
}

impl RunEvent {
    /// Event stamped with the current time.
    pub fn new(run_id: RunId, payload: RunEventPayload) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Event payload for each step of the engine protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RunEventPayload {
    /// A start request is about to be sent.
    StartAttempt { attempt: u32 },
    /// The engine answered a start request with busy.
    EngineBusy { attempt: u32 },
    /// The engine accepted the run.
    SimulationStarted { simulation_id: String },
    /// Fractional simulation progress in `[0, 1]`.
    SimulationProgress { fraction: f64 },
    /// The simulation finished; KPI computation follows.
    SimulationComplete,
    /// One poll of KPI progress.
    KpiProgress { results: Vec<KpiResult> },
    /// The run settled in a terminal state, after any results were stored.
    Finished {
        state: ModelState,
        reason: Option<String>,
    },
}

/// Sink for run events.
#[async_trait]
pub trait RunEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()>;
    /// Subscribe to events published from now on.
    fn subscribe(&self) -> broadcast::Receiver<RunEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged`; with no
/// subscribers, events are dropped.
pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl RunEventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    /// Per-subscriber buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish without awaiting; used from synchronous contexts.
    pub fn emit(&self, run_id: RunId, payload: RunEventPayload) {
        let _ = self.sender.send(RunEvent::new(run_id, payload));
    }
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new(crate::config::AdapterConfig::DEFAULT_EVENTS_CAPACITY)
    }
}

#[async_trait]
impl RunEventPublisher for RunEventBus {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}
