use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Where and how to reach the simulation engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the engine's simulation resource; start requests post here.
    pub base_url: String,
    /// Timeout applied to each HTTP request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8112/essim/simulation".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Timing of the run driver's start and poll loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Wait between start attempts while the engine reports busy.
    #[serde(with = "humantime_serde")]
    pub start_retry_backoff: Duration,
    /// Wait between simulation and KPI status polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Give up after this many busy start attempts; `None` retries forever.
    pub max_start_attempts: Option<u32>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            start_retry_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_start_attempts: Some(720),
        }
    }
}

impl DriverConfig {
    /// Set the wait between busy start attempts.
    pub fn with_start_retry_backoff(mut self, backoff: Duration) -> Self {
        self.start_retry_backoff = backoff;
        self
    }

    /// Set the interval between status and KPI polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the busy-retry ceiling; `None` retries forever.
    pub fn with_max_start_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_start_attempts = attempts;
        self
    }
}

/// Sizing of the worker pool that runs driver tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of runs driven concurrently.
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Top-level adapter configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub engine: EngineConfig,
    pub driver: DriverConfig,
    pub dispatcher: DispatcherConfig,
    /// Buffer size of the run event bus.
    pub events_capacity: Option<usize>,
}

impl AdapterConfig {
    pub const DEFAULT_EVENTS_CAPACITY: usize = 256;

    /// Event bus capacity, falling back to the default.
    pub fn events_capacity(&self) -> usize {
        self.events_capacity
            .unwrap_or(Self::DEFAULT_EVENTS_CAPACITY)
            .max(1)
    }

    /// Build the configuration from environment variables over the defaults.
    ///
    /// Reads `ESSIM_URL`, `SIMRUN_WORKERS`, `SIMRUN_POLL_INTERVAL`,
    /// `SIMRUN_START_BACKOFF` and `SIMRUN_MAX_START_ATTEMPTS` (`unbounded`
    /// disables the ceiling). Durations use humantime syntax such as `1s`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("ESSIM_URL") {
            config.engine.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(workers) = lookup("SIMRUN_WORKERS") {
            config.dispatcher.workers = workers
                .parse()
                .with_context(|| format!("invalid SIMRUN_WORKERS value {workers:?}"))?;
        }
        if let Some(interval) = lookup("SIMRUN_POLL_INTERVAL") {
            config.driver.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("invalid SIMRUN_POLL_INTERVAL value {interval:?}"))?;
        }
        if let Some(backoff) = lookup("SIMRUN_START_BACKOFF") {
            config.driver.start_retry_backoff = humantime::parse_duration(&backoff)
                .with_context(|| format!("invalid SIMRUN_START_BACKOFF value {backoff:?}"))?;
        }
        if let Some(attempts) = lookup("SIMRUN_MAX_START_ATTEMPTS") {
            config.driver.max_start_attempts = match attempts.as_str() {
                "unbounded" => None,
                value => Some(value.parse().with_context(|| {
                    format!("invalid SIMRUN_MAX_START_ATTEMPTS value {attempts:?}")
                })?),
            };
        }

        Ok(config)
    }
}
