//! Hand-off between finished runs and the storage collaborators.
//!
//! The adapter only talks to [`ResultBridge`]. [`StorageBridge`] implements
//! it over three narrow stores: an object store holding model payloads and
//! KPI documents, an optional time-series store holding profiles, and a
//! model store that folds KPIs back into the simulated system's description.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::kpi::KpiResult;
use crate::run::{RunConfig, RunId, RunResult};

/// `bucket/key` location in an object store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    pub bucket: String,
    pub key: String,
}

impl ObjectPath {
    /// Split a path on its first `/`: the first segment names the bucket.
    pub fn parse(path: &str) -> anyhow::Result<Self> {
        let path = path.trim_start_matches('/');
        match path.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => bail!("object path {path:?} is not of the form bucket/key"),
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Bucketed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, path: &ObjectPath) -> anyhow::Result<Vec<u8>>;

    async fn bucket_exists(&self, bucket: &str) -> anyhow::Result<bool>;

    async fn make_bucket(&self, bucket: &str) -> anyhow::Result<()>;

    /// Write an object into an existing bucket.
    async fn put_object(&self, path: &ObjectPath, bytes: Vec<u8>) -> anyhow::Result<()>;

    /// Write an object, creating its bucket first if needed.
    async fn put(&self, path: &ObjectPath, bytes: Vec<u8>) -> anyhow::Result<()> {
        if !self.bucket_exists(&path.bucket).await? {
            debug!(bucket = %path.bucket, "creating bucket");
            self.make_bucket(&path.bucket).await?;
        }
        self.put_object(path, bytes).await
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Range from `start` (inclusive) to `end` (exclusive).
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `time` falls inside the range.
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Ordered points of one measurement field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub measurement: String,
    pub field: String,
    pub points: Vec<SeriesPoint>,
}

impl TimeSeries {
    /// Build a series stepping one hour per value from `start`.
    pub fn hourly(
        measurement: impl Into<String>,
        field: impl Into<String>,
        start: DateTime<Utc>,
        values: impl IntoIterator<Item = f64>,
    ) -> Self {
        let points = values
            .into_iter()
            .enumerate()
            .map(|(offset, value)| SeriesPoint {
                time: start + Duration::hours(offset as i64),
                value,
            })
            .collect();
        Self {
            measurement: measurement.into(),
            field: field.into(),
            points,
        }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the series has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Point values in time order.
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.value).collect()
    }
}

/// Storage for profile series.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Points of `measurement.field` inside `range`, ordered by time.
    async fn query(
        &self,
        range: &TimeRange,
        measurement: &str,
        field: &str,
    ) -> anyhow::Result<Vec<SeriesPoint>>;

    async fn write(&self, series: &TimeSeries) -> anyhow::Result<()>;
}

/// Codec for the simulated system's description.
pub trait ModelStore: Send + Sync {
    type Model: Send;

    fn parse(&self, bytes: &[u8]) -> anyhow::Result<Self::Model>;

    /// Attach computed KPIs to the model and serialize it.
    fn annotate_with_kpis(&self, model: Self::Model, kpis: &[KpiResult])
        -> anyhow::Result<Vec<u8>>;
}

/// What the adapter needs from storage around a run.
#[async_trait]
pub trait ResultBridge: Send + Sync {
    /// Load the model payload embedded in the engine start request.
    async fn load_model_payload(&self, run_id: RunId, config: &RunConfig)
        -> anyhow::Result<Vec<u8>>;

    /// Persist the KPIs of a succeeded run. Writes overwrite, so a retry is safe.
    async fn persist_results(
        &self,
        run_id: RunId,
        config: &RunConfig,
        kpis: &[KpiResult],
    ) -> anyhow::Result<RunResult>;
}

/// [`ResultBridge`] over object, time-series and model stores.
pub struct StorageBridge<M> {
    objects: Arc<dyn ObjectStore>,
    series: Option<Arc<dyn TimeSeriesStore>>,
    models: M,
}

impl<M> fmt::Debug for StorageBridge<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBridge")
            .field("model_store", &std::any::type_name::<M>())
            .field("has_series_store", &self.series.is_some())
            .finish()
    }
}

impl<M: ModelStore> StorageBridge<M> {
    /// Bridge over an object store and a model codec, without a time-series store.
    pub fn new(objects: Arc<dyn ObjectStore>, models: M) -> Self {
        Self {
            objects,
            series: None,
            models,
        }
    }

    /// Attach the time-series store used for profiles.
    pub fn with_series_store(mut self, series: Arc<dyn TimeSeriesStore>) -> Self {
        self.series = Some(series);
        self
    }

    fn series_store(&self) -> anyhow::Result<&Arc<dyn TimeSeriesStore>> {
        self.series
            .as_ref()
            .context("no time-series store configured")
    }

    /// Load a profile; `None` when the store has no points in range.
    pub async fn load_profile(
        &self,
        range: &TimeRange,
        measurement: &str,
        field: &str,
    ) -> anyhow::Result<Option<TimeSeries>> {
        let points = self
            .series_store()?
            .query(range, measurement, field)
            .await
            .with_context(|| format!("querying profile {measurement}.{field}"))?;
        if points.is_empty() {
            return Ok(None);
        }
        Ok(Some(TimeSeries {
            measurement: measurement.to_string(),
            field: field.to_string(),
            points,
        }))
    }

    /// Write a profile to the time-series store.
    pub async fn store_profile(&self, series: &TimeSeries) -> anyhow::Result<()> {
        self.series_store()?
            .write(series)
            .await
            .with_context(|| format!("writing profile {}.{}", series.measurement, series.field))
    }

    async fn read_input_model(&self, config: &RunConfig) -> anyhow::Result<Vec<u8>> {
        let path = config
            .resolved_input_model_path()
            .context("run config has no input model path")?;
        let path = ObjectPath::parse(&path)?;
        self.objects
            .get(&path)
            .await
            .with_context(|| format!("loading model from {path}"))
    }
}

#[async_trait]
impl<M: ModelStore + 'static> ResultBridge for StorageBridge<M> {
    async fn load_model_payload(
        &self,
        run_id: RunId,
        config: &RunConfig,
    ) -> anyhow::Result<Vec<u8>> {
        let payload = self.read_input_model(config).await?;
        debug!(run_id = %run_id, bytes = payload.len(), "model payload loaded");
        Ok(payload)
    }

    async fn persist_results(
        &self,
        run_id: RunId,
        config: &RunConfig,
        kpis: &[KpiResult],
    ) -> anyhow::Result<RunResult> {
        let mut result = RunResult::from_kpis(kpis.to_vec());

        if let Some(output) = config.resolved_output_file_path() {
            let path = ObjectPath::parse(&output)?;
            let document = serde_json::to_vec(kpis)?;
            self.objects
                .put(&path, document)
                .await
                .with_context(|| format!("writing KPI document to {path}"))?;
            result.output_path = Some(output);
        }

        if let Some(output) = config.resolved_output_model_path() {
            let path = ObjectPath::parse(&output)?;
            let model = self.models.parse(&self.read_input_model(config).await?)?;
            let annotated = self.models.annotate_with_kpis(model, kpis)?;
            self.objects
                .put(&path, annotated)
                .await
                .with_context(|| format!("writing annotated model to {path}"))?;
            result.model_output_path = Some(output);
        }

        info!(run_id = %run_id, kpis = kpis.len(), "run results persisted");
        Ok(result)
    }
}
