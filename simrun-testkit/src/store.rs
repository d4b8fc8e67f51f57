use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use simrun::{
    flatten_value, KpiResult, KpiStatus, ModelStore, ObjectPath, ObjectStore, SeriesPoint,
    TimeRange, TimeSeries, TimeSeriesStore,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Object store backed by a map. Writing into a missing bucket fails.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    buckets: Arc<Mutex<HashSet<String>>>,
    objects: Arc<Mutex<HashMap<ObjectPath, Vec<u8>>>>,
    created_buckets: Arc<Mutex<Vec<String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, creating its bucket silently.
    pub fn insert(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let path = ObjectPath::parse(path).expect("seeded path is bucket/key");
        self.buckets.lock().insert(path.bucket.clone());
        self.objects.lock().insert(path, bytes.into());
    }

    /// Stored bytes at `path`, if any.
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        let path = ObjectPath::parse(path).ok()?;
        self.objects.lock().get(&path).cloned()
    }

    /// Buckets created through `make_bucket`, in order.
    pub fn created_buckets(&self) -> Vec<String> {
        self.created_buckets.lock().clone()
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, path: &ObjectPath) -> anyhow::Result<Vec<u8>> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("object {path} not found"))
    }

    async fn bucket_exists(&self, bucket: &str) -> anyhow::Result<bool> {
        Ok(self.buckets.lock().contains(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> anyhow::Result<()> {
        if self.buckets.lock().insert(bucket.to_string()) {
            self.created_buckets.lock().push(bucket.to_string());
        }
        Ok(())
    }

    async fn put_object(&self, path: &ObjectPath, bytes: Vec<u8>) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("object store unavailable");
        }
        if !self.buckets.lock().contains(&path.bucket) {
            bail!("bucket {} does not exist", path.bucket);
        }
        self.objects.lock().insert(path.clone(), bytes);
        Ok(())
    }
}

/// Time-series store keyed by measurement and field.
#[derive(Clone, Default)]
pub struct InMemoryTimeSeriesStore {
    series: Arc<Mutex<HashMap<(String, String), BTreeMap<chrono::DateTime<chrono::Utc>, f64>>>>,
}

impl InMemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points stored for a measurement field.
    pub fn point_count(&self, measurement: &str, field: &str) -> usize {
        self.series
            .lock()
            .get(&(measurement.to_string(), field.to_string()))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn query(
        &self,
        range: &TimeRange,
        measurement: &str,
        field: &str,
    ) -> anyhow::Result<Vec<SeriesPoint>> {
        let series = self.series.lock();
        let Some(points) = series.get(&(measurement.to_string(), field.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(points
            .range(range.start..range.end)
            .map(|(time, value)| SeriesPoint {
                time: *time,
                value: *value,
            })
            .collect())
    }

    async fn write(&self, series: &TimeSeries) -> anyhow::Result<()> {
        let mut stored = self.series.lock();
        let points = stored
            .entry((series.measurement.clone(), series.field.clone()))
            .or_default();
        for point in &series.points {
            points.insert(point.time, point.value);
        }
        Ok(())
    }
}

/// Model store for JSON documents; KPIs land under a top-level `KPIs` array.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonModelStore;

impl ModelStore for JsonModelStore {
    type Model = Value;

    fn parse(&self, bytes: &[u8]) -> anyhow::Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn annotate_with_kpis(&self, mut model: Value, kpis: &[KpiResult]) -> anyhow::Result<Vec<u8>> {
        let figures: Vec<Value> = kpis
            .iter()
            .filter(|kpi| kpi.status == KpiStatus::Success)
            .filter_map(|kpi| {
                let value = kpi.value.as_ref()?;
                let name = kpi.name.as_deref().unwrap_or(&kpi.kpi_id);
                Some(flatten_value(name, kpi.unit.as_deref(), value))
            })
            .flatten()
            .map(|figure| json!({"name": figure.name, "unit": figure.unit, "value": figure.value}))
            .collect();
        let Some(object) = model.as_object_mut() else {
            bail!("model document is not a JSON object");
        };
        object.insert("KPIs".to_string(), Value::Array(figures));
        Ok(serde_json::to_vec(&model)?)
    }
}
