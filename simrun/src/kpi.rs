//! KPI catalogue and progress aggregation.
//!
//! After a simulation completes the engine computes KPIs asynchronously.
//! The driver fetches the KPI catalogue once, then repeatedly folds the
//! engine's per-KPI status reports into a [`MonitorResult`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the engine's `kpiModules` listing.
///
/// KPI modules may be deployed several times, so the listing can repeat ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiModule {
    pub calculator_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Static description of a KPI calculator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// KPI descriptors keyed by id, deduplicated, in first-seen order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KpiCatalogue {
    descriptors: Vec<KpiDescriptor>,
}

impl KpiCatalogue {
    /// Build a catalogue from the engine listing, keeping the first entry per id.
    pub fn from_modules(modules: impl IntoIterator<Item = KpiModule>) -> Self {
        let mut seen = HashSet::new();
        let descriptors = modules
            .into_iter()
            .filter(|module| seen.insert(module.calculator_id.clone()))
            .map(|module| KpiDescriptor {
                id: module.calculator_id,
                name: module.title,
                description: module.description,
            })
            .collect();
        Self { descriptors }
    }

    /// Descriptor for a calculator id.
    pub fn get(&self, id: &str) -> Option<&KpiDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Number of known KPIs.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the catalogue is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors in catalogue order.
    pub fn descriptors(&self) -> &[KpiDescriptor] {
        &self.descriptors
    }
}

/// Calculation status of a single KPI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum KpiStatus {
    NotStarted,
    Calculating,
    Success,
    /// A status string this adapter does not recognize.
    Unknown,
}

impl KpiStatus {
    /// Map the engine's status text.
    pub fn from_engine(status: &str) -> Self {
        match status {
            "Not yet started" => KpiStatus::NotStarted,
            "Calculating" => KpiStatus::Calculating,
            "Success" => KpiStatus::Success,
            _ => KpiStatus::Unknown,
        }
    }

    /// Whether the KPI is still being computed.
    pub fn is_pending(&self) -> bool {
        matches!(self, KpiStatus::NotStarted | KpiStatus::Calculating)
    }
}

/// Status of one KPI as reported by the engine's `kpi` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineKpiReport {
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub kpi: Option<Value>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// A KPI report paired with the KPI id it was keyed under.
#[derive(Clone, Debug, PartialEq)]
pub struct KpiEntry {
    pub kpi_id: String,
    pub report: EngineKpiReport,
}

impl KpiEntry {
    /// Decode the engine's array of single-key objects, `[{"<kpi_id>": {...}}, ...]`.
    pub fn decode_list(items: Vec<HashMap<String, EngineKpiReport>>) -> Vec<KpiEntry> {
        items
            .into_iter()
            .filter_map(|item| {
                item.into_iter()
                    .next()
                    .map(|(kpi_id, report)| KpiEntry { kpi_id, report })
            })
            .collect()
    }
}

/// Aggregated state of one KPI, joined with its catalogue descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiResult {
    pub kpi_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: KpiStatus,
    /// Fraction complete, present while calculating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Computed value, present on success. Scalar KPIs carry a number;
    /// per-category KPIs carry the engine's structured document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl KpiResult {
    fn from_entry(entry: KpiEntry, catalogue: &KpiCatalogue) -> Self {
        let descriptor = catalogue.get(&entry.kpi_id);
        let status = KpiStatus::from_engine(&entry.report.status);
        let (progress, value, unit) = match status {
            KpiStatus::Calculating => (entry.report.progress, None, None),
            KpiStatus::Success => (None, entry.report.kpi, entry.report.unit),
            _ => (None, None, None),
        };
        Self {
            kpi_id: entry.kpi_id,
            name: descriptor.map(|d| d.name.clone()),
            description: descriptor.map(|d| d.description.clone()),
            status,
            progress,
            value,
            unit,
        }
    }
}

/// One poll's worth of KPI progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitorResult {
    /// True iff any KPI has not started or is still calculating.
    pub still_calculating: bool,
    pub results: Vec<KpiResult>,
}

impl MonitorResult {
    /// Join engine reports against the catalogue, preserving report order.
    pub fn aggregate(entries: Vec<KpiEntry>, catalogue: &KpiCatalogue) -> Self {
        let results: Vec<KpiResult> = entries
            .into_iter()
            .map(|entry| KpiResult::from_entry(entry, catalogue))
            .collect();
        let still_calculating = results.iter().any(|r| r.status.is_pending());
        Self {
            still_calculating,
            results,
        }
    }
}

/// A single named figure extracted from a KPI value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiFigure {
    pub name: String,
    pub unit: String,
    pub value: f64,
}

fn normalize_unit(unit: &str) -> String {
    let upper = unit.to_uppercase();
    match upper.as_str() {
        "PERCENTAGE" => "PERCENT".to_string(),
        _ => upper,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Flatten a KPI value into named figures.
///
/// A bare number yields one figure named `name`. The structured form is a list
/// of levels, each mapping a level name to selections of
/// `{"Name", "Unit", "Values"}`; `Values` is a number or a list of
/// `{"carrier", "value"}`, the latter producing one figure per carrier named
/// `"<Name> - <carrier>"`. Entries that do not fit the shape are skipped.
pub fn flatten_value(name: &str, unit: Option<&str>, value: &Value) -> Vec<KpiFigure> {
    if let Some(number) = as_number(value) {
        return vec![KpiFigure {
            name: name.to_string(),
            unit: normalize_unit(unit.unwrap_or("NONE")),
            value: number,
        }];
    }

    let mut figures = Vec::new();
    let Some(levels) = value.as_array() else {
        return figures;
    };
    for level in levels.iter().filter_map(Value::as_object) {
        for selections in level.values().filter_map(Value::as_array) {
            for selection in selections {
                let Some(selection_name) = selection.get("Name").and_then(Value::as_str) else {
                    continue;
                };
                let selection_unit = selection
                    .get("Unit")
                    .and_then(Value::as_str)
                    .map(normalize_unit)
                    .unwrap_or_else(|| "NONE".to_string());
                match selection.get("Values") {
                    Some(Value::Array(items)) => {
                        for item in items {
                            let carrier = item.get("carrier").and_then(Value::as_str);
                            let number = item.get("value").and_then(as_number);
                            if let (Some(carrier), Some(number)) = (carrier, number) {
                                figures.push(KpiFigure {
                                    name: format!("{selection_name} - {carrier}"),
                                    unit: selection_unit.clone(),
                                    value: number,
                                });
                            }
                        }
                    }
                    Some(other) => {
                        if let Some(number) = as_number(other) {
                            figures.push(KpiFigure {
                                name: selection_name.to_string(),
                                unit: selection_unit.clone(),
                                value: number,
                            });
                        }
                    }
                    None => {}
                }
            }
        }
    }
    figures
}
