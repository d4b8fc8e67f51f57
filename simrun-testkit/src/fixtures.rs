use serde_json::{json, Value};
use simrun::{EngineKpiReport, KpiEntry, KpiModule, RunConfig};

pub const INPUT_MODEL: &str = "input/model.esdl";
pub const OUTPUT_MODEL: &str = "output/model.esdl";
pub const OUTPUT_KPIS: &str = "output/kpis.json";
pub const BASE_PATH: &str = "essim/runs/";

/// Run configuration with every path set under [`BASE_PATH`].
pub fn run_config() -> RunConfig {
    serde_json::from_value(json!({
        "essim_post_body": {
            "user": "simrun",
            "scenarioID": "test-scenario",
            "simulationDescription": "test run",
            "startDate": "2019-01-01T00:00:00+0100",
            "endDate": "2019-01-02T00:00:00+0100",
            "influxURL": "http://influxdb:8086",
        },
        "input_esdl_file_path": INPUT_MODEL,
        "output_esdl_file_path": OUTPUT_MODEL,
        "output_file_path": OUTPUT_KPIS,
        "base_path": BASE_PATH,
    }))
    .expect("fixture run config is valid")
}

/// Resolved object path of a fixture path.
pub fn resolved(path: &str) -> String {
    format!("{BASE_PATH}{path}")
}

/// Small model document understood by `JsonModelStore`.
pub fn model_document() -> Vec<u8> {
    serde_json::to_vec(&json!({"name": "test energy system", "assets": []}))
        .expect("fixture model serializes")
}

/// Catalogue entry titled `"{id} title"`.
pub fn kpi_module(id: &str) -> KpiModule {
    KpiModule {
        calculator_id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
    }
}

fn entry(
    id: &str,
    status: &str,
    progress: Option<f64>,
    kpi: Option<Value>,
    unit: Option<&str>,
) -> KpiEntry {
    KpiEntry {
        kpi_id: id.to_string(),
        report: EngineKpiReport {
            status: status.to_string(),
            progress,
            kpi,
            unit: unit.map(str::to_string),
        },
    }
}

pub fn kpi_not_started(id: &str) -> KpiEntry {
    entry(id, "Not yet started", None, None, None)
}

pub fn kpi_calculating(id: &str, progress: f64) -> KpiEntry {
    entry(id, "Calculating", Some(progress), None, None)
}

/// Successful scalar KPI.
pub fn kpi_success(id: &str, value: f64, unit: &str) -> KpiEntry {
    entry(id, "Success", None, Some(json!(value)), Some(unit))
}

/// Successful KPI whose value is a per-carrier document.
pub fn kpi_success_per_carrier(id: &str, name: &str, carriers: &[(&str, f64)]) -> KpiEntry {
    let values: Vec<Value> = carriers
        .iter()
        .map(|(carrier, value)| json!({"carrier": carrier, "value": value}))
        .collect();
    let document = json!([{ "All": [{ "Name": name, "Unit": "PERCENTAGE", "Values": values }] }]);
    entry(id, "Success", None, Some(document), None)
}
