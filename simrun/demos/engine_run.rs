//! Drive one run against a live engine.
//!
//! Usage: `cargo run --example engine_run -- path/to/model.esdl`
//!
//! The engine location and timing come from the environment (`ESSIM_URL`,
//! `SIMRUN_POLL_INTERVAL`, ...). The model is served from an in-memory object
//! store and the KPI document is written back to it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use simrun::telemetry::init_tracing;
use simrun::*;
use simrun_testkit::{InMemoryObjectStore, JsonModelStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,simrun=debug")?;

    let model_path = std::env::args()
        .nth(1)
        .context("usage: engine_run <model file>")?;
    let model = std::fs::read(&model_path).with_context(|| format!("reading {model_path}"))?;

    let config = AdapterConfig::from_env()?;
    let engine = HttpEngineClient::new(&config.engine)?;
    println!("engine: {}", engine.base_url());

    let objects = InMemoryObjectStore::new();
    objects.insert("demo/input/model.esdl", model);
    let bridge = StorageBridge::new(Arc::new(objects.clone()), JsonModelStore);

    let adapter = SimulationAdapter::for_engine(config, engine)
        .with_bridge(Arc::new(bridge))
        .build()?;

    let mut events = adapter.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[{}] {:?}", event.timestamp.format("%H:%M:%S"), event.payload);
        }
    });

    let run_config: RunConfig = serde_json::from_value(json!({
        "essim_post_body": {
            "user": "simrun-demo",
            "scenarioID": "demo",
            "simulationDescription": "simrun demo run",
            "startDate": "2019-01-01T00:00:00+0100",
            "endDate": "2019-01-02T00:00:00+0100",
        },
        "input_esdl_file_path": "input/model.esdl",
        "output_file_path": "output/kpis.json",
        "base_path": "demo/",
    }))?;

    let id = adapter.request().model_run_id;
    println!("{:?}", adapter.initialize(&id, run_config).await);
    println!("{:?}", adapter.run(&id).await);

    let info = loop {
        let info = adapter.results(&id).await;
        if info.state.is_terminal() {
            break info;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    };

    println!("{}", serde_json::to_string_pretty(&info)?);
    if let Some(document) = objects.object("demo/output/kpis.json") {
        println!("stored KPI document: {} bytes", document.len());
    }
    adapter.remove(&id).await;
    Ok(())
}
