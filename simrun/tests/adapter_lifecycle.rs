//! End-to-end lifecycle tests: adapter, dispatcher, engine driver and
//! storage bridge wired together over the testkit doubles.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use simrun::{
    AdapterConfig, EngineDriver, ModelState, RunConfig, RunEventPayload, RunInfo,
    SimulationAdapter, StartReply, StorageBridge, TimeRange, TimeSeries,
};
use simrun_testkit::engine::running;
use simrun_testkit::fixtures::{self, resolved, OUTPUT_KPIS, OUTPUT_MODEL};
use simrun_testkit::{InMemoryObjectStore, InMemoryTimeSeriesStore, JsonModelStore, ScriptedEngine};

type Adapter = SimulationAdapter<EngineDriver<ScriptedEngine>>;

struct Harness {
    adapter: Adapter,
    engine: ScriptedEngine,
    objects: InMemoryObjectStore,
}

fn harness(engine: ScriptedEngine, config: AdapterConfig) -> Harness {
    let objects = InMemoryObjectStore::new();
    objects.insert(&resolved(fixtures::INPUT_MODEL), fixtures::model_document());
    let bridge = StorageBridge::new(Arc::new(objects.clone()), JsonModelStore);
    let adapter = SimulationAdapter::for_engine(config, engine.clone())
        .with_bridge(Arc::new(bridge))
        .build()
        .expect("adapter builds");
    Harness {
        adapter,
        engine,
        objects,
    }
}

async fn start(adapter: &Adapter, config: RunConfig) -> String {
    let id = adapter.request().model_run_id;
    adapter.initialize(&id, config).await;
    assert_eq!(adapter.run(&id).await.state, ModelState::Running);
    id
}

async fn settle(adapter: &Adapter, id: &str) -> RunInfo {
    for _ in 0..600 {
        let info = adapter.results(id).await;
        if info.state != ModelState::Running {
            return info;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("run {id} did not settle");
}

#[tokio::test(start_paused = true)]
async fn run_moves_through_every_state_and_persists_results() {
    let h = harness(
        ScriptedEngine::happy_path(&["energy", "cost", "emission"]),
        AdapterConfig::default(),
    );
    let mut events = h.adapter.subscribe();

    let requested = h.adapter.request();
    assert_eq!(requested.state, ModelState::Accepted);
    let id = requested.model_run_id;
    assert_eq!(
        h.adapter.initialize(&id, fixtures::run_config()).await.state,
        ModelState::Ready
    );
    assert_eq!(h.adapter.run(&id).await.state, ModelState::Running);

    let info = settle(&h.adapter, &id).await;
    assert_eq!(info.state, ModelState::Succeeded);
    let result = info.result.expect("succeeded run carries a result");
    assert_eq!(result.kpis.len(), 3);
    assert_eq!(result.output_path, Some(resolved(OUTPUT_KPIS)));
    assert_eq!(result.model_output_path, Some(resolved(OUTPUT_MODEL)));

    let kpi_document: serde_json::Value =
        serde_json::from_slice(&h.objects.object(&resolved(OUTPUT_KPIS)).unwrap()).unwrap();
    assert_eq!(kpi_document.as_array().unwrap().len(), 3);
    let model: serde_json::Value =
        serde_json::from_slice(&h.objects.object(&resolved(OUTPUT_MODEL)).unwrap()).unwrap();
    assert_eq!(model["name"], "test energy system");
    assert_eq!(model["KPIs"].as_array().unwrap().len(), 3);
    assert_eq!(model["KPIs"][0]["name"], "energy title");

    let body = &h.engine.start_bodies()[0];
    assert_eq!(
        body["esdlContents"].as_str().unwrap(),
        STANDARD.encode(fixtures::model_document())
    );

    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        if let RunEventPayload::Finished { state, .. } = event.payload {
            assert_eq!(state, ModelState::Succeeded);
            finished += 1;
        }
    }
    assert_eq!(finished, 1);
}

#[tokio::test(start_paused = true)]
async fn results_are_recorded_exactly_once() {
    let h = harness(ScriptedEngine::happy_path(&["energy"]), AdapterConfig::default());
    let id = start(&h.adapter, fixtures::run_config()).await;

    loop {
        if h.adapter.status(&id).await.state != ModelState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let (first, second) = tokio::join!(h.adapter.results(&id), h.adapter.results(&id));

    assert_eq!(first.state, ModelState::Succeeded);
    assert_eq!(first, second);
    assert_eq!(h.adapter.results(&id).await, first);
    assert_eq!(h.adapter.status(&id).await, first);
}

#[tokio::test(start_paused = true)]
async fn output_bucket_is_created_when_missing() {
    let h = harness(ScriptedEngine::happy_path(&["energy"]), AdapterConfig::default());
    let mut config = fixtures::run_config();
    config.base_path = None;
    config.input_model_path = Some(resolved(fixtures::INPUT_MODEL));
    config.output_model_path = None;
    config.output_file_path = Some("results/kpis.json".into());

    let id = start(&h.adapter, config).await;
    let info = settle(&h.adapter, &id).await;

    assert_eq!(info.state, ModelState::Succeeded);
    assert_eq!(h.objects.created_buckets(), vec!["results".to_string()]);
    assert!(h.objects.object("results/kpis.json").is_some());
}

#[tokio::test(start_paused = true)]
async fn missing_model_payload_fails_the_run() {
    let h = harness(ScriptedEngine::happy_path(&["energy"]), AdapterConfig::default());
    let mut config = fixtures::run_config();
    config.input_model_path = Some("input/absent.esdl".into());

    let id = start(&h.adapter, config).await;
    let info = settle(&h.adapter, &id).await;

    assert_eq!(info.state, ModelState::Error);
    assert!(info.reason.unwrap().starts_with("failed to load model payload"));
    h.engine.assert_start_count_eq(0);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_turns_success_into_error() {
    let h = harness(ScriptedEngine::happy_path(&["energy"]), AdapterConfig::default());
    h.objects.set_fail_writes(true);

    let id = start(&h.adapter, fixtures::run_config()).await;
    let info = settle(&h.adapter, &id).await;

    assert_eq!(info.state, ModelState::Error);
    assert!(info.reason.unwrap().starts_with("failed to persist results"));
    assert!(info.result.is_none());
}

#[tokio::test(start_paused = true)]
async fn status_and_results_agree_when_storage_fails() {
    let h = harness(ScriptedEngine::happy_path(&["energy"]), AdapterConfig::default());
    h.objects.set_fail_writes(true);
    let mut events = h.adapter.subscribe();
    let id = start(&h.adapter, fixtures::run_config()).await;

    let seen = loop {
        let info = h.adapter.status(&id).await;
        if info.state != ModelState::Running {
            break info;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    };
    assert_eq!(seen.state, ModelState::Error);
    assert!(seen.result.is_none());
    assert!(seen
        .reason
        .as_deref()
        .unwrap()
        .starts_with("failed to persist results"));

    assert_eq!(h.adapter.results(&id).await, seen);
    assert_eq!(h.adapter.status(&id).await, seen);

    let finished: Vec<ModelState> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event.payload {
            RunEventPayload::Finished { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![ModelState::Error]);
}

#[tokio::test(start_paused = true)]
async fn status_reports_stored_result_before_it_is_recorded() {
    let h = harness(ScriptedEngine::happy_path(&["energy"]), AdapterConfig::default());
    let id = start(&h.adapter, fixtures::run_config()).await;

    let seen = loop {
        let info = h.adapter.status(&id).await;
        if info.state != ModelState::Running {
            break info;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    };
    assert_eq!(seen.state, ModelState::Succeeded);
    let result = seen.result.as_ref().expect("succeeded run carries a result");
    assert_eq!(result.output_path, Some(resolved(OUTPUT_KPIS)));
    assert!(h.objects.object(&resolved(OUTPUT_KPIS)).is_some());

    assert_eq!(h.adapter.results(&id).await, seen);
}

#[tokio::test(start_paused = true)]
async fn engine_error_is_reported_through_results() {
    let engine = ScriptedEngine::new().with_start(StartReply::Rejected {
        status: 500,
        description: "ESSIM could not parse the ESDL".into(),
    });
    let h = harness(engine, AdapterConfig::default());

    let id = start(&h.adapter, fixtures::run_config()).await;
    let info = settle(&h.adapter, &id).await;

    assert_eq!(info.state, ModelState::Error);
    assert_eq!(info.reason.as_deref(), Some("ESSIM could not parse the ESDL"));
    assert!(h.objects.object(&resolved(OUTPUT_KPIS)).is_none());
}

#[tokio::test(start_paused = true)]
async fn remove_forgets_run_and_stops_polling() {
    let engine = ScriptedEngine::new()
        .with_start(StartReply::Started {
            simulation_id: "sim-1".into(),
        })
        .with_status(running(0.5));
    let h = harness(engine, AdapterConfig::default());
    let id = start(&h.adapter, fixtures::run_config()).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let removed = h.adapter.remove(&id).await;
    assert_eq!(removed.state, ModelState::Unknown);

    let polls = h.engine.status_count();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.engine.status_count(), polls);

    for info in [h.adapter.status(&id).await, h.adapter.results(&id).await] {
        assert_eq!(info.state, ModelState::Error);
        assert!(info.reason.unwrap().contains("unknown"));
    }
}

#[tokio::test(start_paused = true)]
async fn worker_pool_bounds_concurrent_runs() {
    let engine = ScriptedEngine::new()
        .with_start(StartReply::Started {
            simulation_id: "sim-1".into(),
        })
        .with_status(running(0.5));
    let mut config = AdapterConfig::default();
    config.dispatcher.workers = 1;
    let h = harness(engine, config);

    let first = start(&h.adapter, fixtures::run_config()).await;
    let second = start(&h.adapter, fixtures::run_config()).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.adapter.in_flight(), 2);
    h.engine.assert_start_count_eq(1);
    assert_eq!(h.adapter.status(&second).await.state, ModelState::Running);

    h.adapter.remove(&first).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.engine.assert_start_count_eq(2);
}

#[tokio::test(start_paused = true)]
async fn profiles_round_trip_through_bridge() {
    let series_store = Arc::new(InMemoryTimeSeriesStore::new());
    let bridge = StorageBridge::new(Arc::new(InMemoryObjectStore::new()), JsonModelStore)
        .with_series_store(series_store.clone());
    let start = Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap();

    bridge
        .store_profile(&TimeSeries::hourly("heat", "demand", start, [1.0, 2.0, 3.0, 4.0]))
        .await
        .unwrap();
    assert_eq!(series_store.point_count("heat", "demand"), 4);

    let range = TimeRange::new(start, start + chrono::Duration::hours(3));
    let profile = bridge.load_profile(&range, "heat", "demand").await.unwrap().unwrap();
    assert_eq!(profile.values(), vec![1.0, 2.0, 3.0]);

    let empty = TimeRange::new(start - chrono::Duration::hours(5), start);
    assert!(bridge.load_profile(&empty, "heat", "demand").await.unwrap().is_none());
}
