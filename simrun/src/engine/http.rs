use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn, Instrument};

use super::{KpiReply, SimulationEngine, SimulationState, StartReply, StatusReply};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::kpi::{EngineKpiReport, KpiEntry, KpiModule};
use crate::telemetry;

/// Engine client speaking JSON over HTTP.
#[derive(Clone, Debug)]
pub struct HttpEngineClient {
    client: Client,
    base_url: String,
}

impl HttpEngineClient {
    /// Build a client for `config.base_url` with the configured request timeout.
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Engine URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn read(response: reqwest::Response) -> Result<(u16, String), EngineError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| EngineError::Transport(err.to_string()))?;
        Ok((status, body))
    }
}

fn transport(err: reqwest::Error) -> EngineError {
    EngineError::Transport(err.to_string())
}

/// Pull a description out of an error body, falling back to the raw text.
fn description_of(body: &str, key: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get(key).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Deserialize)]
struct StartedBody {
    id: Value,
}

#[derive(Deserialize)]
struct StatusBody {
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Description", default)]
    description: Value,
}

pub(crate) fn decode_start(status: u16, body: &str) -> Result<StartReply, EngineError> {
    match StatusCode::from_u16(status) {
        Ok(StatusCode::CREATED) => {
            let started: StartedBody =
                serde_json::from_str(body).map_err(|err| EngineError::Decode(err.to_string()))?;
            let simulation_id = match started.id {
                Value::String(id) => id,
                other => other.to_string(),
            };
            Ok(StartReply::Started { simulation_id })
        }
        Ok(StatusCode::SERVICE_UNAVAILABLE) => Ok(StartReply::Busy),
        _ => Ok(StartReply::Rejected {
            status,
            description: description_of(body, "description"),
        }),
    }
}

pub(crate) fn decode_status(status: u16, body: &str) -> Result<StatusReply, EngineError> {
    if status != StatusCode::OK.as_u16() {
        return Ok(StatusReply {
            status,
            state: None,
            description: description_of(body, "Description"),
        });
    }
    let parsed: StatusBody =
        serde_json::from_str(body).map_err(|err| EngineError::Decode(err.to_string()))?;
    let description = match parsed.description {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(StatusReply {
        status,
        state: Some(SimulationState::from_engine(&parsed.state)),
        description,
    })
}

pub(crate) fn decode_kpi(status: u16, body: &str) -> Result<KpiReply, EngineError> {
    if status != StatusCode::OK.as_u16() {
        return Ok(KpiReply::Failed { status });
    }
    let items: Vec<HashMap<String, EngineKpiReport>> =
        serde_json::from_str(body).map_err(|err| EngineError::Decode(err.to_string()))?;
    Ok(KpiReply::Reports(KpiEntry::decode_list(items)))
}

pub(crate) fn decode_modules(status: u16, body: &str) -> Result<Vec<KpiModule>, EngineError> {
    if status != StatusCode::OK.as_u16() {
        return Err(EngineError::Unexpected {
            status,
            description: description_of(body, "description"),
        });
    }
    serde_json::from_str(body).map_err(|err| EngineError::Decode(err.to_string()))
}

#[async_trait]
impl SimulationEngine for HttpEngineClient {
    async fn start(&self, body: &Value) -> Result<StartReply, EngineError> {
        let response = self
            .client
            .post(&self.base_url)
            .json(body)
            .send()
            .instrument(telemetry::engine_call_span("start", None))
            .await
            .map_err(transport)?;
        let (status, text) = Self::read(response).await?;
        debug!(status, "engine start replied");
        decode_start(status, &text)
    }

    async fn simulation_status(&self, simulation_id: &str) -> Result<StatusReply, EngineError> {
        let response = self
            .client
            .get(self.url(&format!("{simulation_id}/status")))
            .send()
            .instrument(telemetry::engine_call_span("status", Some(simulation_id)))
            .await
            .map_err(transport)?;
        let (status, text) = Self::read(response).await?;
        decode_status(status, &text)
    }

    async fn kpi_modules(&self) -> Result<Vec<KpiModule>, EngineError> {
        let response = self
            .client
            .get(self.url("kpiModules"))
            .send()
            .instrument(telemetry::engine_call_span("kpi_modules", None))
            .await
            .map_err(transport)?;
        let (status, text) = Self::read(response).await?;
        decode_modules(status, &text)
    }

    async fn kpi_results(&self, simulation_id: &str) -> Result<KpiReply, EngineError> {
        let response = self
            .client
            .get(self.url(&format!("{simulation_id}/kpi")))
            .send()
            .instrument(telemetry::engine_call_span("kpi", Some(simulation_id)))
            .await
            .map_err(transport)?;
        let (status, text) = Self::read(response).await?;
        let reply = decode_kpi(status, &text)?;
        if let KpiReply::Failed { status } = reply {
            warn!(simulation_id, status, "engine KPI endpoint failed");
        }
        Ok(reply)
    }
}
