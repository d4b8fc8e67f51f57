use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::kpi::KpiResult;

/// Opaque identifier of one tracked run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Client-visible lifecycle state of a run.
///
/// Persisted records only ever move forward through
/// `Accepted -> Ready -> Running -> {Succeeded | Error}`. `Unknown` is
/// reported for identifiers the registry does not hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Unknown,
    Accepted,
    Ready,
    Running,
    Succeeded,
    Error,
}

impl ModelState {
    /// Upper-case wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Unknown => "UNKNOWN",
            ModelState::Accepted => "ACCEPTED",
            ModelState::Ready => "READY",
            ModelState::Running => "RUNNING",
            ModelState::Succeeded => "SUCCEEDED",
            ModelState::Error => "ERROR",
        }
    }

    /// Whether the state is `SUCCEEDED` or `ERROR`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelState::Succeeded | ModelState::Error)
    }

    /// Whether a persisted record may move from `self` to `next`.
    pub fn can_advance_to(&self, next: ModelState) -> bool {
        matches!(
            (self, next),
            (ModelState::Accepted, ModelState::Ready)
                | (ModelState::Ready, ModelState::Running)
                | (ModelState::Running, ModelState::Succeeded)
                | (ModelState::Running, ModelState::Error)
        )
    }
}

impl Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration document attached to a run by `initialize`.
///
/// Field names on the wire follow the adapter's existing clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Body of the engine start request; the model payload is embedded into it.
    #[serde(rename = "essim_post_body", default)]
    pub start_body: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "input_esdl_file_path", default)]
    pub input_model_path: Option<String>,
    #[serde(rename = "output_esdl_file_path", default)]
    pub output_model_path: Option<String>,
    #[serde(default)]
    pub output_file_path: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
}

impl RunConfig {
    fn resolve(&self, path: Option<&String>) -> Option<String> {
        let path = path?;
        Some(format!("{}{}", self.base_path.as_deref().unwrap_or(""), path))
    }

    /// Object path of the model payload to simulate.
    pub fn resolved_input_model_path(&self) -> Option<String> {
        self.resolve(self.input_model_path.as_ref())
    }

    /// Object path where the KPI-annotated model is written.
    pub fn resolved_output_model_path(&self) -> Option<String> {
        self.resolve(self.output_model_path.as_ref())
    }

    /// Object path where the raw KPI document is written.
    pub fn resolved_output_file_path(&self) -> Option<String> {
        self.resolve(self.output_file_path.as_ref())
    }
}

/// Durable result of a successful run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub kpis: Vec<KpiResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output_path: Option<String>,
}

impl RunResult {
    /// Result carrying KPIs and no output paths.
    pub fn from_kpis(kpis: Vec<KpiResult>) -> Self {
        Self {
            kpis,
            output_path: None,
            model_output_path: None,
        }
    }
}

/// Registry entry for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub state: ModelState,
    pub config: Option<RunConfig>,
    pub result: Option<RunResult>,
    pub reason: Option<String>,
}

impl RunRecord {
    /// Record in `ACCEPTED` with nothing attached.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            state: ModelState::Accepted,
            config: None,
            result: None,
            reason: None,
        }
    }

    /// Attach the run configuration and move to `Ready`.
    pub fn attach_config(&mut self, config: RunConfig) -> Result<(), RegistryError> {
        if self.config.is_some() {
            return Err(RegistryError::AlreadyConfigured(self.run_id));
        }
        self.advance(ModelState::Ready, None, None)?;
        self.config = Some(config);
        Ok(())
    }

    /// Move to `next`, enforcing the forward-only ordering.
    ///
    /// A result may only accompany the move to `Succeeded`.
    pub fn advance(
        &mut self,
        next: ModelState,
        result: Option<RunResult>,
        reason: Option<String>,
    ) -> Result<(), RegistryError> {
        if !self.state.can_advance_to(next) {
            return Err(RegistryError::InvalidTransition {
                run_id: self.run_id,
                from: self.state,
                to: next,
            });
        }
        if result.is_some() && next != ModelState::Succeeded {
            return Err(RegistryError::ResultOutsideSuccess(self.run_id));
        }
        self.state = next;
        if result.is_some() {
            self.result = result;
        }
        if reason.is_some() {
            self.reason = reason;
        }
        Ok(())
    }

    /// Externally visible view of the record.
    pub fn info(&self) -> RunInfo {
        RunInfo {
            model_run_id: self.run_id.to_string(),
            state: self.state,
            result: self.result.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Externally visible view of a run, as returned by every adapter operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub model_run_id: String,
    pub state: ModelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunInfo {
    /// Info with no result or reason.
    pub fn new(model_run_id: impl Into<String>, state: ModelState) -> Self {
        Self {
            model_run_id: model_run_id.into(),
            state,
            result: None,
            reason: None,
        }
    }

    /// `ERROR` info carrying `reason`.
    pub fn error(model_run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model_run_id: model_run_id.into(),
            state: ModelState::Error,
            result: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        use ModelState::*;
        let order = [Accepted, Ready, Running];
        for pair in order.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]));
            assert!(!pair[1].can_advance_to(pair[0]));
        }
        assert!(Running.can_advance_to(Succeeded));
        assert!(Running.can_advance_to(Error));
        assert!(!Accepted.can_advance_to(Running));
        assert!(!Succeeded.can_advance_to(Error));
        assert!(!Error.can_advance_to(Succeeded));
        assert!(!Accepted.can_advance_to(Unknown));
    }

    #[test]
    fn result_only_accompanies_success() {
        let mut record = RunRecord::new(RunId::new());
        record.attach_config(RunConfig::default()).unwrap();
        record.advance(ModelState::Running, None, None).unwrap();

        let err = record
            .advance(ModelState::Error, Some(RunResult::from_kpis(vec![])), None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::ResultOutsideSuccess(_)));
        assert_eq!(record.state, ModelState::Running);

        record
            .advance(ModelState::Succeeded, Some(RunResult::from_kpis(vec![])), None)
            .unwrap();
        assert_eq!(record.state, ModelState::Succeeded);
        assert!(record.result.is_some());
    }

    #[test]
    fn config_attaches_once() {
        let mut record = RunRecord::new(RunId::new());
        record.attach_config(RunConfig::default()).unwrap();
        let err = record.attach_config(RunConfig::default()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyConfigured(_)));
        assert_eq!(record.state, ModelState::Ready);
    }

    #[test]
    fn config_paths_resolve_against_base_path() {
        let config: RunConfig = serde_json::from_value(serde_json::json!({
            "essim_post_body": {"user": "essim"},
            "base_path": "bucket/trial_1/",
            "input_esdl_file_path": "adapter/in.esdl",
            "output_esdl_file_path": "adapter/out.esdl",
            "output_file_path": "adapter/KPIs.json"
        }))
        .unwrap();

        assert_eq!(config.start_body["user"], "essim");
        assert_eq!(
            config.resolved_input_model_path().as_deref(),
            Some("bucket/trial_1/adapter/in.esdl")
        );
        assert_eq!(
            config.resolved_output_file_path().as_deref(),
            Some("bucket/trial_1/adapter/KPIs.json")
        );
    }

    #[test]
    fn state_serializes_upper_case() {
        let info = RunInfo::new("abc", ModelState::Succeeded);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "SUCCEEDED");
        assert_eq!(json["model_run_id"], "abc");
        assert!(json.get("reason").is_none());
    }
}
