use thiserror::Error;

use crate::run::{ModelState, RunId};

/// Failures of run registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("run {0} is unknown")]
    UnknownRun(RunId),
    #[error("run {0} already has a configuration attached")]
    AlreadyConfigured(RunId),
    #[error("run {0} has no configuration attached")]
    NotConfigured(RunId),
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        from: ModelState,
        to: ModelState,
    },
    #[error("run {0}: a result can only be recorded on success")]
    ResultOutsideSuccess(RunId),
}

/// Failures of dispatcher bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("a task for run {0} is already submitted")]
    DuplicateSubmission(RunId),
    #[error("the task for run {0} is still running")]
    NotDone(RunId),
    #[error("no task outcome held for run {0}")]
    NotFound(RunId),
}

/// Failures talking to the simulation engine.
///
/// Engine-reported outcomes (busy, rejected, failed) are replies, not errors;
/// these variants cover the cases where no usable reply was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("could not decode engine reply: {0}")]
    Decode(String),
    #[error("engine replied with status {status}: {description}")]
    Unexpected { status: u16, description: String },
}
