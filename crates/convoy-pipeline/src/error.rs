//! Pipeline error taxonomy.

use std::time::Duration;

use thiserror::Error;

use convoy_gate::GateError;
use convoy_registry::PublishError;
use convoy_rollout::DeployError;
use convoy_state::{Finding, Stage, StateError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("scanner unavailable after {attempts} attempt(s): {reason}")]
    ScanUnavailable { attempts: u32, reason: String },

    #[error("blocked by {} finding(s): {}", .findings.len(), cve_list(.findings))]
    PolicyBlocked { findings: Vec<Finding> },

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("push failed after {attempts} attempt(s): {reason}")]
    PushFailed { attempts: u32, reason: String },

    #[error("deploy failed: {0}")]
    Deploy(DeployError),

    #[error("{stage} stage timed out after {timeout:?}")]
    StageTimeout { stage: Stage, timeout: Duration },

    #[error("run aborted")]
    Aborted,

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("pipeline lane for {0} is closed")]
    LaneClosed(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

fn cve_list(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| f.cve.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<GateError> for PipelineError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::ScanUnavailable { attempts, reason } => {
                PipelineError::ScanUnavailable { attempts, reason }
            }
        }
    }
}

impl From<PublishError> for PipelineError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::Rejected(reason) => PipelineError::PushRejected(reason),
            PublishError::PushFailed { attempts, reason } => {
                PipelineError::PushFailed { attempts, reason }
            }
            PublishError::State(e) => PipelineError::State(e),
        }
    }
}

impl From<DeployError> for PipelineError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Timeout { timeout, .. } => PipelineError::StageTimeout {
                stage: Stage::Rollout,
                timeout,
            },
            DeployError::State(e) => PipelineError::State(e),
            other => PipelineError::Deploy(other),
        }
    }
}
