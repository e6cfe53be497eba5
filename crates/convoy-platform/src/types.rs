//! Wire-level records exchanged with the orchestration platform.

use serde::{Deserialize, Serialize};

use convoy_state::{ContainerSpec, ImageArtifact, Revision, ServiceId, TaskId};

/// Outcome of one load-balancer health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe timed out or could not connect.
    Failed,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Latest probe of a task. `seq` increases with every probe so the same
/// report is never counted twice across polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub seq: u64,
    pub result: ProbeResult,
}

/// Platform-side lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycle {
    Running,
    /// Deregistered from the load balancer, finishing in-flight requests.
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskObservation {
    pub id: TaskId,
    pub revision: Revision,
    pub lifecycle: TaskLifecycle,
    pub last_probe: Option<ProbeReport>,
}

/// Result of `describe_service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub service_id: ServiceId,
    pub tasks: Vec<TaskObservation>,
}

/// What the platform needs to launch one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub service_id: ServiceId,
    pub revision: Revision,
    pub container: ContainerSpec,
}

/// Output of an image build: the artifact record plus the image bytes the
/// registry stores under the artifact's digest.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub artifact: ImageArtifact,
    pub blob: Vec<u8>,
}
