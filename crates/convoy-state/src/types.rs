//! Domain types for the convoy state store.
//!
//! Desired state (`ServiceSpec`, `ScalingPolicy`, `SecurityRule`) and
//! observed state (`ServiceState`) are kept as separate records; the
//! controllers converge one toward the other. Pipeline records
//! (`PipelineRun`, `ImageArtifact`, `ScanReport`) are created per trigger
//! and retained for audit.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use convoy_core::config::{RuleConfig, ScalingConfig, ServiceConfig};
use convoy_core::{Digest, ImageRef};

use crate::error::{StateError, StateResult};

pub type ServiceId = String;
pub type TaskId = String;
pub type RunId = String;

/// Revision number of a service spec; bumped on every new image.
pub type Revision = u64;

/// Seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Pipeline ───────────────────────────────────────────────────────

/// The "new revision available" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Source repository reference (e.g. `git@host:team/web.git`).
    pub repository: String,
    /// Commit sha or tag.
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Scan,
    Evaluate,
    Publish,
    Rollout,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Build,
        Stage::Scan,
        Stage::Evaluate,
        Stage::Publish,
        Stage::Rollout,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Scan => "scan",
            Stage::Evaluate => "evaluate",
            Stage::Publish => "publish",
            Stage::Rollout => "rollout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub state: StageState,
    pub message: Option<String>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    Success,
    Failed,
    Aborted,
}

/// How the rollout handed off by a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutOutcome {
    SteadyState,
    RolledBack,
}

/// One execution of the release pipeline for a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub service_id: ServiceId,
    pub trigger: TriggerEvent,
    /// Stage statuses, in execution order.
    pub stages: Vec<StageStatus>,
    /// `None` while in progress.
    pub terminal: Option<RunResult>,
    pub artifact: Option<Digest>,
    pub published: Option<PublishedRef>,
    pub rollout_outcome: Option<RolloutOutcome>,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PipelineRun {
    pub fn new(service_id: &str, trigger: TriggerEvent) -> Self {
        let now = epoch_secs();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_id: service_id.to_string(),
            trigger,
            stages: Stage::ALL
                .iter()
                .map(|&stage| StageStatus {
                    stage,
                    state: StageState::Pending,
                    message: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            terminal: None,
            artifact: None,
            published: None,
            rollout_outcome: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn stage_mut(&mut self, stage: Stage) -> Option<&mut StageStatus> {
        self.stages.iter_mut().find(|s| s.stage == stage)
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        let now = epoch_secs();
        if let Some(s) = self.stage_mut(stage) {
            s.state = StageState::Running;
            s.started_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn end_stage(&mut self, stage: Stage, state: StageState, message: Option<String>) {
        let now = epoch_secs();
        if let Some(s) = self.stage_mut(stage) {
            s.state = state;
            s.message = message;
            s.finished_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Mark the run terminal; remaining pending stages are skipped.
    pub fn finish(&mut self, result: RunResult, error: Option<String>) {
        for s in &mut self.stages {
            if matches!(s.state, StageState::Pending | StageState::Running) {
                s.state = StageState::Skipped;
            }
        }
        self.terminal = Some(result);
        self.error = error;
        self.updated_at = epoch_secs();
    }
}

// ── Images ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub source_repository: String,
    pub commit: String,
    pub builder: String,
    pub built_at: u64,
}

/// A built image. The digest is its identity; the tag is a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
    pub build: BuildMetadata,
}

impl ImageArtifact {
    /// Artifacts with equal digests are the same image.
    pub fn same_image(&self, other: &ImageArtifact) -> bool {
        self.digest == other.digest
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef::pinned(&self.repository, &self.tag, self.digest.clone())
    }
}

/// Reference returned by the registry after a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRef {
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
}

impl PublishedRef {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef::pinned(&self.repository, &self.tag, self.digest.clone())
    }
}

/// Vulnerability severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(StateError::Invalid(format!("unknown severity: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub cve: String,
    pub package: Option<String>,
}

/// Result of scanning one artifact. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub digest: Digest,
    pub findings: Vec<Finding>,
    pub scanned_at: u64,
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_units: u32,
    pub memory_mb: u32,
}

/// What a task is started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: ImageRef,
    pub port: u16,
    pub resources: ResourceLimits,
}

/// Desired state of a service. Mutated only by deploy requests and the
/// autoscaler, through `StateStore::update_service_spec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub desired_count: u32,
    pub port: u16,
    pub resources: ResourceLimits,
    /// `None` until the first deploy.
    pub image: Option<ImageRef>,
    /// Bumped each time `image` changes.
    pub revision: Revision,
    pub min_healthy_percent: u32,
    pub max_surge_percent: u32,
    /// Bumped on every write, including desired count changes.
    pub generation: u64,
    pub updated_at: u64,
}

impl ServiceSpec {
    pub fn from_config(service: &ServiceConfig, min_healthy_percent: u32, max_surge_percent: u32) -> Self {
        Self {
            id: service.id.clone(),
            desired_count: service.desired_count,
            port: service.port,
            resources: ResourceLimits {
                cpu_units: service.cpu_units,
                memory_mb: service.memory_mb,
            },
            image: None,
            revision: 0,
            min_healthy_percent,
            max_surge_percent,
            generation: 0,
            updated_at: epoch_secs(),
        }
    }

    /// Container spec of the current revision, if an image was deployed.
    pub fn container(&self) -> Option<ContainerSpec> {
        self.image.as_ref().map(|image| ContainerSpec {
            image: image.clone(),
            port: self.port,
            resources: self.resources.clone(),
        })
    }

    /// `ceil(desired × min_healthy_percent)`.
    pub fn min_healthy(&self) -> u32 {
        (self.desired_count * self.min_healthy_percent).div_ceil(100)
    }

    /// `floor(desired × max_surge_percent)`.
    pub fn max_total(&self) -> u32 {
        self.desired_count * self.max_surge_percent / 100
    }

    /// Point the spec at a new image. Returns false when the digest is
    /// already the current one (deploys are idempotent by digest).
    pub fn set_image(&mut self, image: ImageRef) -> bool {
        let unchanged = match (&self.image, &image.digest) {
            (Some(current), Some(digest)) => current.digest.as_ref() == Some(digest),
            _ => false,
        };
        if unchanged {
            return false;
        }
        self.image = Some(image);
        self.revision += 1;
        true
    }
}

/// Task lifecycle as seen by the rollout controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskHealth {
    Starting,
    Healthy,
    Unhealthy,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub revision: Revision,
    pub health: TaskHealth,
}

/// Observed state of a service. Written only by the rollout controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub service_id: ServiceId,
    pub tasks: Vec<TaskRecord>,
    /// Last revision that reached steady state.
    pub current_revision: Option<Revision>,
    pub current_image: Option<ImageRef>,
    /// Revision that was rolled back and must not be relaunched.
    #[serde(default)]
    pub failed_revision: Option<Revision>,
    pub steady: bool,
    pub updated_at: u64,
}

impl ServiceState {
    pub fn empty(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            tasks: Vec::new(),
            current_revision: None,
            current_image: None,
            failed_revision: None,
            steady: false,
            updated_at: epoch_secs(),
        }
    }

    /// Tasks that are not stopped, draining ones included.
    pub fn running_count(&self) -> u32 {
        self.tasks
            .iter()
            .filter(|t| t.health != TaskHealth::Stopped)
            .count() as u32
    }

    pub fn healthy_count(&self) -> u32 {
        self.tasks
            .iter()
            .filter(|t| t.health == TaskHealth::Healthy)
            .count() as u32
    }
}

// ── Scaling ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Average CPU utilization across healthy tasks, percent.
    Cpu,
    /// Average memory utilization across healthy tasks, percent.
    Memory,
}

impl FromStr for MetricKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(MetricKind::Cpu),
            "memory" => Ok(MetricKind::Memory),
            other => Err(StateError::Invalid(format!("unknown scaling metric: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub metric: MetricKind,
    pub target_value: f64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub cooldown_secs: u64,
    pub dead_band: f64,
    pub max_step: u32,
}

impl ScalingPolicy {
    pub fn from_config(cfg: &ScalingConfig) -> StateResult<Self> {
        Ok(Self {
            metric: cfg.metric.parse()?,
            target_value: cfg.target_value,
            min_capacity: cfg.min_capacity,
            max_capacity: cfg.max_capacity,
            cooldown_secs: cfg.cooldown_seconds,
            dead_band: cfg.dead_band,
            max_step: cfg.max_step.max(1),
        })
    }

    /// Clamp a desired count into `[min_capacity, max_capacity]`.
    pub fn clamp(&self, desired: u32) -> u32 {
        desired.clamp(self.min_capacity, self.max_capacity)
    }
}

/// Point-in-time metric sample for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub service_id: ServiceId,
    pub epoch: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub healthy_tasks: u32,
}

impl MetricsSnapshot {
    pub fn value(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Cpu => self.cpu_percent,
            MetricKind::Memory => self.memory_percent,
        }
    }

    /// One row per service holds its newest sample.
    pub fn table_key(&self) -> String {
        self.service_id.clone()
    }
}

// ── Security rules ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Ingress,
    Egress,
}

impl FromStr for Direction {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingress" => Ok(Direction::Ingress),
            "egress" => Ok(Direction::Egress),
            other => Err(StateError::Invalid(format!("unknown direction: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Every protocol and port.
    All,
}

impl FromStr for Protocol {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "all" | "-1" => Ok(Protocol::All),
            other => Err(StateError::Invalid(format!("unknown protocol: {other}"))),
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.from..=self.to).contains(&port)
    }
}

/// Who a rule admits: an address block or a peer security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleSource {
    Cidr(String),
    PeerGroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub ports: PortRange,
    pub source: RuleSource,
}

impl SecurityRule {
    /// Whether this rule admits traffic to `port` (protocol `All` covers every port).
    pub fn covers_port(&self, port: u16) -> bool {
        self.protocol == Protocol::All || self.ports.contains(port)
    }
}

impl TryFrom<&RuleConfig> for SecurityRule {
    type Error = StateError;

    fn try_from(cfg: &RuleConfig) -> Result<Self, Self::Error> {
        let source = match (&cfg.cidr, &cfg.peer_group) {
            (Some(cidr), None) => RuleSource::Cidr(cidr.clone()),
            (None, Some(group)) => RuleSource::PeerGroup(group.clone()),
            _ => {
                return Err(StateError::Invalid(
                    "rule needs exactly one of cidr or peer_group".to_string(),
                ));
            }
        };
        Ok(Self {
            direction: cfg.direction.parse()?,
            protocol: cfg.protocol.parse()?,
            ports: PortRange {
                from: cfg.from_port,
                to: cfg.to_port,
            },
            source,
        })
    }
}

/// The complete set of rules active for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub service_id: ServiceId,
    pub rules: Vec<SecurityRule>,
    /// Bumped on every successful apply.
    pub version: u64,
    pub applied_at: u64,
}
