//! In-process collaborators.
//!
//! Deterministic stand-ins for the registry, scanner, builder, and
//! orchestration platform. Every probe, push, and scan is driven by the
//! caller, and failures can be injected ahead of time.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use convoy_core::{Digest, ImageRef, version_tag};
use convoy_state::{
    BuildMetadata, Finding, ImageArtifact, PublishedRef, Revision, ScanReport, SecurityRule,
    ServiceSpec, TaskId, TriggerEvent, epoch_secs,
};

use crate::capability::{
    FirewallControl, ImageBuilder, Registry, Scanner, ServiceReader, SpecWriter, TaskControl,
};
use crate::error::{BuildError, PlatformError, RegistryError, ScanError};
use crate::types::*;

// ── Registry ───────────────────────────────────────────────────────

#[derive(Debug)]
struct StoredImage {
    repository: String,
    tags: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    images: HashMap<Digest, StoredImage>,
    push_calls: u32,
    failures: VecDeque<RegistryError>,
}

/// Content-addressed registry held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    inner: Mutex<RegistryInner>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors returned by the next pushes, in order.
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = RegistryError>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failures.extend(errors);
    }

    pub fn push_calls(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).push_calls
    }

    /// Number of distinct images stored.
    pub fn image_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).images.len()
    }

    pub fn tags(&self, digest: &Digest) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .images
            .get(digest)
            .map(|img| img.tags.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn push(
        &self,
        repository: &str,
        tag: &str,
        digest: &Digest,
        blob: &[u8],
    ) -> Result<PublishedRef, RegistryError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.push_calls += 1;
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        if Digest::of(blob) != *digest {
            return Err(RegistryError::Rejected(format!(
                "blob does not match digest {digest}"
            )));
        }

        let image = inner
            .images
            .entry(digest.clone())
            .or_insert_with(|| StoredImage {
                repository: repository.to_string(),
                tags: BTreeSet::new(),
            });
        if image.repository != repository {
            return Err(RegistryError::Rejected(format!(
                "digest {digest} already stored under {}",
                image.repository
            )));
        }
        image.tags.insert(tag.to_string());
        debug!(%repository, %tag, digest = %digest.short(), "image pushed");

        Ok(PublishedRef {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.clone(),
        })
    }

    async fn exists(&self, digest: &Digest) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.images.contains_key(digest))
    }
}

// ── Scanner ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ScannerInner {
    by_digest: HashMap<Digest, Vec<Finding>>,
    default_findings: Vec<Finding>,
    unavailable_for: u32,
    misreported: Option<Digest>,
    scan_calls: u32,
}

/// Scanner reporting canned findings.
#[derive(Debug, Default)]
pub struct InMemoryScanner {
    inner: Mutex<ScannerInner>,
}

impl InMemoryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Findings reported for a specific image.
    pub fn set_findings(&self, digest: Digest, findings: Vec<Finding>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_digest.insert(digest, findings);
    }

    /// Findings reported for any image without specific findings.
    pub fn set_default_findings(&self, findings: Vec<Finding>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.default_findings = findings;
    }

    /// Fail the next `n` scans with `ScanError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).unavailable_for = n;
    }

    /// Label every report with `digest` instead of the scanned image's.
    pub fn misreport_digest(&self, digest: Digest) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).misreported = Some(digest);
    }

    pub fn scan_calls(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).scan_calls
    }
}

#[async_trait]
impl Scanner for InMemoryScanner {
    async fn scan(&self, image: &ImageRef) -> Result<ScanReport, ScanError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.scan_calls += 1;
        if inner.unavailable_for > 0 {
            inner.unavailable_for -= 1;
            return Err(ScanError::Unavailable("scanner endpoint unreachable".into()));
        }
        let digest = image
            .digest
            .clone()
            .ok_or_else(|| ScanError::Unavailable(format!("cannot scan unpinned {image}")))?;
        let findings = inner
            .by_digest
            .get(&digest)
            .cloned()
            .unwrap_or_else(|| inner.default_findings.clone());
        Ok(ScanReport {
            digest: inner.misreported.clone().unwrap_or(digest),
            findings,
            scanned_at: epoch_secs(),
        })
    }
}

// ── Builder ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BuilderInner {
    failure: Option<String>,
    corrupt_digest: bool,
    delay: Option<Duration>,
    build_calls: u32,
}

/// Builder whose image bytes are derived from the trigger, so the same
/// trigger always yields the same digest.
#[derive(Debug, Default)]
pub struct StaticBuilder {
    inner: Mutex<BuilderInner>,
}

impl StaticBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every build with `message`.
    pub fn fail_with(&self, message: &str) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).failure = Some(message.to_string());
    }

    /// Report a digest that does not match the produced bytes.
    pub fn corrupt_digest(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).corrupt_digest = true;
    }

    /// Make every build take `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).delay = Some(delay);
        self
    }

    pub fn build_calls(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).build_calls
    }

    /// Image bytes produced for a trigger.
    pub fn blob_for(trigger: &TriggerEvent) -> Vec<u8> {
        format!("{}#{}", trigger.repository, trigger.reference).into_bytes()
    }
}

#[async_trait]
impl ImageBuilder for StaticBuilder {
    async fn build(
        &self,
        trigger: &TriggerEvent,
        repository: &str,
    ) -> Result<BuiltImage, BuildError> {
        let (delay, failure, corrupt) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.build_calls += 1;
            (inner.delay, inner.failure.clone(), inner.corrupt_digest)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = failure {
            return Err(BuildError::Failed(message));
        }

        let blob = Self::blob_for(trigger);
        let digest = if corrupt {
            Digest::of(b"not-the-image")
        } else {
            Digest::of(&blob)
        };
        Ok(BuiltImage {
            artifact: ImageArtifact {
                repository: repository.to_string(),
                tag: version_tag(&trigger.reference),
                digest,
                build: BuildMetadata {
                    source_repository: trigger.repository.clone(),
                    commit: trigger.reference.clone(),
                    builder: "static".to_string(),
                    built_at: epoch_secs(),
                },
            },
            blob,
        })
    }
}

// ── Orchestration platform ─────────────────────────────────────────

/// Probe outcomes the simulated load balancer reports for tasks of one
/// revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbePlan {
    Healthy,
    Failing,
    /// Follow the script, then report healthy.
    Script(Vec<ProbeResult>),
}

impl ProbePlan {
    fn result_at(&self, index: usize) -> ProbeResult {
        match self {
            ProbePlan::Healthy => ProbeResult::Healthy,
            ProbePlan::Failing => ProbeResult::Failed,
            ProbePlan::Script(steps) => steps.get(index).copied().unwrap_or(ProbeResult::Healthy),
        }
    }
}

/// Task operations observed by the simulated platform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Started { task: TaskId, revision: Revision },
    Drained { task: TaskId },
    Stopped { task: TaskId },
}

#[derive(Debug)]
struct SimTask {
    service_id: String,
    revision: Revision,
    lifecycle: TaskLifecycle,
    probes_sent: usize,
    last_probe: Option<ProbeReport>,
}

#[derive(Debug, Default)]
struct PlatformInner {
    next_task: u64,
    probe_seq: u64,
    tasks: BTreeMap<TaskId, SimTask>,
    plans: HashMap<(String, Revision), ProbePlan>,
    specs: HashMap<String, ServiceSpec>,
    rules: HashMap<String, Vec<SecurityRule>>,
    events: Vec<PlatformEvent>,
    unavailable: bool,
    reject_rules: bool,
}

/// Simulated orchestration platform and firewall.
///
/// Every `describe_service` call stands for one load-balancer probe
/// interval: each running task receives one probe whose outcome follows
/// the [`ProbePlan`] of its revision. Stopped tasks are reported once and
/// then forgotten.
#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    inner: Mutex<PlatformInner>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_probe_plan(&self, service_id: &str, revision: Revision, plan: ProbePlan) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.plans.insert((service_id.to_string(), revision), plan);
    }

    /// Make every call fail with `PlatformError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).unavailable = unavailable;
    }

    /// Make `replace_rules` fail.
    pub fn reject_rules(&self, reject: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).reject_rules = reject;
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).events.clone()
    }

    /// Non-stopped tasks of a service as `(id, revision, lifecycle)`.
    pub fn live_tasks(&self, service_id: &str) -> Vec<(TaskId, Revision, TaskLifecycle)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .iter()
            .filter(|(_, t)| t.service_id == service_id && t.lifecycle != TaskLifecycle::Stopped)
            .map(|(id, t)| (id.clone(), t.revision, t.lifecycle))
            .collect()
    }

    pub fn applied_spec(&self, service_id: &str) -> Option<ServiceSpec> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.specs.get(service_id).cloned()
    }

    pub fn applied_rules(&self, service_id: &str) -> Option<Vec<SecurityRule>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rules.get(service_id).cloned()
    }

    fn check_available(inner: &PlatformInner) -> Result<(), PlatformError> {
        if inner.unavailable {
            return Err(PlatformError::Unavailable("platform API unreachable".into()));
        }
        Ok(())
    }

    fn set_lifecycle(
        &self,
        task_id: &str,
        lifecycle: TaskLifecycle,
    ) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::check_available(&inner)?;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| PlatformError::NotFound(format!("task {task_id}")))?;
        if task.lifecycle == TaskLifecycle::Stopped {
            return Ok(());
        }
        task.lifecycle = lifecycle;
        let event = match lifecycle {
            TaskLifecycle::Draining => PlatformEvent::Drained { task: task_id.to_string() },
            _ => PlatformEvent::Stopped { task: task_id.to_string() },
        };
        inner.events.push(event);
        Ok(())
    }
}

#[async_trait]
impl ServiceReader for InMemoryPlatform {
    async fn describe_service(
        &self,
        service_id: &str,
    ) -> Result<ServiceDescription, PlatformError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::check_available(&guard)?;
        let inner = &mut *guard;

        let mut tasks = Vec::new();
        for (id, task) in inner.tasks.iter_mut() {
            if task.service_id != service_id {
                continue;
            }
            if task.lifecycle == TaskLifecycle::Running {
                let result = inner
                    .plans
                    .get(&(service_id.to_string(), task.revision))
                    .map_or(ProbeResult::Healthy, |plan| plan.result_at(task.probes_sent));
                inner.probe_seq += 1;
                task.last_probe = Some(ProbeReport {
                    seq: inner.probe_seq,
                    result,
                });
                task.probes_sent += 1;
            }
            tasks.push(TaskObservation {
                id: id.clone(),
                revision: task.revision,
                lifecycle: task.lifecycle,
                last_probe: task.last_probe,
            });
        }

        inner
            .tasks
            .retain(|_, t| !(t.service_id == service_id && t.lifecycle == TaskLifecycle::Stopped));

        Ok(ServiceDescription {
            service_id: service_id.to_string(),
            tasks,
        })
    }
}

#[async_trait]
impl TaskControl for InMemoryPlatform {
    async fn start_task(&self, spec: &TaskSpec) -> Result<TaskId, PlatformError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::check_available(&inner)?;
        inner.next_task += 1;
        let id = format!("{}-{:04}", spec.service_id, inner.next_task);
        inner.tasks.insert(
            id.clone(),
            SimTask {
                service_id: spec.service_id.clone(),
                revision: spec.revision,
                lifecycle: TaskLifecycle::Running,
                probes_sent: 0,
                last_probe: None,
            },
        );
        inner.events.push(PlatformEvent::Started {
            task: id.clone(),
            revision: spec.revision,
        });
        debug!(task = %id, revision = spec.revision, image = %spec.container.image, "task started");
        Ok(id)
    }

    async fn drain_task(&self, task_id: &str) -> Result<(), PlatformError> {
        self.set_lifecycle(task_id, TaskLifecycle::Draining)
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), PlatformError> {
        self.set_lifecycle(task_id, TaskLifecycle::Stopped)
    }
}

#[async_trait]
impl SpecWriter for InMemoryPlatform {
    async fn update_service_spec(&self, spec: &ServiceSpec) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::check_available(&inner)?;
        inner.specs.insert(spec.id.clone(), spec.clone());
        Ok(())
    }
}

#[async_trait]
impl FirewallControl for InMemoryPlatform {
    async fn replace_rules(
        &self,
        service_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::check_available(&inner)?;
        if inner.reject_rules {
            return Err(PlatformError::Rejected("security group update denied".into()));
        }
        inner.rules.insert(service_id.to_string(), rules.to_vec());
        Ok(())
    }
}
