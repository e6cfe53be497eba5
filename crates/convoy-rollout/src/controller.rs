//! Rollout controller — drives one service toward its spec.
//!
//! Every tick polls the platform, folds probe reports into task health,
//! asks the planner for corrective actions, executes them, and persists the
//! observed `ServiceState`. The phase machine on top:
//!
//! ```text
//! Pending ──▶ InProgress ──▶ SteadyState
//!                 │
//!                 └──▶ RollingBack ──▶ RolledBack
//! ```
//!
//! A rollback is a reconcile toward the last steady revision under the same
//! surge and health rules. The failed revision is remembered and not tried
//! again until the spec points at a different revision.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use convoy_core::ImageRef;
use convoy_health::{HealthBoard, HealthSnapshot};
use convoy_platform::{PlatformError, ServiceReader, TaskControl, TaskSpec};
use convoy_state::{
    ContainerSpec, Revision, ServiceSpec, ServiceState, StateError, StateStore, TaskHealth,
    TaskId, epoch_secs,
};

use crate::planner::{self, Action, Plan};
use crate::strategy::{Bounds, RollingConfig};

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Current phase of a service's rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutPhase {
    /// No image deployed yet, or not reconciled yet.
    Pending,
    /// Converging toward the spec revision.
    InProgress,
    /// Actual state matches the spec.
    SteadyState,
    /// Converging back to the last steady revision.
    RollingBack { reason: String },
    /// Back on the last steady revision.
    RolledBack { reason: String },
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutPhase::SteadyState | RolloutPhase::RolledBack { .. })
    }
}

/// Snapshot published after every tick. Counts come from one health board
/// ingestion, so they are never torn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub service_id: String,
    pub phase: RolloutPhase,
    /// Revision the spec asks for.
    pub spec_revision: Revision,
    /// Revision the controller is converging toward.
    pub serving_revision: Option<Revision>,
    pub stable_revision: Option<Revision>,
    pub failed_revision: Option<Revision>,
    pub bounds: Bounds,
    pub running: u32,
    pub healthy: u32,
    /// Health-check failures of the current rollout.
    pub failures: u32,
}

impl RolloutStatus {
    fn pending(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            phase: RolloutPhase::Pending,
            spec_revision: 0,
            serving_revision: None,
            stable_revision: None,
            failed_revision: None,
            bounds: Bounds::drained(),
            running: 0,
            healthy: 0,
            failures: 0,
        }
    }
}

pub struct RolloutController {
    service_id: String,
    state: StateStore,
    reader: Arc<dyn ServiceReader>,
    tasks: Arc<dyn TaskControl>,
    config: RollingConfig,
    board: HealthBoard,
    phase: RolloutPhase,
    seen_revision: Option<Revision>,
    stable: Option<(Revision, ImageRef)>,
    failed_revision: Option<Revision>,
    failures: u32,
    draining_since: HashMap<TaskId, Instant>,
    status_tx: watch::Sender<RolloutStatus>,
}

impl RolloutController {
    /// Create a controller. The last steady revision and the rolled-back
    /// revision are restored from the persisted `ServiceState`.
    pub fn new(
        service_id: &str,
        state: StateStore,
        reader: Arc<dyn ServiceReader>,
        tasks: Arc<dyn TaskControl>,
        config: RollingConfig,
    ) -> Result<Self, RolloutError> {
        let observed = state.get_service_state(service_id)?;
        let failed_revision = observed.as_ref().and_then(|s| s.failed_revision);
        let stable = observed.and_then(|s| s.current_revision.zip(s.current_image));
        let phase = match failed_revision {
            Some(rev) => RolloutPhase::RollingBack {
                reason: format!("revision {rev} was rolled back before restart"),
            },
            None => RolloutPhase::Pending,
        };
        let (status_tx, _) = watch::channel(RolloutStatus::pending(service_id));
        Ok(Self {
            service_id: service_id.to_string(),
            state,
            reader,
            tasks,
            board: HealthBoard::new(config.healthy_threshold, config.unhealthy_threshold),
            config,
            phase,
            seen_revision: None,
            stable,
            failed_revision,
            failures: 0,
            draining_since: HashMap::new(),
            status_tx,
        })
    }

    /// Watch the controller's status.
    pub fn subscribe(&self) -> watch::Receiver<RolloutStatus> {
        self.status_tx.subscribe()
    }

    pub fn phase(&self) -> &RolloutPhase {
        &self.phase
    }

    fn stable_revision(&self) -> Option<Revision> {
        self.stable.as_ref().map(|(rev, _)| *rev)
    }

    /// The revision to serve, its image, and the bounds to honor.
    fn target(&self, spec: &ServiceSpec, image: &ImageRef) -> (Option<(Revision, ImageRef)>, Bounds) {
        if self.failed_revision == Some(spec.revision) {
            match &self.stable {
                Some(stable) => (Some(stable.clone()), Bounds::of(spec)),
                None => (None, Bounds::drained()),
            }
        } else {
            (Some((spec.revision, image.clone())), Bounds::of(spec))
        }
    }

    /// Run one reconcile tick.
    pub async fn reconcile_once(&mut self) -> Result<RolloutStatus, RolloutError> {
        let spec = match self.state.get_service_spec(&self.service_id)? {
            Some(spec) => spec,
            None => {
                debug!(service = %self.service_id, "no spec yet");
                return Ok(self.publish(RolloutStatus::pending(&self.service_id)));
            }
        };
        let image = match &spec.image {
            Some(image) => image.clone(),
            None => {
                debug!(service = %self.service_id, "spec has no image yet");
                return Ok(self.publish(RolloutStatus::pending(&self.service_id)));
            }
        };

        if self.seen_revision != Some(spec.revision) {
            if self.seen_revision.is_some() && self.stable_revision() != Some(spec.revision) {
                info!(
                    service = %self.service_id,
                    revision = spec.revision,
                    %image,
                    "rollout started"
                );
                self.phase = RolloutPhase::InProgress;
            }
            self.seen_revision = Some(spec.revision);
            self.failures = 0;
        }

        for task in self.board.expire_starting(self.config.health_timeout) {
            warn!(
                service = %self.service_id,
                task = %task,
                timeout = ?self.config.health_timeout,
                "task did not become healthy in time"
            );
        }
        let description = self.reader.describe_service(&self.service_id).await?;
        let snapshot = self.board.ingest(&description.tasks);

        let (mut target, mut bounds) = self.target(&spec, &image);
        let mut plan = planner::plan(&snapshot.tasks, target.as_ref().map(|(r, _)| *r), bounds);

        let rolling_out_new = self.failed_revision != Some(spec.revision)
            && self.stable_revision() != Some(spec.revision);
        if rolling_out_new && !plan.failed_target_tasks.is_empty() {
            self.failures += plan.failed_target_tasks.len() as u32;
            warn!(
                service = %self.service_id,
                revision = spec.revision,
                failures = self.failures,
                budget = self.config.retry_budget,
                "new task failed health checks"
            );
            if self.failures > self.config.retry_budget {
                let reason = format!(
                    "revision {} failed health checks {} time(s), retry budget {}",
                    spec.revision, self.failures, self.config.retry_budget
                );
                warn!(
                    service = %self.service_id,
                    revision = spec.revision,
                    stable = ?self.stable_revision(),
                    %reason,
                    "rolling back"
                );
                self.failed_revision = Some(spec.revision);
                self.phase = RolloutPhase::RollingBack { reason };
                (target, bounds) = self.target(&spec, &image);
                plan = planner::plan(&snapshot.tasks, target.as_ref().map(|(r, _)| *r), bounds);
            }
        }

        let serving_revision = target.as_ref().map(|(rev, _)| *rev);
        let steady = plan.converged && serving_revision.is_some();
        self.expire_draining(&snapshot).await;
        self.execute(&plan, &spec, target.as_ref()).await;
        self.advance_phase(&plan, target);

        let observed = ServiceState {
            service_id: self.service_id.clone(),
            tasks: snapshot.tasks.clone(),
            current_revision: self.stable_revision(),
            current_image: self.stable.as_ref().map(|(_, image)| image.clone()),
            failed_revision: self.failed_revision,
            steady,
            updated_at: epoch_secs(),
        };
        self.state.put_service_state(&observed)?;

        Ok(self.publish(RolloutStatus {
            service_id: self.service_id.clone(),
            phase: self.phase.clone(),
            spec_revision: spec.revision,
            serving_revision,
            stable_revision: self.stable_revision(),
            failed_revision: self.failed_revision,
            bounds,
            running: snapshot.running,
            healthy: snapshot.healthy,
            failures: self.failures,
        }))
    }

    /// Stop tasks whose drain grace has elapsed.
    async fn expire_draining(&mut self, snapshot: &HealthSnapshot) {
        let now = Instant::now();
        self.draining_since.retain(|id, _| {
            snapshot
                .tasks
                .iter()
                .any(|t| &t.id == id && t.health == TaskHealth::Draining)
        });
        for task in snapshot.tasks.iter().filter(|t| t.health == TaskHealth::Draining) {
            let since = *self.draining_since.entry(task.id.clone()).or_insert(now);
            if now.duration_since(since) < self.config.drain_grace {
                continue;
            }
            match self.tasks.stop_task(&task.id).await {
                Ok(()) => {
                    debug!(service = %self.service_id, task = %task.id, "drained task stopped");
                    self.draining_since.remove(&task.id);
                    self.board.forget(&task.id);
                }
                Err(e) => warn!(task = %task.id, error = %e, "failed to stop drained task"),
            }
        }
    }

    async fn execute(&mut self, plan: &Plan, spec: &ServiceSpec, target: Option<&(Revision, ImageRef)>) {
        for action in &plan.actions {
            match action {
                Action::Stop(id) => {
                    self.board.forget(id);
                    if let Err(e) = self.tasks.stop_task(id).await {
                        warn!(service = %self.service_id, task = %id, error = %e, "stop failed");
                    }
                }
                Action::Drain(id) => match self.tasks.drain_task(id).await {
                    Ok(()) => {
                        self.draining_since.insert(id.clone(), Instant::now());
                        debug!(service = %self.service_id, task = %id, "task draining");
                    }
                    Err(e) => warn!(service = %self.service_id, task = %id, error = %e, "drain failed"),
                },
                Action::Launch(count) => {
                    let Some((revision, image)) = target else {
                        continue;
                    };
                    let task_spec = TaskSpec {
                        service_id: self.service_id.clone(),
                        revision: *revision,
                        container: ContainerSpec {
                            image: image.clone(),
                            port: spec.port,
                            resources: spec.resources.clone(),
                        },
                    };
                    for _ in 0..*count {
                        match self.tasks.start_task(&task_spec).await {
                            Ok(id) => debug!(service = %self.service_id, task = %id, revision, "task launched"),
                            Err(e) => {
                                warn!(service = %self.service_id, revision, error = %e, "launch failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn advance_phase(&mut self, plan: &Plan, target: Option<(Revision, ImageRef)>) {
        if self.failed_revision.is_some() && self.failed_revision == self.seen_revision {
            if let (true, RolloutPhase::RollingBack { reason }) = (plan.converged, &self.phase) {
                info!(
                    service = %self.service_id,
                    stable = ?self.stable_revision(),
                    "rolled back"
                );
                self.phase = RolloutPhase::RolledBack {
                    reason: reason.clone(),
                };
            }
            return;
        }

        if plan.converged {
            if self.phase != RolloutPhase::SteadyState {
                info!(
                    service = %self.service_id,
                    revision = ?target.as_ref().map(|(r, _)| *r),
                    "steady state reached"
                );
            }
            self.phase = RolloutPhase::SteadyState;
            self.stable = target;
            self.failures = 0;
        } else if self.phase != RolloutPhase::InProgress {
            debug!(service = %self.service_id, "reconciling toward spec");
            self.phase = RolloutPhase::InProgress;
        }
    }

    fn publish(&self, status: RolloutStatus) -> RolloutStatus {
        self.status_tx.send_replace(status.clone());
        status
    }

    /// Reconcile every `poll_interval` until shutdown. Errors are logged
    /// and the loop keeps going.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            service = %self.service_id,
            interval = ?self.config.poll_interval,
            "rollout controller started"
        );

        loop {
            if let Err(e) = self.reconcile_once().await {
                error!(service = %self.service_id, error = %e, "reconcile failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!(service = %self.service_id, "rollout controller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use convoy_core::Digest;
    use convoy_core::config::ServiceConfig;
    use convoy_platform::ProbeResult;
    use convoy_platform::memory::{InMemoryPlatform, PlatformEvent, ProbePlan};

    struct Harness {
        store: StateStore,
        platform: Arc<InMemoryPlatform>,
        controller: RolloutController,
    }

    fn harness(desired: u32, config: RollingConfig) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let service = ServiceConfig {
            id: "web".to_string(),
            repository: "r/web".to_string(),
            port: 8080,
            cpu_units: 256,
            memory_mb: 512,
            desired_count: desired,
        };
        store
            .put_service_spec(&ServiceSpec::from_config(&service, 100, 200))
            .unwrap();
        let platform = Arc::new(InMemoryPlatform::new());
        let controller = RolloutController::new(
            "web",
            store.clone(),
            platform.clone(),
            platform.clone(),
            config,
        )
        .unwrap();
        Harness {
            store,
            platform,
            controller,
        }
    }

    fn fast_config() -> RollingConfig {
        RollingConfig {
            drain_grace: Duration::ZERO,
            ..RollingConfig::default()
        }
    }

    fn deploy(store: &StateStore, tag: &str) -> Revision {
        let image = ImageRef::pinned("r/web", tag, Digest::of(tag.as_bytes()));
        let (spec, _) = store
            .update_service_spec("web", |s| s.set_image(image))
            .unwrap();
        spec.revision
    }

    async fn tick_until_terminal(h: &mut Harness, max_ticks: usize) -> Vec<RolloutStatus> {
        let mut seen = Vec::new();
        for _ in 0..max_ticks {
            let status = h.controller.reconcile_once().await.unwrap();
            let terminal = status.phase.is_terminal();
            seen.push(status);
            if terminal {
                return seen;
            }
        }
        panic!("no terminal phase after {max_ticks} ticks: {:?}", seen.last());
    }

    #[tokio::test]
    async fn pending_without_image() {
        let mut h = harness(2, fast_config());
        let status = h.controller.reconcile_once().await.unwrap();
        assert_eq!(status.phase, RolloutPhase::Pending);
        assert!(h.platform.live_tasks("web").is_empty());
    }

    #[tokio::test]
    async fn first_deploy_reaches_steady_state() {
        let mut h = harness(2, fast_config());
        let rev = deploy(&h.store, "1.0.0");

        let statuses = tick_until_terminal(&mut h, 10).await;
        let last = statuses.last().unwrap();
        assert_eq!(last.phase, RolloutPhase::SteadyState);
        assert_eq!(last.stable_revision, Some(rev));
        assert_eq!(last.healthy, 2);

        let state = h.store.get_service_state("web").unwrap().unwrap();
        assert!(state.steady);
        assert_eq!(state.current_revision, Some(rev));
    }

    #[tokio::test]
    async fn rolling_update_keeps_capacity() {
        let mut h = harness(2, fast_config());
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        let rev2 = deploy(&h.store, "2.0.0");
        for _ in 0..20 {
            let status = h.controller.reconcile_once().await.unwrap();
            let live = h.platform.live_tasks("web");
            assert!(live.len() <= 4, "running {} > max_total", live.len());
            assert!(status.healthy >= 2, "healthy dipped to {}", status.healthy);
            if status.phase == RolloutPhase::SteadyState {
                assert_eq!(status.stable_revision, Some(rev2));
                assert!(live.iter().all(|(_, rev, _)| *rev == rev2));
                assert_eq!(live.len(), 2);
                return;
            }
        }
        panic!("rollout did not converge");
    }

    #[tokio::test]
    async fn failing_revision_rolls_back() {
        let mut h = harness(2, fast_config());
        let rev1 = deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        let rev2 = deploy(&h.store, "2.0.0");
        h.platform.set_probe_plan("web", rev2, ProbePlan::Failing);

        let statuses = tick_until_terminal(&mut h, 20).await;
        assert!(statuses.iter().all(|s| s.healthy >= 2));
        assert!(
            statuses
                .iter()
                .any(|s| matches!(s.phase, RolloutPhase::RollingBack { .. }))
        );
        let last = statuses.last().unwrap();
        assert!(matches!(last.phase, RolloutPhase::RolledBack { .. }));
        assert_eq!(last.failed_revision, Some(rev2));
        assert_eq!(last.stable_revision, Some(rev1));

        let live = h.platform.live_tasks("web");
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|(_, rev, _)| *rev == rev1));

        // The failed revision is not retried.
        let started_before = h.platform.events().len();
        for _ in 0..5 {
            h.controller.reconcile_once().await.unwrap();
        }
        let retried = h.platform.events()[started_before..]
            .iter()
            .any(|e| matches!(e, PlatformEvent::Started { revision, .. } if *revision == rev2));
        assert!(!retried);
    }

    async fn roll_back_revision_two(h: &mut Harness) -> (Revision, Revision) {
        let rev1 = deploy(&h.store, "1.0.0");
        tick_until_terminal(h, 10).await;
        let rev2 = deploy(&h.store, "2.0.0");
        h.platform.set_probe_plan("web", rev2, ProbePlan::Failing);
        let statuses = tick_until_terminal(h, 20).await;
        assert!(matches!(statuses.last().unwrap().phase, RolloutPhase::RolledBack { .. }));
        (rev1, rev2)
    }

    #[tokio::test]
    async fn failed_revision_survives_restart() {
        let mut h = harness(2, fast_config());
        let (rev1, rev2) = roll_back_revision_two(&mut h).await;
        let persisted = h.store.get_service_state("web").unwrap().unwrap();
        assert_eq!(persisted.failed_revision, Some(rev2));

        let mut restarted = RolloutController::new(
            "web",
            h.store.clone(),
            h.platform.clone(),
            h.platform.clone(),
            fast_config(),
        )
        .unwrap();
        let started_before = h.platform.events().len();
        let mut last = None;
        for _ in 0..10 {
            last = Some(restarted.reconcile_once().await.unwrap());
        }
        let last = last.unwrap();
        assert!(matches!(last.phase, RolloutPhase::RolledBack { .. }), "{:?}", last.phase);
        assert_eq!(last.failed_revision, Some(rev2));
        assert_eq!(last.stable_revision, Some(rev1));

        let relaunched = h.platform.events()[started_before..]
            .iter()
            .any(|e| matches!(e, PlatformEvent::Started { revision, .. } if *revision == rev2));
        assert!(!relaunched);
        let live = h.platform.live_tasks("web");
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|(_, rev, _)| *rev == rev1));
    }

    #[tokio::test]
    async fn rolled_back_service_reports_steady_after_scaling() {
        let mut h = harness(2, fast_config());
        let (rev1, _) = roll_back_revision_two(&mut h).await;
        assert!(h.store.get_service_state("web").unwrap().unwrap().steady);

        h.store
            .update_service_spec("web", |s| s.desired_count = 3)
            .unwrap();
        let status = h.controller.reconcile_once().await.unwrap();
        assert!(matches!(status.phase, RolloutPhase::RolledBack { .. }));
        assert!(!h.store.get_service_state("web").unwrap().unwrap().steady);

        for _ in 0..10 {
            h.controller.reconcile_once().await.unwrap();
            if h.store.get_service_state("web").unwrap().unwrap().steady {
                let live = h.platform.live_tasks("web");
                assert_eq!(live.len(), 3);
                assert!(live.iter().all(|(_, rev, _)| *rev == rev1));
                return;
            }
        }
        panic!("stable revision never reported steady after scaling");
    }

    #[tokio::test]
    async fn retry_budget_tolerates_failures() {
        let config = RollingConfig {
            retry_budget: 1,
            ..fast_config()
        };
        let mut h = harness(1, config);
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        let rev2 = deploy(&h.store, "2.0.0");
        h.platform.set_probe_plan("web", rev2, ProbePlan::Failing);
        let mut tolerated = false;
        for _ in 0..10 {
            let status = h.controller.reconcile_once().await.unwrap();
            if status.failures == 1 {
                assert_eq!(status.phase, RolloutPhase::InProgress);
                tolerated = true;
                break;
            }
        }
        assert!(tolerated);

        // The replacement task passes.
        h.platform.set_probe_plan("web", rev2, ProbePlan::Healthy);
        let statuses = tick_until_terminal(&mut h, 20).await;
        let last = statuses.last().unwrap();
        assert_eq!(last.phase, RolloutPhase::SteadyState);
        assert_eq!(last.stable_revision, Some(rev2));
        assert_eq!(last.failures, 0);
    }

    #[tokio::test]
    async fn first_deploy_failure_drains_everything() {
        let mut h = harness(2, fast_config());
        let rev = deploy(&h.store, "1.0.0");
        h.platform.set_probe_plan("web", rev, ProbePlan::Failing);

        let statuses = tick_until_terminal(&mut h, 20).await;
        let last = statuses.last().unwrap();
        assert!(matches!(last.phase, RolloutPhase::RolledBack { .. }));
        assert_eq!(last.stable_revision, None);
        assert!(h.platform.live_tasks("web").is_empty());
    }

    #[tokio::test]
    async fn desired_count_change_is_reconciled() {
        let mut h = harness(2, fast_config());
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        h.store
            .update_service_spec("web", |s| s.desired_count = 3)
            .unwrap();
        let statuses = tick_until_terminal(&mut h, 10).await;
        assert_eq!(statuses.last().unwrap().phase, RolloutPhase::SteadyState);
        assert_eq!(h.platform.live_tasks("web").len(), 3);

        h.store
            .update_service_spec("web", |s| s.desired_count = 1)
            .unwrap();
        tick_until_terminal(&mut h, 10).await;
        assert_eq!(h.platform.live_tasks("web").len(), 1);
    }

    /// Tick until steady state, checking the bounds in force at every tick.
    /// Returns the number of live tasks at the end.
    async fn tick_within_bounds(h: &mut Harness, mut peak_healthy: u32) -> usize {
        let mut prev_live = h.platform.live_tasks("web").len();
        for _ in 0..30 {
            let status = h.controller.reconcile_once().await.unwrap();
            let live = h.platform.live_tasks("web").len();
            let bounds = status.bounds;
            assert!(
                live <= prev_live.max(bounds.max_total as usize),
                "running grew to {live} above max_total {}",
                bounds.max_total
            );
            assert!(
                status.healthy >= bounds.min_healthy.min(peak_healthy),
                "healthy dipped to {} (min_healthy {})",
                status.healthy,
                bounds.min_healthy
            );
            peak_healthy = peak_healthy.max(status.healthy);
            prev_live = live;
            if status.phase == RolloutPhase::SteadyState {
                return live;
            }
        }
        panic!("rollout did not converge after a desired count change");
    }

    #[tokio::test]
    async fn scale_out_during_rollout_extends_target() {
        let mut h = harness(2, fast_config());
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        let rev2 = deploy(&h.store, "2.0.0");
        let mut healthy = 0;
        for _ in 0..2 {
            let status = h.controller.reconcile_once().await.unwrap();
            assert_eq!(status.phase, RolloutPhase::InProgress);
            assert!(status.healthy >= 2);
            healthy = status.healthy;
        }

        h.store
            .update_service_spec("web", |s| s.desired_count = 4)
            .unwrap();
        assert_eq!(tick_within_bounds(&mut h, healthy).await, 4);
        let live = h.platform.live_tasks("web");
        assert!(live.iter().all(|(_, rev, _)| *rev == rev2));
        let state = h.store.get_service_state("web").unwrap().unwrap();
        assert_eq!(state.current_revision, Some(rev2));
    }

    #[tokio::test]
    async fn scale_in_during_rollout_shrinks_target() {
        let mut h = harness(4, fast_config());
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        let rev2 = deploy(&h.store, "2.0.0");
        let mut healthy = 0;
        for _ in 0..2 {
            let status = h.controller.reconcile_once().await.unwrap();
            assert_eq!(status.phase, RolloutPhase::InProgress);
            assert!(status.healthy >= 4);
            healthy = status.healthy;
        }

        h.store
            .update_service_spec("web", |s| s.desired_count = 2)
            .unwrap();
        assert_eq!(tick_within_bounds(&mut h, healthy).await, 2);
        let live = h.platform.live_tasks("web");
        assert!(live.iter().all(|(_, rev, _)| *rev == rev2));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_starting_task_counts_as_failure() {
        let config = RollingConfig {
            health_timeout: Duration::from_secs(60),
            ..fast_config()
        };
        let mut h = harness(1, config);
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;

        let rev2 = deploy(&h.store, "2.0.0");
        // Alternating results never reach either threshold.
        let flapping = [ProbeResult::Failed, ProbeResult::Healthy]
            .into_iter()
            .cycle()
            .take(200)
            .collect();
        h.platform
            .set_probe_plan("web", rev2, ProbePlan::Script(flapping));

        for _ in 0..30 {
            let status = h.controller.reconcile_once().await.unwrap();
            if matches!(status.phase, RolloutPhase::RolledBack { .. }) {
                assert_eq!(status.failed_revision, Some(rev2));
                return;
            }
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        panic!("stuck task never timed out");
    }

    #[tokio::test(start_paused = true)]
    async fn drained_tasks_stop_after_grace() {
        let config = RollingConfig {
            drain_grace: Duration::from_secs(30),
            ..RollingConfig::default()
        };
        let mut h = harness(1, config);
        deploy(&h.store, "1.0.0");
        tick_until_terminal(&mut h, 10).await;
        deploy(&h.store, "2.0.0");

        let mut drained_at = None;
        for _ in 0..40 {
            h.controller.reconcile_once().await.unwrap();
            let draining = h
                .platform
                .live_tasks("web")
                .iter()
                .any(|(_, _, l)| *l == convoy_platform::TaskLifecycle::Draining);
            match (draining, drained_at) {
                (true, None) => drained_at = Some(Instant::now()),
                (false, Some(at)) => {
                    assert!(Instant::now().duration_since(at) >= Duration::from_secs(30));
                    return;
                }
                _ => {}
            }
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        panic!("drained task never stopped");
    }
}
