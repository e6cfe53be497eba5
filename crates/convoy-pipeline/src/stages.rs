//! The stage sequence of one pipeline run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use convoy_core::Digest;
use convoy_gate::{GateDecision, GatePolicy, VulnerabilityGate, evaluate};
use convoy_platform::ImageBuilder;
use convoy_registry::Publisher;
use convoy_rollout::Deployer;
use convoy_state::{
    PipelineRun, RolloutOutcome, RunResult, Stage, StageState, StateError, StateStore,
};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub build: Duration,
    /// How long to wait for the rollout to settle after the hand-off.
    pub rollout: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(15 * 60),
            rollout: Duration::from_secs(30 * 60),
        }
    }
}

/// The collaborators a run needs, one per stage.
pub struct Pipeline {
    state: StateStore,
    builder: Arc<dyn ImageBuilder>,
    gate: VulnerabilityGate,
    policy: GatePolicy,
    publisher: Publisher,
    deployer: Deployer,
    timeouts: StageTimeouts,
}

impl Pipeline {
    pub fn new(
        state: StateStore,
        builder: Arc<dyn ImageBuilder>,
        gate: VulnerabilityGate,
        policy: GatePolicy,
        publisher: Publisher,
        deployer: Deployer,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            state,
            builder,
            gate,
            policy,
            publisher,
            deployer,
            timeouts,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Audit writes never fail a run; a lost record is logged.
    fn save(&self, run: &PipelineRun) {
        if let Err(e) = self.state.put_pipeline_run(run) {
            warn!(run = %run.id, service = %run.service_id, error = %e, "failed to record pipeline run");
        }
    }

    /// Execute a run to a terminal state.
    pub async fn execute(
        &self,
        mut run: PipelineRun,
        repository: &str,
        mut abort: watch::Receiver<bool>,
    ) -> PipelineRun {
        info!(
            run = %run.id,
            service = %run.service_id,
            reference = %run.trigger.reference,
            "pipeline run started"
        );

        match self.drive(&mut run, repository, &mut abort).await {
            Ok(()) => {
                run.finish(RunResult::Success, None);
                info!(
                    run = %run.id,
                    service = %run.service_id,
                    outcome = ?run.rollout_outcome,
                    "pipeline run succeeded"
                );
            }
            Err(e) => {
                let message = e.to_string();
                let running = run
                    .stages
                    .iter()
                    .find(|s| s.state == StageState::Running)
                    .map(|s| s.stage);
                if let Some(stage) = running {
                    run.end_stage(stage, StageState::Failed, Some(message.clone()));
                }
                let result = match e {
                    PipelineError::Aborted => RunResult::Aborted,
                    _ => RunResult::Failed,
                };
                warn!(
                    run = %run.id,
                    service = %run.service_id,
                    stage = ?running,
                    error = %message,
                    "pipeline run {}",
                    if result == RunResult::Aborted { "aborted" } else { "failed" }
                );
                run.finish(result, Some(message));
            }
        }
        self.save(&run);
        run
    }

    fn begin(&self, run: &mut PipelineRun, stage: Stage) {
        run.begin_stage(stage);
        self.save(run);
        debug!(run = %run.id, %stage, "stage started");
    }

    fn succeed(&self, run: &mut PipelineRun, stage: Stage, message: String) {
        run.end_stage(stage, StageState::Succeeded, Some(message));
        self.save(run);
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        repository: &str,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        // Build
        self.begin(run, Stage::Build);
        let build_timeout = self.timeouts.build;
        let trigger = run.trigger.clone();
        let built = abortable(abort, async {
            tokio::time::timeout(build_timeout, self.builder.build(&trigger, repository))
                .await
                .map_err(|_| PipelineError::StageTimeout {
                    stage: Stage::Build,
                    timeout: build_timeout,
                })?
                .map_err(|e| PipelineError::BuildFailed(e.to_string()))
        })
        .await?;
        let actual = Digest::of(&built.blob);
        if actual != built.artifact.digest {
            return Err(PipelineError::BuildFailed(format!(
                "builder reported digest {} but image hashes to {}",
                built.artifact.digest, actual
            )));
        }
        let artifact = built.artifact;
        run.artifact = Some(artifact.digest.clone());
        self.succeed(run, Stage::Build, format!("built {}", artifact.image_ref()));

        // Scan
        self.begin(run, Stage::Scan);
        let image = artifact.image_ref();
        let report = abortable(abort, async {
            self.gate.scan(&image).await.map_err(PipelineError::from)
        })
        .await?;
        match self.state.put_scan_report(&report) {
            Ok(()) => {}
            Err(StateError::Immutable(reason)) => {
                warn!(run = %run.id, digest = %report.digest.short(), %reason, "keeping earlier scan report");
            }
            Err(e) => return Err(e.into()),
        }
        self.succeed(
            run,
            Stage::Scan,
            format!("{} finding(s)", report.findings.len()),
        );

        // Evaluate
        self.begin(run, Stage::Evaluate);
        if let GateDecision::Fail { blocking } = evaluate(&report, &self.policy) {
            return Err(PipelineError::PolicyBlocked { findings: blocking });
        }
        self.succeed(run, Stage::Evaluate, "passed".to_string());

        // Publish
        self.begin(run, Stage::Publish);
        let published = abortable(abort, async {
            self.publisher
                .publish(&artifact, &built.blob)
                .await
                .map_err(PipelineError::from)
        })
        .await?;
        run.published = Some(published.clone());
        self.succeed(run, Stage::Publish, format!("published {}", published.image_ref()));

        // The reference is committed; from here the run settles the rollout.
        if *abort.borrow() {
            info!(run = %run.id, "abort requested after publish, finishing rollout");
        }

        // Rollout
        self.begin(run, Stage::Rollout);
        let ticket = self
            .deployer
            .request(&run.service_id, &published.image_ref())
            .await?;
        let outcome = self
            .deployer
            .wait_outcome(&ticket, self.timeouts.rollout)
            .await?;
        run.rollout_outcome = Some(outcome);
        match outcome {
            RolloutOutcome::SteadyState => self.succeed(
                run,
                Stage::Rollout,
                format!("revision {} serving", ticket.revision),
            ),
            RolloutOutcome::RolledBack => {
                warn!(
                    run = %run.id,
                    service = %run.service_id,
                    revision = ticket.revision,
                    "rollout rolled back, previous revision keeps serving"
                );
                run.end_stage(
                    Stage::Rollout,
                    StageState::Failed,
                    Some(format!("revision {} rolled back", ticket.revision)),
                );
                self.save(run);
            }
        }
        Ok(())
    }
}

/// Run `fut` unless the abort flag is raised first.
async fn abortable<T>(
    abort: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = aborted(abort) => Err(PipelineError::Aborted),
        result = fut => result,
    }
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            // Sender gone: nobody can abort any more.
            std::future::pending::<()>().await;
        }
    }
}
