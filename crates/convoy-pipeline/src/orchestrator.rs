//! Per-service lanes feeding the stage sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use convoy_state::{PipelineRun, RunId, TriggerEvent};

use crate::error::PipelineError;
use crate::stages::Pipeline;

struct Job {
    run: PipelineRun,
    done: oneshot::Sender<PipelineRun>,
}

struct ActiveRun {
    run_id: RunId,
    abort: watch::Sender<bool>,
}

struct Lane {
    queue: mpsc::UnboundedSender<Job>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    handle: JoinHandle<()>,
}

/// Handle on a submitted run.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: RunId,
    pub service_id: String,
    done: oneshot::Receiver<PipelineRun>,
}

impl RunTicket {
    /// Wait for the run to reach a terminal state.
    pub async fn finished(self) -> Result<PipelineRun, PipelineError> {
        let service_id = self.service_id;
        self.done
            .await
            .map_err(|_| PipelineError::LaneClosed(service_id))
    }
}

/// Accepts triggers and runs them one at a time per service.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    lanes: RwLock<HashMap<String, Lane>>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            lanes: RwLock::new(HashMap::new()),
        }
    }

    /// Open the lane of a service. `repository` is where its images are
    /// published. Reopening a lane waits for the old worker to finish its
    /// queue first, so a service never has two workers.
    pub async fn add_service(&self, service_id: &str, repository: &str) {
        let mut lanes = self.lanes.write().await;
        if let Some(old) = lanes.remove(service_id) {
            drop(old.queue);
            debug!(service = %service_id, "waiting for replaced pipeline lane");
            if let Err(e) = old.handle.await {
                warn!(service = %service_id, error = %e, "pipeline lane ended abnormally");
            }
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let active = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(run_lane(
            self.pipeline.clone(),
            service_id.to_string(),
            repository.to_string(),
            rx,
            active.clone(),
        ));
        lanes.insert(
            service_id.to_string(),
            Lane {
                queue,
                active,
                handle,
            },
        );
        info!(service = %service_id, %repository, "pipeline lane opened");
    }

    /// Queue a run for a "new revision available" trigger.
    pub async fn submit(
        &self,
        service_id: &str,
        trigger: TriggerEvent,
    ) -> Result<RunTicket, PipelineError> {
        let lanes = self.lanes.read().await;
        let lane = lanes
            .get(service_id)
            .ok_or_else(|| PipelineError::UnknownService(service_id.to_string()))?;

        let run = PipelineRun::new(service_id, trigger);
        self.pipeline.state().put_pipeline_run(&run)?;
        let run_id = run.id.clone();

        let (done, done_rx) = oneshot::channel();
        lane.queue
            .send(Job { run, done })
            .map_err(|_| PipelineError::LaneClosed(service_id.to_string()))?;
        debug!(service = %service_id, run = %run_id, "run queued");

        Ok(RunTicket {
            run_id,
            service_id: service_id.to_string(),
            done: done_rx,
        })
    }

    /// Abort the run in progress for a service, returning its id. Queued
    /// runs are not affected.
    pub async fn abort(&self, service_id: &str) -> Option<RunId> {
        let lanes = self.lanes.read().await;
        let lane = lanes.get(service_id)?;
        let active = lane.active.lock().unwrap_or_else(|e| e.into_inner());
        let run = active.as_ref()?;
        run.abort.send_replace(true);
        info!(service = %service_id, run = %run.run_id, "abort requested");
        Some(run.run_id.clone())
    }

    /// Id of the run in progress for a service.
    pub async fn active_run(&self, service_id: &str) -> Option<RunId> {
        let lanes = self.lanes.read().await;
        let lane = lanes.get(service_id)?;
        let active = lane.active.lock().unwrap_or_else(|e| e.into_inner());
        active.as_ref().map(|run| run.run_id.clone())
    }

    /// Services with an open lane.
    pub async fn services(&self) -> Vec<String> {
        let lanes = self.lanes.read().await;
        let mut ids: Vec<String> = lanes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every lane: queued runs still execute, runs that have not
    /// reached Publish are aborted.
    pub async fn shutdown(&self) {
        let lanes: Vec<(String, Lane)> = self.lanes.write().await.drain().collect();
        for (service_id, lane) in lanes {
            drop(lane.queue);
            if let Some(run) = lane
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
            {
                run.abort.send_replace(true);
            }
            if let Err(e) = lane.handle.await {
                warn!(service = %service_id, error = %e, "pipeline lane ended abnormally");
            }
        }
        info!("pipeline lanes closed");
    }
}

async fn run_lane(
    pipeline: Arc<Pipeline>,
    service_id: String,
    repository: String,
    mut queue: mpsc::UnboundedReceiver<Job>,
    active: Arc<Mutex<Option<ActiveRun>>>,
) {
    while let Some(Job { run, done }) = queue.recv().await {
        let (abort, abort_rx) = watch::channel(false);
        *active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveRun {
            run_id: run.id.clone(),
            abort,
        });

        let finished = pipeline.execute(run, &repository, abort_rx).await;

        active.lock().unwrap_or_else(|e| e.into_inner()).take();
        // The submitter may have stopped waiting.
        let _ = done.send(finished);
    }
    debug!(service = %service_id, "pipeline lane drained");
}
