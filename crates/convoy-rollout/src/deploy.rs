//! Deploy requests — the hand-off from a pipeline run to the controller.
//!
//! A request points the service spec at a digest-pinned image. The platform
//! must accept the new spec before it is committed to the store, so a
//! rejected request leaves the previous revision untouched. Requests are
//! idempotent by digest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use convoy_core::ImageRef;
use convoy_platform::{PlatformError, SpecWriter};
use convoy_state::{Revision, RolloutOutcome, StateError, StateStore};

use crate::controller::{RolloutPhase, RolloutStatus};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("platform rejected spec: {0}")]
    Platform(#[from] PlatformError),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("image {0} is not pinned to a digest")]
    Unpinned(String),

    #[error("revision {revision} did not settle within {timeout:?}")]
    Timeout { revision: Revision, timeout: Duration },

    #[error("rollout controller for {0} stopped")]
    ControllerGone(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTicket {
    pub service_id: String,
    pub revision: Revision,
    /// False when the spec already pointed at this digest.
    pub changed: bool,
}

pub struct Deployer {
    state: StateStore,
    spec_writer: Arc<dyn SpecWriter>,
    rollouts: HashMap<String, watch::Receiver<RolloutStatus>>,
}

impl Deployer {
    pub fn new(state: StateStore, spec_writer: Arc<dyn SpecWriter>) -> Self {
        Self {
            state,
            spec_writer,
            rollouts: HashMap::new(),
        }
    }

    /// Register the status channel of a service's controller.
    pub fn with_rollout(mut self, service_id: &str, status: watch::Receiver<RolloutStatus>) -> Self {
        self.rollouts.insert(service_id.to_string(), status);
        self
    }

    /// Point a service at `image`.
    pub async fn request(&self, service_id: &str, image: &ImageRef) -> Result<DeployTicket, DeployError> {
        if !image.is_pinned() {
            return Err(DeployError::Unpinned(image.to_string()));
        }
        let mut candidate = self
            .state
            .get_service_spec(service_id)?
            .ok_or_else(|| DeployError::UnknownService(service_id.to_string()))?;
        if !candidate.set_image(image.clone()) {
            return Ok(DeployTicket {
                service_id: service_id.to_string(),
                revision: candidate.revision,
                changed: false,
            });
        }

        self.spec_writer.update_service_spec(&candidate).await?;
        let (spec, changed) = self
            .state
            .update_service_spec(service_id, |s| s.set_image(image.clone()))?;
        info!(
            service = %service_id,
            revision = spec.revision,
            %image,
            "deploy requested"
        );
        Ok(DeployTicket {
            service_id: service_id.to_string(),
            revision: spec.revision,
            changed,
        })
    }

    /// Wait until the controller settles the ticket's revision.
    pub async fn wait_outcome(
        &self,
        ticket: &DeployTicket,
        timeout: Duration,
    ) -> Result<RolloutOutcome, DeployError> {
        let mut status = self
            .rollouts
            .get(&ticket.service_id)
            .cloned()
            .ok_or_else(|| DeployError::UnknownService(ticket.service_id.clone()))?;

        let wait = async {
            loop {
                if let Some(outcome) = outcome_for(&status.borrow_and_update(), ticket.revision) {
                    return Ok(outcome);
                }
                if status.changed().await.is_err() {
                    return Err(DeployError::ControllerGone(ticket.service_id.clone()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DeployError::Timeout {
                revision: ticket.revision,
                timeout,
            })?
    }
}

/// Terminal outcome of `revision`, if the status shows one.
pub fn outcome_for(status: &RolloutStatus, revision: Revision) -> Option<RolloutOutcome> {
    match &status.phase {
        RolloutPhase::RolledBack { .. } if status.failed_revision == Some(revision) => {
            Some(RolloutOutcome::RolledBack)
        }
        RolloutPhase::SteadyState
            if status.spec_revision == revision && status.stable_revision == Some(revision) =>
        {
            Some(RolloutOutcome::SteadyState)
        }
        _ => None,
    }
}
