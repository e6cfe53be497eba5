//! Idempotent image publisher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use convoy_core::RetryPolicy;
use convoy_platform::{Registry, RegistryError};
use convoy_state::{ImageArtifact, PublishedRef, StateError, StateStore};

/// Mutable alias pushed alongside every version tag.
pub const LATEST_TAG: &str = "latest";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("push rejected: {0}")]
    Rejected(String),

    #[error("push failed after {attempts} attempt(s): {reason}")]
    PushFailed { attempts: u32, reason: String },

    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub struct Publisher {
    registry: Arc<dyn Registry>,
    state: StateStore,
    retry: RetryPolicy,
    push_timeout: Duration,
}

impl Publisher {
    pub fn new(
        registry: Arc<dyn Registry>,
        state: StateStore,
        retry: RetryPolicy,
        push_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            state,
            retry,
            push_timeout,
        }
    }

    /// Publish an artifact. The blob must hash to `artifact.digest`.
    pub async fn publish(
        &self,
        artifact: &ImageArtifact,
        blob: &[u8],
    ) -> Result<PublishedRef, PublishError> {
        let digest = &artifact.digest;

        if let Some(published) = self.state.get_published(digest)? {
            debug!(digest = %digest.short(), tag = %published.tag, "digest already published");
            return Ok(published);
        }

        let exists = self
            .with_retry("exists", || self.registry.exists(digest))
            .await?;

        let published = if exists {
            debug!(digest = %digest.short(), "registry already holds digest, skipping push");
            PublishedRef {
                repository: artifact.repository.clone(),
                tag: artifact.tag.clone(),
                digest: digest.clone(),
            }
        } else {
            let published = self
                .with_retry("push", || {
                    self.registry
                        .push(&artifact.repository, &artifact.tag, digest, blob)
                })
                .await?;
            if artifact.tag != LATEST_TAG {
                self.with_retry("push latest", || {
                    self.registry
                        .push(&artifact.repository, LATEST_TAG, digest, blob)
                })
                .await?;
            }
            published
        };

        self.state.put_published(&published)?;
        info!(
            repository = %published.repository,
            tag = %published.tag,
            digest = %digest.short(),
            "image published"
        );
        Ok(published)
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reason = match tokio::time::timeout(self.push_timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(RegistryError::Rejected(reason))) => {
                    warn!(op, %reason, "registry rejected request");
                    return Err(PublishError::Rejected(reason));
                }
                Ok(Err(RegistryError::Network(reason))) => reason,
                Err(_) => format!("timed out after {:?}", self.push_timeout),
            };

            if !self.retry.should_retry(attempt) {
                warn!(op, attempt, %reason, "registry unreachable, giving up");
                return Err(PublishError::PushFailed {
                    attempts: attempt,
                    reason,
                });
            }
            let delay = self.retry.delay_after(attempt);
            warn!(op, attempt, ?delay, %reason, "registry error, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
