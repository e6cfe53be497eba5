//! Capability traits for external collaborators.

use async_trait::async_trait;

use convoy_core::{Digest, ImageRef};
use convoy_state::{PublishedRef, ScanReport, SecurityRule, ServiceSpec, TaskId, TriggerEvent};

use crate::error::{BuildError, PlatformError, RegistryError, ScanError};
use crate::types::{BuiltImage, ServiceDescription, TaskSpec};

/// Produces a versioned image from source.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `trigger` into an image destined for `repository`.
    async fn build(&self, trigger: &TriggerEvent, repository: &str)
    -> Result<BuiltImage, BuildError>;
}

/// Content-addressed image registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn push(
        &self,
        repository: &str,
        tag: &str,
        digest: &Digest,
        blob: &[u8],
    ) -> Result<PublishedRef, RegistryError>;

    async fn exists(&self, digest: &Digest) -> Result<bool, RegistryError>;
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, image: &ImageRef) -> Result<ScanReport, ScanError>;
}

/// Read-only view of running tasks. Polled by the rollout controller.
#[async_trait]
pub trait ServiceReader: Send + Sync {
    async fn describe_service(&self, service_id: &str)
    -> Result<ServiceDescription, PlatformError>;
}

#[async_trait]
pub trait TaskControl: Send + Sync {
    async fn start_task(&self, spec: &TaskSpec) -> Result<TaskId, PlatformError>;

    /// Stop routing new traffic to the task; in-flight requests continue.
    async fn drain_task(&self, task_id: &str) -> Result<(), PlatformError>;

    async fn stop_task(&self, task_id: &str) -> Result<(), PlatformError>;
}

/// Registers the desired spec (task definition) with the platform.
#[async_trait]
pub trait SpecWriter: Send + Sync {
    async fn update_service_spec(&self, spec: &ServiceSpec) -> Result<(), PlatformError>;
}

/// Applies a security group. Implementations must swap the whole rule set
/// at once.
#[async_trait]
pub trait FirewallControl: Send + Sync {
    async fn replace_rules(
        &self,
        service_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), PlatformError>;
}
