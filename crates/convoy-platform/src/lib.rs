//! convoy-platform — the narrow interfaces through which convoy reaches
//! the outside world.
//!
//! Each external system is split into capability traits so a consumer is
//! handed exactly the operations it may perform:
//!
//! ```text
//! ImageBuilder     build(trigger)                      → BuiltImage
//! Registry         push(repo, tag, digest, blob)       → PublishedRef
//!                  exists(digest)                      → bool
//! Scanner          scan(image)                         → ScanReport
//! ServiceReader    describe_service(id)                → ServiceDescription
//! TaskControl      start_task / drain_task / stop_task
//! SpecWriter       update_service_spec(spec)
//! FirewallControl  replace_rules(id, rules)
//! ```
//!
//! The rollout controller, for instance, holds a `ServiceReader` and a
//! `TaskControl` but can never push an image or touch firewall rules.
//!
//! The [`memory`] module provides deterministic in-process implementations
//! with failure injection, used by tests and the standalone daemon mode.

pub mod capability;
pub mod error;
pub mod memory;
pub mod types;

pub use capability::{
    FirewallControl, ImageBuilder, Registry, Scanner, ServiceReader, SpecWriter, TaskControl,
};
pub use error::{BuildError, PlatformError, RegistryError, ScanError};
pub use types::{
    BuiltImage, ProbeReport, ProbeResult, ServiceDescription, TaskLifecycle, TaskObservation,
    TaskSpec,
};
