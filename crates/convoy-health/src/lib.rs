//! convoy-health — health evaluation for rollout decisions.
//!
//! The load balancer probes tasks and the platform reports the latest
//! probe of each task. This crate turns that stream into task health:
//!
//! ```text
//! HealthBoard (one per service, behind a mutex)
//!   ├── HealthTracker per task (consecutive successes / failures)
//!   ├── probe seq dedup (a report is counted once)
//!   └── HealthSnapshot: task records + running/healthy totals
//! ```
//!
//! A starting task becomes `Healthy` after `healthy_threshold` consecutive
//! successes and `Unhealthy` after `unhealthy_threshold` consecutive
//! failures. A healthy task that keeps failing drops back to `Unhealthy`.

pub mod board;
pub mod tracker;

pub use board::{HealthBoard, HealthSnapshot};
pub use tracker::HealthTracker;
