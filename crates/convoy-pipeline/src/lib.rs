//! convoy-pipeline — the release pipeline orchestrator.
//!
//! ```text
//! trigger ─► [lane: service A] ─► Build ─► Scan ─► Evaluate ─► Publish ─► Rollout
//!        └─► [lane: service B] ─► ...
//! ```
//!
//! Stages run strictly in order and the first failure halts the run, so an
//! unscanned or rejected image is never published. Each service has one
//! lane (a queue plus a worker), so at most one run per service is in
//! progress; lanes of different services run in parallel.
//!
//! A run can be aborted until its image is published. Once Publish has
//! committed a reference the run always waits for the rollout to settle,
//! either in a steady state or rolled back.

pub mod error;
pub mod orchestrator;
pub mod stages;

pub use error::PipelineError;
pub use orchestrator::{Orchestrator, RunTicket};
pub use stages::{Pipeline, StageTimeouts};
