//! convoy-rollout — surge/health-gated rolling updates.
//!
//! # Components
//!
//! - **`strategy`** — rolling update parameters and task count bounds
//! - **`planner`** — pure per-tick action planning
//! - **`controller`** — polling reconcile loop and the rollout phase machine
//! - **`deploy`** — deploy requests and waiting for their outcome
//!
//! # Bounds
//!
//! ```text
//! min_healthy = ceil(desired × min_healthy_percent / 100)
//! max_total   = floor(desired × max_surge_percent / 100)
//! ```
//!
//! New tasks are launched while old ones keep serving, running tasks never
//! exceed `max_total`, and old tasks are drained only as far as the healthy
//! count stays at or above `min_healthy`. The controller always reconciles
//! toward the latest `desired_count`, so autoscaling mid-rollout extends or
//! shrinks the rollout instead of racing it.

pub mod controller;
pub mod deploy;
pub mod planner;
pub mod strategy;

pub use controller::{RolloutController, RolloutError, RolloutPhase, RolloutStatus};
pub use deploy::{DeployError, DeployTicket, Deployer, outcome_for};
pub use planner::{Action, Plan, plan};
pub use strategy::{Bounds, RollingConfig};
