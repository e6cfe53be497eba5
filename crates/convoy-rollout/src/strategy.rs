//! Rolling update parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use convoy_core::{ConfigError, ConvoyConfig};
use convoy_state::ServiceSpec;

/// Configuration for surge/health-gated rolling updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingConfig {
    /// Consecutive probe successes before a starting task is healthy.
    pub healthy_threshold: u32,
    /// Consecutive probe failures before a task is unhealthy.
    pub unhealthy_threshold: u32,
    /// Unhealthy new-revision tasks tolerated before rolling back.
    pub retry_budget: u32,
    /// Time a draining task gets to finish in-flight requests.
    pub drain_grace: Duration,
    /// Time a new task may stay starting before it counts as failed.
    pub health_timeout: Duration,
    /// Interval between `describe_service` polls.
    pub poll_interval: Duration,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            retry_budget: 0,
            drain_grace: Duration::from_secs(30),
            health_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl RollingConfig {
    pub fn from_config(cfg: &ConvoyConfig) -> Result<Self, ConfigError> {
        let (drain_grace, health_timeout, poll_interval) = cfg.rollout_timings()?;
        Ok(Self {
            healthy_threshold: cfg.rollout.healthy_threshold,
            unhealthy_threshold: cfg.rollout.unhealthy_threshold,
            retry_budget: cfg.rollout.retry_budget,
            drain_grace,
            health_timeout,
            poll_interval,
        })
    }
}

/// Task count bounds derived from a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub desired: u32,
    /// Healthy tasks that must remain at all times.
    pub min_healthy: u32,
    /// Running tasks allowed at once, draining ones included.
    pub max_total: u32,
}

impl Bounds {
    pub fn of(spec: &ServiceSpec) -> Self {
        Self {
            desired: spec.desired_count,
            min_healthy: spec.min_healthy(),
            max_total: spec.max_total(),
        }
    }

    /// Bounds used when no revision may serve.
    pub fn drained() -> Self {
        Self {
            desired: 0,
            min_healthy: 0,
            max_total: 0,
        }
    }
}
