//! Consecutive-probe health tracking for one task.

use tracing::{debug, warn};

use convoy_platform::ProbeResult;
use convoy_state::TaskHealth;

/// Tracks consecutive probe results for a single task.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    /// Current health status.
    status: TaskHealth,
    /// Consecutive failure count.
    consecutive_failures: u32,
    /// Consecutive success count.
    consecutive_successes: u32,
    /// Failures before marking unhealthy.
    unhealthy_threshold: u32,
    /// Successes before marking healthy.
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            status: TaskHealth::Starting,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    ///
    /// `Unhealthy` is sticky: the controller replaces such tasks instead of
    /// waiting for them to recover.
    pub fn record(&mut self, result: ProbeResult) -> TaskHealth {
        if self.status == TaskHealth::Unhealthy {
            return self.status;
        }

        if result.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;

            if self.consecutive_successes >= self.healthy_threshold
                && self.status != TaskHealth::Healthy
            {
                debug!(successes = self.consecutive_successes, "task passed health checks");
                self.status = TaskHealth::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            if self.consecutive_failures >= self.unhealthy_threshold {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "task marked unhealthy"
                );
                self.status = TaskHealth::Unhealthy;
            }
        }

        self.status
    }

    /// Force the task unhealthy (e.g. it never passed within the timeout).
    pub fn mark_unhealthy(&mut self) {
        self.status = TaskHealth::Unhealthy;
    }

    pub fn status(&self) -> TaskHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting() {
        let tracker = HealthTracker::new(2, 3);
        assert_eq!(tracker.status(), TaskHealth::Starting);
    }

    #[test]
    fn healthy_after_threshold_successes() {
        let mut tracker = HealthTracker::new(2, 3);
        assert_eq!(tracker.record(ProbeResult::Healthy), TaskHealth::Starting);
        assert_eq!(tracker.record(ProbeResult::Healthy), TaskHealth::Healthy);
    }

    #[test]
    fn unhealthy_after_threshold_failures() {
        let mut tracker = HealthTracker::new(2, 3);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.status(), TaskHealth::Starting);
        assert_eq!(tracker.record(ProbeResult::Failed), TaskHealth::Unhealthy);
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut tracker = HealthTracker::new(3, 3);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), TaskHealth::Starting);
    }

    #[test]
    fn healthy_task_can_become_unhealthy() {
        let mut tracker = HealthTracker::new(1, 2);
        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), TaskHealth::Healthy);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), TaskHealth::Unhealthy);
    }

    #[test]
    fn unhealthy_is_sticky() {
        let mut tracker = HealthTracker::new(1, 1);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.record(ProbeResult::Healthy), TaskHealth::Unhealthy);
    }

    #[test]
    fn zero_thresholds_act_as_one() {
        let mut tracker = HealthTracker::new(0, 0);
        assert_eq!(tracker.record(ProbeResult::Healthy), TaskHealth::Healthy);
    }
}
