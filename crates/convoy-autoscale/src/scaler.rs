//! Autoscaler — target tracking over `ServiceSpec.desired_count`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use convoy_state::{ScalingPolicy, StateStore};

use crate::metrics::MetricSource;

/// A scaling decision for a single service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Set the desired count to this value.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Target-tracking decision for one observation.
///
/// `cooling_down` suppresses actions but never the clamp of an
/// out-of-bounds desired count.
pub fn decide(
    policy: &ScalingPolicy,
    desired: u32,
    observed: f64,
    cooling_down: bool,
) -> ScaleDecision {
    let clamped = policy.clamp(desired);
    if clamped != desired {
        return ScaleDecision::ScaleTo(clamped);
    }
    if cooling_down || policy.target_value <= 0.0 || !observed.is_finite() {
        return ScaleDecision::NoChange;
    }

    let ratio = observed / policy.target_value;
    let proposed = (desired as f64 * ratio).ceil().max(0.0) as u32;
    let max_step = policy.max_step.max(1);

    let next = if ratio > 1.0 + policy.dead_band {
        desired + proposed.saturating_sub(desired).clamp(1, max_step)
    } else if ratio < 1.0 - policy.dead_band {
        desired - desired.saturating_sub(proposed).clamp(1, max_step).min(desired)
    } else {
        return ScaleDecision::NoChange;
    };

    let next = policy.clamp(next);
    if next == desired {
        ScaleDecision::NoChange
    } else {
        ScaleDecision::ScaleTo(next)
    }
}

/// Evaluates metrics and adjusts desired counts. Cooldowns are tracked per
/// service.
pub struct Autoscaler {
    state: StateStore,
    source: Arc<dyn MetricSource>,
    /// Last scaling action per service.
    last_action: HashMap<String, Instant>,
}

impl Autoscaler {
    pub fn new(state: StateStore, source: Arc<dyn MetricSource>) -> Self {
        Self {
            state,
            source,
            last_action: HashMap::new(),
        }
    }

    fn cooling_down(&self, service_id: &str, cooldown: Duration) -> bool {
        self.last_action
            .get(service_id)
            .is_some_and(|at| at.elapsed() < cooldown)
    }

    /// Evaluate one service and apply the decision.
    pub async fn evaluate_service(&mut self, service_id: &str) -> anyhow::Result<ScaleDecision> {
        let Some(policy) = self.state.get_scaling_policy(service_id)? else {
            return Ok(ScaleDecision::NoChange);
        };
        let Some(sample) = self.source.latest(service_id).await? else {
            debug!(service = %service_id, "no metrics yet");
            return Ok(ScaleDecision::NoChange);
        };
        let observed = sample.value(policy.metric);
        let cooling_down =
            self.cooling_down(service_id, Duration::from_secs(policy.cooldown_secs));

        // Decide against the desired count read inside the write
        // transaction so a concurrent deploy is never overwritten.
        let (spec, (previous, decision)) = self.state.update_service_spec(service_id, |spec| {
            let previous = spec.desired_count;
            let decision = decide(&policy, previous, observed, cooling_down);
            if let ScaleDecision::ScaleTo(n) = decision {
                spec.desired_count = n;
            }
            (previous, decision)
        })?;

        match decision {
            ScaleDecision::ScaleTo(n) if policy.clamp(previous) != previous => {
                warn!(
                    service = %service_id,
                    desired = previous,
                    min = policy.min_capacity,
                    max = policy.max_capacity,
                    clamped = n,
                    "scaling bound violation, desired count clamped"
                );
            }
            ScaleDecision::ScaleTo(n) => {
                self.last_action.insert(service_id.to_string(), Instant::now());
                info!(
                    service = %service_id,
                    from = previous,
                    to = n,
                    observed,
                    target = policy.target_value,
                    generation = spec.generation,
                    "scaling"
                );
            }
            ScaleDecision::NoChange => {
                debug!(
                    service = %service_id,
                    desired = previous,
                    observed,
                    cooling_down,
                    "no scaling change"
                );
            }
        }
        Ok(decision)
    }

    /// Evaluate every service that has a scaling policy. A failure on one
    /// service is logged and does not stop the others.
    pub async fn evaluate_all(&mut self) -> anyhow::Result<Vec<(String, ScaleDecision)>> {
        let specs = self.state.list_service_specs()?;
        let mut decisions = Vec::new();
        for spec in &specs {
            match self.evaluate_service(&spec.id).await {
                Ok(decision) => decisions.push((spec.id.clone(), decision)),
                Err(e) => warn!(service = %spec.id, error = %e, "scaling evaluation failed"),
            }
        }
        Ok(decisions)
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval = ?interval, "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SyntheticFeed;
    use convoy_core::config::ServiceConfig;
    use convoy_state::{MetricKind, ServiceSpec};

    fn policy(min: u32, max: u32) -> ScalingPolicy {
        ScalingPolicy {
            metric: MetricKind::Cpu,
            target_value: 75.0,
            min_capacity: min,
            max_capacity: max,
            cooldown_secs: 300,
            dead_band: 0.1,
            max_step: 1,
        }
    }

    fn store_with(desired: u32, policy: &ScalingPolicy) -> StateStore {
        let state = StateStore::open_in_memory().unwrap();
        let service = ServiceConfig {
            id: "web".to_string(),
            repository: "r/web".to_string(),
            port: 8080,
            cpu_units: 256,
            memory_mb: 512,
            desired_count: desired,
        };
        state
            .put_service_spec(&ServiceSpec::from_config(&service, 100, 200))
            .unwrap();
        state.put_scaling_policy("web", policy).unwrap();
        state
    }

    fn desired(state: &StateStore) -> u32 {
        state.get_service_spec("web").unwrap().unwrap().desired_count
    }

    #[test]
    fn scale_up_by_one_step() {
        assert_eq!(decide(&policy(1, 4), 2, 95.0, false), ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn large_error_still_bounded_by_step() {
        let mut p = policy(1, 10);
        assert_eq!(decide(&p, 2, 300.0, false), ScaleDecision::ScaleTo(3));
        p.max_step = 4;
        // ceil(2 × 4) = 8, step 4 → 6.
        assert_eq!(decide(&p, 2, 300.0, false), ScaleDecision::ScaleTo(6));
    }

    #[test]
    fn scale_down_below_target() {
        assert_eq!(decide(&policy(1, 4), 3, 30.0, false), ScaleDecision::ScaleTo(2));
    }

    #[test]
    fn dead_band_holds() {
        assert_eq!(decide(&policy(1, 4), 2, 80.0, false), ScaleDecision::NoChange);
        assert_eq!(decide(&policy(1, 4), 2, 70.0, false), ScaleDecision::NoChange);
    }

    #[test]
    fn capacity_limits_hold() {
        assert_eq!(decide(&policy(1, 4), 4, 100.0, false), ScaleDecision::NoChange);
        assert_eq!(decide(&policy(1, 4), 1, 1.0, false), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldown_blocks_action_but_not_clamp() {
        assert_eq!(decide(&policy(1, 4), 2, 95.0, true), ScaleDecision::NoChange);
        assert_eq!(decide(&policy(1, 4), 7, 50.0, true), ScaleDecision::ScaleTo(4));
        assert_eq!(decide(&policy(2, 4), 0, 50.0, true), ScaleDecision::ScaleTo(2));
    }

    #[test]
    fn desired_never_leaves_bounds() {
        let p = policy(2, 6);
        let mut d = 4;
        for observed in [0.0, 500.0, 10.0, 90.0, 1e9, 0.1, 75.0, 200.0, 5.0, 5.0, 5.0, 5.0] {
            if let ScaleDecision::ScaleTo(n) = decide(&p, d, observed, false) {
                d = n;
            }
            assert!((2..=6).contains(&d), "desired {d} out of bounds");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_holds_after_action() {
        let p = policy(1, 4);
        let state = store_with(2, &p);
        let feed = Arc::new(SyntheticFeed::new("web", [95.0]));
        let mut scaler = Autoscaler::new(state.clone(), feed);

        assert_eq!(scaler.evaluate_service("web").await.unwrap(), ScaleDecision::ScaleTo(3));
        assert_eq!(desired(&state), 3);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(scaler.evaluate_service("web").await.unwrap(), ScaleDecision::NoChange);
        assert_eq!(desired(&state), 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scaler.evaluate_service("web").await.unwrap(), ScaleDecision::ScaleTo(4));
        assert_eq!(desired(&state), 4);
    }

    #[tokio::test]
    async fn missing_metrics_is_no_change() {
        let p = policy(1, 4);
        let state = store_with(2, &p);
        let feed = Arc::new(SyntheticFeed::new("web", []));
        let mut scaler = Autoscaler::new(state.clone(), feed);
        assert_eq!(scaler.evaluate_service("web").await.unwrap(), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn out_of_bounds_desired_is_clamped() {
        let p = policy(1, 4);
        let state = store_with(9, &p);
        let feed = Arc::new(SyntheticFeed::new("web", [75.0]));
        let mut scaler = Autoscaler::new(state.clone(), feed);
        assert_eq!(scaler.evaluate_service("web").await.unwrap(), ScaleDecision::ScaleTo(4));
        assert_eq!(desired(&state), 4);
    }

    #[tokio::test]
    async fn services_without_policy_are_skipped() {
        let state = StateStore::open_in_memory().unwrap();
        let feed = Arc::new(SyntheticFeed::new("web", [95.0]));
        let mut scaler = Autoscaler::new(state, feed);
        assert_eq!(scaler.evaluate_service("web").await.unwrap(), ScaleDecision::NoChange);
    }
}
