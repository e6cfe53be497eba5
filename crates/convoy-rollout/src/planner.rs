//! Reconcile planner.
//!
//! Given one consistent snapshot of a service's tasks, the revision that
//! should be serving, and the count bounds, `plan` returns the minimal set
//! of corrective actions for this tick. It is pure; the controller executes
//! the actions in the order returned (stops, then drains, then launches),
//! which keeps `running ≤ max_total` and `healthy ≥ min_healthy` at every
//! instant the platform could observe.

use convoy_state::{Revision, TaskHealth, TaskId, TaskRecord};

use crate::strategy::Bounds;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Stop(TaskId),
    Drain(TaskId),
    Launch(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Target tasks stopped because they failed health checks.
    pub failed_target_tasks: Vec<TaskId>,
    /// Every live task is a healthy target task, their count equals
    /// `desired`, and nothing is left to do.
    pub converged: bool,
}

impl Plan {
    pub fn launches(&self) -> u32 {
        self.actions
            .iter()
            .map(|a| match a {
                Action::Launch(n) => *n,
                _ => 0,
            })
            .sum()
    }
}

/// Compute this tick's actions. `target` is `None` when no revision may
/// serve (a first deploy rolled back).
pub fn plan(tasks: &[TaskRecord], target: Option<Revision>, bounds: Bounds) -> Plan {
    let is_target = |t: &TaskRecord| Some(t.revision) == target;
    let live: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.health != TaskHealth::Stopped)
        .collect();

    let mut running = live.len() as u32;
    let mut healthy = live
        .iter()
        .filter(|t| t.health == TaskHealth::Healthy)
        .count() as u32;

    let mut stops = Vec::new();
    let mut drains = Vec::new();
    let mut failed_target_tasks = Vec::new();

    // Unhealthy tasks serve nothing; remove them.
    for t in live.iter().filter(|t| t.health == TaskHealth::Unhealthy) {
        if is_target(t) {
            failed_target_tasks.push(t.id.clone());
        }
        stops.push(t.id.clone());
        running -= 1;
    }

    // Starting tasks of a revision that is no longer wanted.
    for t in live
        .iter()
        .filter(|t| t.health == TaskHealth::Starting && !is_target(t))
    {
        stops.push(t.id.clone());
        running -= 1;
    }

    let target_starting: Vec<&TaskRecord> = live
        .iter()
        .copied()
        .filter(|t| is_target(t) && t.health == TaskHealth::Starting)
        .collect();
    let target_healthy: Vec<&TaskRecord> = live
        .iter()
        .copied()
        .filter(|t| is_target(t) && t.health == TaskHealth::Healthy)
        .collect();
    let other_healthy: Vec<&TaskRecord> = live
        .iter()
        .copied()
        .filter(|t| !is_target(t) && t.health == TaskHealth::Healthy)
        .collect();

    // Scale-in of the target revision: cheapest tasks first.
    let mut target_live = (target_starting.len() + target_healthy.len()) as u32;
    let mut target_healthy_left = target_healthy.len() as u32;
    let mut excess = target_live.saturating_sub(bounds.desired);
    for t in target_starting.iter().take(excess as usize) {
        stops.push(t.id.clone());
        running -= 1;
        target_live -= 1;
        excess -= 1;
    }
    for t in target_healthy.iter().take(excess as usize) {
        if healthy <= bounds.min_healthy {
            break;
        }
        drains.push(t.id.clone());
        healthy -= 1;
        target_live -= 1;
        target_healthy_left -= 1;
    }

    // Other-revision healthy tasks are drained once target tasks can take
    // their place, or when there are more of them than desired.
    let other_excess =
        (other_healthy.len() as u32 + target_healthy_left).saturating_sub(bounds.desired);
    let mut other_drained = 0;
    while other_drained < other_excess as usize && healthy > bounds.min_healthy {
        drains.push(other_healthy[other_drained].id.clone());
        other_drained += 1;
        healthy -= 1;
    }

    // Launch replacements unless a target task just failed.
    let mut launch = 0;
    if target.is_some() && failed_target_tasks.is_empty() {
        let need = bounds.desired.saturating_sub(target_live);
        let room = bounds.max_total.saturating_sub(running);
        launch = need.min(room);

        // No surge room left: free capacity by draining other-revision
        // tasks ahead of their replacements, as far as min_healthy allows.
        let already_draining = live
            .iter()
            .filter(|t| t.health == TaskHealth::Draining)
            .count();
        let blocked = (need - launch) as usize;
        let mut extra = blocked.saturating_sub(already_draining + drains.len());
        while extra > 0 && other_drained < other_healthy.len() && healthy > bounds.min_healthy {
            drains.push(other_healthy[other_drained].id.clone());
            other_drained += 1;
            healthy -= 1;
            extra -= 1;
        }
    }

    let draining_left = live
        .iter()
        .filter(|t| t.health == TaskHealth::Draining)
        .count();
    let converged = stops.is_empty()
        && drains.is_empty()
        && launch == 0
        && draining_left == 0
        && live.iter().all(|t| is_target(t) && t.health == TaskHealth::Healthy)
        && live.len() as u32 == bounds.desired;

    let mut actions: Vec<Action> = stops.into_iter().map(Action::Stop).collect();
    actions.extend(drains.into_iter().map(Action::Drain));
    if launch > 0 {
        actions.push(Action::Launch(launch));
    }

    Plan {
        actions,
        failed_target_tasks,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, revision: Revision, health: TaskHealth) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            revision,
            health,
        }
    }

    fn bounds(desired: u32, min_healthy: u32, max_total: u32) -> Bounds {
        Bounds {
            desired,
            min_healthy,
            max_total,
        }
    }

    #[test]
    fn fresh_service_launches_desired() {
        let p = plan(&[], Some(1), bounds(2, 2, 4));
        assert_eq!(p.actions, vec![Action::Launch(2)]);
        assert!(!p.converged);
    }

    #[test]
    fn surge_up_to_max_total() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
        ];
        let p = plan(&tasks, Some(2), bounds(2, 2, 3));
        assert_eq!(p.actions, vec![Action::Launch(1)]);
    }

    #[test]
    fn old_tasks_wait_for_healthy_replacements() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
            task("c", 2, TaskHealth::Starting),
            task("d", 2, TaskHealth::Starting),
        ];
        let p = plan(&tasks, Some(2), bounds(2, 2, 4));
        assert!(p.actions.is_empty());
    }

    #[test]
    fn healthy_replacement_drains_one_old_task() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
            task("c", 2, TaskHealth::Healthy),
            task("d", 2, TaskHealth::Starting),
        ];
        let p = plan(&tasks, Some(2), bounds(2, 2, 4));
        assert_eq!(p.actions, vec![Action::Drain("a".into())]);
    }

    #[test]
    fn unhealthy_target_task_blocks_launches() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
            task("c", 2, TaskHealth::Unhealthy),
        ];
        let p = plan(&tasks, Some(2), bounds(2, 2, 4));
        assert_eq!(p.actions, vec![Action::Stop("c".into())]);
        assert_eq!(p.failed_target_tasks, vec!["c".to_string()]);
    }

    #[test]
    fn rollback_target_stops_starting_new_tasks() {
        // Target is the old revision again.
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
            task("c", 2, TaskHealth::Starting),
        ];
        let p = plan(&tasks, Some(1), bounds(2, 2, 4));
        assert_eq!(p.actions, vec![Action::Stop("c".into())]);
    }

    #[test]
    fn scale_in_stops_starting_before_draining() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
            task("c", 1, TaskHealth::Starting),
        ];
        let p = plan(&tasks, Some(1), bounds(1, 1, 2));
        assert_eq!(
            p.actions,
            vec![Action::Stop("c".into()), Action::Drain("a".into())]
        );
    }

    #[test]
    fn drains_respect_min_healthy() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Healthy),
            task("c", 1, TaskHealth::Healthy),
        ];
        // min_healthy above desired can only come from a lowered desired
        // count racing the percentage; never go below it.
        let p = plan(&tasks, Some(1), bounds(1, 2, 2));
        assert_eq!(p.actions, vec![Action::Drain("a".into())]);
    }

    #[test]
    fn converged_when_all_target_and_healthy() {
        let tasks = [
            task("a", 2, TaskHealth::Healthy),
            task("b", 2, TaskHealth::Healthy),
            task("x", 1, TaskHealth::Stopped),
        ];
        let p = plan(&tasks, Some(2), bounds(2, 2, 4));
        assert!(p.actions.is_empty());
        assert!(p.converged);
    }

    #[test]
    fn draining_tasks_block_convergence() {
        let tasks = [
            task("a", 2, TaskHealth::Healthy),
            task("b", 2, TaskHealth::Healthy),
            task("x", 1, TaskHealth::Draining),
        ];
        let p = plan(&tasks, Some(2), bounds(2, 2, 4));
        assert!(p.actions.is_empty());
        assert!(!p.converged);
    }

    #[test]
    fn no_target_drains_everything() {
        let tasks = [
            task("a", 1, TaskHealth::Healthy),
            task("b", 1, TaskHealth::Starting),
        ];
        let p = plan(&tasks, None, Bounds::drained());
        assert_eq!(
            p.actions,
            vec![Action::Stop("b".into()), Action::Drain("a".into())]
        );
        assert!(plan(&[], None, Bounds::drained()).converged);
    }

    fn observe(tasks: &[(TaskRecord, u32)], min_seen: &mut u32, max_seen: &mut u32) {
        let running = tasks
            .iter()
            .filter(|(t, _)| t.health != TaskHealth::Stopped)
            .count() as u32;
        let healthy = tasks
            .iter()
            .filter(|(t, _)| t.health == TaskHealth::Healthy)
            .count() as u32;
        *min_seen = (*min_seen).min(healthy);
        *max_seen = (*max_seen).max(running);
    }

    /// Drive the planner against a toy platform where starting tasks turn
    /// healthy after `warmup` ticks and draining tasks stop after `grace`
    /// ticks, checking the bounds after every single action.
    fn simulate(start: Vec<TaskRecord>, target: Revision, b: Bounds) -> (u32, u32, u32) {
        let warmup = 2;
        let grace = 3;
        let mut tasks: Vec<(TaskRecord, u32)> = start.into_iter().map(|t| (t, 0)).collect();
        let mut next_id = 0;
        let mut min_healthy_seen = u32::MAX;
        let mut max_running_seen = 0;

        for tick in 0..100 {
            // Platform progress.
            for (t, age) in tasks.iter_mut() {
                *age += 1;
                match t.health {
                    TaskHealth::Starting if *age >= warmup => t.health = TaskHealth::Healthy,
                    TaskHealth::Draining if *age >= grace => t.health = TaskHealth::Stopped,
                    _ => {}
                }
            }
            tasks.retain(|(t, _)| t.health != TaskHealth::Stopped);
            observe(&tasks, &mut min_healthy_seen, &mut max_running_seen);

            let records: Vec<TaskRecord> = tasks.iter().map(|(t, _)| t.clone()).collect();
            let p = plan(&records, Some(target), b);
            if p.converged {
                return (tick, min_healthy_seen, max_running_seen);
            }
            for action in p.actions {
                match action {
                    Action::Stop(id) => tasks.retain(|(t, _)| t.id != id),
                    Action::Drain(id) => {
                        for (t, age) in tasks.iter_mut() {
                            if t.id == id {
                                t.health = TaskHealth::Draining;
                                *age = 0;
                            }
                        }
                    }
                    Action::Launch(n) => {
                        for _ in 0..n {
                            next_id += 1;
                            tasks.push((task(&format!("n{next_id}"), target, TaskHealth::Starting), 0));
                        }
                    }
                }
                observe(&tasks, &mut min_healthy_seen, &mut max_running_seen);
            }
        }
        panic!("rollout did not converge");
    }

    #[test]
    fn rolling_replacement_keeps_bounds_and_converges() {
        for (desired, min_pct, max_pct) in [(2, 100, 200), (3, 50, 150), (4, 100, 125), (5, 0, 100)] {
            let b = Bounds {
                desired,
                min_healthy: (desired * min_pct).div_ceil(100),
                max_total: desired * max_pct / 100,
            };
            let start: Vec<TaskRecord> = (0..desired)
                .map(|i| task(&format!("o{i}"), 1, TaskHealth::Healthy))
                .collect();
            let (_, min_healthy, max_running) = simulate(start, 2, b);
            assert!(min_healthy >= b.min_healthy, "desired={desired}: healthy dipped to {min_healthy}");
            assert!(max_running <= b.max_total, "desired={desired}: running peaked at {max_running}");
        }
    }
}
