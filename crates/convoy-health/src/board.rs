//! Per-service health board.
//!
//! Probe ingestion for all tasks of a service happens under one lock, and
//! every snapshot is computed under that same lock, so a reader never sees
//! running and healthy totals from two different moments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use convoy_platform::{TaskLifecycle, TaskObservation};
use convoy_state::{Revision, TaskHealth, TaskId, TaskRecord};

use crate::tracker::HealthTracker;

#[derive(Debug)]
struct Entry {
    tracker: HealthTracker,
    last_seq: u64,
    first_seen: Instant,
}

/// Consistent view of a service's tasks after one ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub tasks: Vec<TaskRecord>,
    /// Non-stopped tasks, draining included.
    pub running: u32,
    pub healthy: u32,
}

impl HealthSnapshot {
    pub fn of_revision(&self, revision: Revision) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter().filter(move |t| t.revision == revision)
    }

    pub fn count(&self, revision: Revision, health: TaskHealth) -> u32 {
        self.of_revision(revision)
            .filter(|t| t.health == health)
            .count() as u32
    }
}

#[derive(Debug)]
pub struct HealthBoard {
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    entries: Mutex<HashMap<TaskId, Entry>>,
}

impl HealthBoard {
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            healthy_threshold,
            unhealthy_threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fold the latest platform observations into per-task health.
    ///
    /// Tasks missing from `observed` are forgotten.
    pub fn ingest(&self, observed: &[TaskObservation]) -> HealthSnapshot {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let mut tasks = Vec::with_capacity(observed.len());
        for obs in observed {
            let health = match obs.lifecycle {
                TaskLifecycle::Stopped => {
                    entries.remove(&obs.id);
                    TaskHealth::Stopped
                }
                TaskLifecycle::Draining => TaskHealth::Draining,
                TaskLifecycle::Running => {
                    let entry = entries.entry(obs.id.clone()).or_insert_with(|| Entry {
                        tracker: HealthTracker::new(
                            self.healthy_threshold,
                            self.unhealthy_threshold,
                        ),
                        last_seq: 0,
                        first_seen: now,
                    });
                    match obs.last_probe {
                        Some(probe) if probe.seq > entry.last_seq => {
                            entry.last_seq = probe.seq;
                            let before = entry.tracker.status();
                            let after = entry.tracker.record(probe.result);
                            if before != after {
                                debug!(task = %obs.id, from = ?before, to = ?after, "task health changed");
                            }
                        }
                        _ => {}
                    }
                    entry.tracker.status()
                }
            };
            tasks.push(TaskRecord {
                id: obs.id.clone(),
                revision: obs.revision,
                health,
            });
        }

        entries.retain(|id, _| observed.iter().any(|o| &o.id == id));

        let running = tasks
            .iter()
            .filter(|t| t.health != TaskHealth::Stopped)
            .count() as u32;
        let healthy = tasks
            .iter()
            .filter(|t| t.health == TaskHealth::Healthy)
            .count() as u32;
        HealthSnapshot {
            tasks,
            running,
            healthy,
        }
    }

    /// Mark tasks still `Starting` after `timeout` as unhealthy. Returns the
    /// ids that were marked.
    pub fn expire_starting(&self, timeout: Duration) -> Vec<TaskId> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut expired = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if entry.tracker.status() == TaskHealth::Starting
                && now.duration_since(entry.first_seen) >= timeout
            {
                entry.tracker.mark_unhealthy();
                expired.push(id.clone());
            }
        }
        expired
    }

    pub fn forget(&self, task_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }
}
