//! Metric sources for the autoscaler.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use convoy_state::{MetricsSnapshot, StateStore, epoch_secs};

/// Where the autoscaler reads observations from.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Latest sample for a service, `None` when nothing was observed yet.
    async fn latest(&self, service_id: &str) -> anyhow::Result<Option<MetricsSnapshot>>;
}

/// Reads samples pushed into the state store. A sample older than
/// `max_age` is not a current reading and is reported as missing.
#[derive(Clone)]
pub struct StoreMetricSource {
    state: StateStore,
    max_age: Duration,
}

impl StoreMetricSource {
    pub fn new(state: StateStore, max_age: Duration) -> Self {
        Self { state, max_age }
    }
}

#[async_trait]
impl MetricSource for StoreMetricSource {
    async fn latest(&self, service_id: &str) -> anyhow::Result<Option<MetricsSnapshot>> {
        let Some(sample) = self.state.latest_metrics(service_id)? else {
            return Ok(None);
        };
        let age = epoch_secs().saturating_sub(sample.epoch);
        if age > self.max_age.as_secs() {
            debug!(service = %service_id, age_secs = age, "metric sample is stale");
            return Ok(None);
        }
        Ok(Some(sample))
    }
}

/// Replays a fixed sequence of CPU readings, one per call, then keeps
/// returning the last one.
#[derive(Debug)]
pub struct SyntheticFeed {
    service_id: String,
    readings: Mutex<VecDeque<f64>>,
    last: Mutex<Option<f64>>,
}

impl SyntheticFeed {
    pub fn new(service_id: &str, cpu_readings: impl IntoIterator<Item = f64>) -> Self {
        Self {
            service_id: service_id.to_string(),
            readings: Mutex::new(cpu_readings.into_iter().collect()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MetricSource for SyntheticFeed {
    async fn latest(&self, service_id: &str) -> anyhow::Result<Option<MetricsSnapshot>> {
        if service_id != self.service_id {
            return Ok(None);
        }
        let next = self
            .readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if next.is_some() {
            *last = next;
        }
        Ok(last.map(|cpu| MetricsSnapshot {
            service_id: service_id.to_string(),
            epoch: epoch_secs(),
            cpu_percent: cpu,
            memory_percent: cpu,
            healthy_tasks: 0,
        }))
    }
}
