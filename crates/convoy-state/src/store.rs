//! StateStore — redb-backed state persistence for convoy.
//!
//! Provides typed CRUD operations over pipeline runs, scan reports,
//! published references, service specs and states, scaling policies,
//! security rule sets, and metric samples. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            PIPELINE_RUNS,
            SCAN_REPORTS,
            PUBLISHED,
            SERVICE_SPECS,
            SERVICE_STATES,
            SCALING_POLICIES,
            SECURITY_RULES,
            METRICS,
        ] {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_value<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_value<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_values<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    /// Insert or update a pipeline run. A run that is already terminal
    /// in the store cannot be overwritten.
    pub fn put_pipeline_run(&self, run: &PipelineRun) -> StateResult<()> {
        let bytes = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(PIPELINE_RUNS).map_err(map_err!(Table))?;
            let existing: Option<PipelineRun> = match t.get(run.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };
            if existing.is_some_and(|r| r.is_terminal()) {
                return Err(StateError::Immutable(format!("pipeline run {}", run.id)));
            }
            t.insert(run.id.as_str(), bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(run = %run.id, terminal = ?run.terminal, "pipeline run stored");
        Ok(())
    }

    pub fn get_pipeline_run(&self, id: &str) -> StateResult<Option<PipelineRun>> {
        self.get_value(PIPELINE_RUNS, id)
    }

    /// Runs for a service, oldest first.
    pub fn list_runs_for_service(&self, service_id: &str) -> StateResult<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .list_values::<PipelineRun>(PIPELINE_RUNS, "")?
            .into_iter()
            .filter(|r| r.service_id == service_id)
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    // ── Scan reports / published refs ──────────────────────────────

    /// Store a scan report. Reports are immutable: storing a different
    /// report for the same digest fails.
    pub fn put_scan_report(&self, report: &ScanReport) -> StateResult<()> {
        if let Some(existing) = self.get_scan_report(&report.digest)? {
            if existing.findings != report.findings {
                return Err(StateError::Immutable(format!("scan report {}", report.digest)));
            }
            return Ok(());
        }
        self.put_value(SCAN_REPORTS, report.digest.as_str(), report)
    }

    pub fn get_scan_report(&self, digest: &convoy_core::Digest) -> StateResult<Option<ScanReport>> {
        self.get_value(SCAN_REPORTS, digest.as_str())
    }

    pub fn put_published(&self, published: &PublishedRef) -> StateResult<()> {
        self.put_value(PUBLISHED, published.digest.as_str(), published)
    }

    pub fn get_published(&self, digest: &convoy_core::Digest) -> StateResult<Option<PublishedRef>> {
        self.get_value(PUBLISHED, digest.as_str())
    }

    // ── Service specs ──────────────────────────────────────────────

    pub fn put_service_spec(&self, spec: &ServiceSpec) -> StateResult<()> {
        self.put_value(SERVICE_SPECS, &spec.id, spec)?;
        debug!(service = %spec.id, generation = spec.generation, "service spec stored");
        Ok(())
    }

    pub fn get_service_spec(&self, id: &str) -> StateResult<Option<ServiceSpec>> {
        self.get_value(SERVICE_SPECS, id)
    }

    pub fn list_service_specs(&self) -> StateResult<Vec<ServiceSpec>> {
        self.list_values(SERVICE_SPECS, "")
    }

    /// Read-modify-write a service spec inside one write transaction.
    ///
    /// redb admits one writer at a time, so concurrent callers (deploy
    /// requests, the autoscaler) are serialized and never lose an update.
    /// The generation is bumped only when `f` actually changed the spec.
    pub fn update_service_spec<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ServiceSpec) -> R,
    ) -> StateResult<(ServiceSpec, R)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (spec, out) = {
            let mut t = txn.open_table(SERVICE_SPECS).map_err(map_err!(Table))?;
            let mut spec: ServiceSpec = match t.get(id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(format!("service {id}"))),
            };
            let before = spec.clone();
            let out = f(&mut spec);
            if spec != before {
                spec.generation = before.generation + 1;
                spec.updated_at = epoch_secs();
                let bytes = serde_json::to_vec(&spec).map_err(map_err!(Serialize))?;
                t.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
            }
            (spec, out)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((spec, out))
    }

    // ── Service states ─────────────────────────────────────────────

    pub fn put_service_state(&self, state: &ServiceState) -> StateResult<()> {
        self.put_value(SERVICE_STATES, &state.service_id, state)
    }

    pub fn get_service_state(&self, id: &str) -> StateResult<Option<ServiceState>> {
        self.get_value(SERVICE_STATES, id)
    }

    // ── Scaling policies ───────────────────────────────────────────

    pub fn put_scaling_policy(&self, service_id: &str, policy: &ScalingPolicy) -> StateResult<()> {
        self.put_value(SCALING_POLICIES, service_id, policy)
    }

    pub fn get_scaling_policy(&self, service_id: &str) -> StateResult<Option<ScalingPolicy>> {
        self.get_value(SCALING_POLICIES, service_id)
    }

    // ── Security rules ─────────────────────────────────────────────

    /// Replace the whole rule set of a service in one transaction.
    pub fn replace_security_rules(
        &self,
        service_id: &str,
        rules: Vec<SecurityRule>,
    ) -> StateResult<RuleSet> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let set = {
            let mut t = txn.open_table(SECURITY_RULES).map_err(map_err!(Table))?;
            let version = match t.get(service_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    let prev: RuleSet =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    prev.version + 1
                }
                None => 1,
            };
            let set = RuleSet {
                service_id: service_id.to_string(),
                rules,
                version,
                applied_at: epoch_secs(),
            };
            let bytes = serde_json::to_vec(&set).map_err(map_err!(Serialize))?;
            t.insert(service_id, bytes.as_slice()).map_err(map_err!(Write))?;
            set
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %service_id, version = set.version, "security rules replaced");
        Ok(set)
    }

    pub fn get_security_rules(&self, service_id: &str) -> StateResult<Option<RuleSet>> {
        self.get_value(SECURITY_RULES, service_id)
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Record a sample. Only the newest sample per service is kept; an
    /// older one arriving late is dropped.
    pub fn put_metrics(&self, snapshot: &MetricsSnapshot) -> StateResult<()> {
        let key = snapshot.table_key();
        let bytes = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(METRICS).map_err(map_err!(Table))?;
            let superseded = match t.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stored: MetricsSnapshot =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    stored.epoch > snapshot.epoch
                }
                None => false,
            };
            if superseded {
                debug!(service = %snapshot.service_id, epoch = snapshot.epoch, "late metric sample dropped");
            } else {
                t.insert(key.as_str(), bytes.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Most recent metric sample for a service.
    pub fn latest_metrics(&self, service_id: &str) -> StateResult<Option<MetricsSnapshot>> {
        self.get_value(METRICS, service_id)
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Remove every long-lived record of a service. Pipeline audit records
    /// are kept. Returns true if a spec existed.
    pub fn delete_service(&self, service_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut specs = txn.open_table(SERVICE_SPECS).map_err(map_err!(Table))?;
            existed = specs.remove(service_id).map_err(map_err!(Write))?.is_some();
            for table in [SERVICE_STATES, SCALING_POLICIES, SECURITY_RULES, METRICS] {
                let mut t = txn.open_table(table).map_err(map_err!(Table))?;
                t.remove(service_id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %service_id, existed, "service torn down");
        Ok(existed)
    }
}
