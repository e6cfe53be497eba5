//! Subsystem wiring and lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use convoy_autoscale::{Autoscaler, MetricSource, StoreMetricSource};
use convoy_core::ConvoyConfig;
use convoy_gate::{GatePolicy, VulnerabilityGate};
use convoy_pipeline::{Orchestrator, Pipeline, StageTimeouts};
use convoy_platform::memory::{InMemoryPlatform, InMemoryRegistry, InMemoryScanner, StaticBuilder};
use convoy_platform::{
    FirewallControl, ImageBuilder, Registry, Scanner, ServiceReader, SpecWriter, TaskControl,
};
use convoy_policy::{PolicyEnforcer, rules_from_config};
use convoy_registry::Publisher;
use convoy_rollout::{Deployer, RollingConfig, RolloutController, RolloutStatus};
use convoy_state::{ScalingPolicy, ServiceSpec, StateStore};

/// Scaling intervals after which a stored metric sample no longer counts
/// as a current reading.
const METRIC_MAX_AGE_INTERVALS: u32 = 3;

/// The external systems convoy talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn ImageBuilder>,
    pub registry: Arc<dyn Registry>,
    pub scanner: Arc<dyn Scanner>,
    pub reader: Arc<dyn ServiceReader>,
    pub tasks: Arc<dyn TaskControl>,
    pub spec_writer: Arc<dyn SpecWriter>,
    pub firewall: Arc<dyn FirewallControl>,
    pub metrics: Option<Arc<dyn MetricSource>>,
}

impl Collaborators {
    /// In-memory collaborators sharing one simulated platform.
    pub fn in_memory(
        builder: Arc<StaticBuilder>,
        registry: Arc<InMemoryRegistry>,
        scanner: Arc<InMemoryScanner>,
        platform: Arc<InMemoryPlatform>,
    ) -> Self {
        Self {
            builder,
            registry,
            scanner,
            reader: platform.clone(),
            tasks: platform.clone(),
            spec_writer: platform.clone(),
            firewall: platform,
            metrics: None,
        }
    }

    /// Read metrics from `source` instead of the state store.
    pub fn with_metrics(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.metrics = Some(source);
        self
    }
}

/// A running convoy instance.
pub struct System {
    pub state: StateStore,
    pub orchestrator: Arc<Orchestrator>,
    pub policy: Arc<PolicyEnforcer>,
    pub rollouts: HashMap<String, watch::Receiver<RolloutStatus>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Write the configured service into the store. A stored spec keeps its
/// image, revision, and desired count; shape and rollout bounds follow the
/// config.
fn seed_service(config: &ConvoyConfig, state: &StateStore) -> anyhow::Result<ServiceSpec> {
    let id = &config.service.id;
    let configured = ServiceSpec::from_config(
        &config.service,
        config.rollout.min_healthy_percent,
        config.rollout.max_surge_percent,
    );
    if state.get_service_spec(id)?.is_none() {
        state.put_service_spec(&configured)?;
        info!(service = %id, desired = configured.desired_count, "service registered");
        return Ok(configured);
    }
    let (spec, ()) = state.update_service_spec(id, |spec| {
        spec.port = configured.port;
        spec.resources = configured.resources;
        spec.min_healthy_percent = configured.min_healthy_percent;
        spec.max_surge_percent = configured.max_surge_percent;
    })?;
    info!(
        service = %id,
        revision = spec.revision,
        desired = spec.desired_count,
        "service restored"
    );
    Ok(spec)
}

impl System {
    /// Validate the config, seed the store, and start every loop.
    pub async fn start(
        config: &ConvoyConfig,
        state: StateStore,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let service_id = config.service.id.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // ── State ──────────────────────────────────────────────
        seed_service(config, &state)?;
        let scaling = ScalingPolicy::from_config(&config.scaling)?;
        state.put_scaling_policy(&service_id, &scaling)?;

        let (probe_interval, probe_timeout) = config.health_timings()?;
        info!(
            path = %config.health.path,
            interval = ?probe_interval,
            timeout = ?probe_timeout,
            "load balancer health check"
        );

        // ── Network policy ─────────────────────────────────────
        let policy = Arc::new(PolicyEnforcer::new(state.clone(), collaborators.firewall.clone()));
        if policy.current(&service_id)?.is_none() && !config.security.rules.is_empty() {
            let rules = rules_from_config(&config.security)?;
            policy
                .apply(&service_id, rules)
                .await
                .context("initial security rules rejected")?;
        }

        // ── Rollout controller ─────────────────────────────────
        let controller = RolloutController::new(
            &service_id,
            state.clone(),
            collaborators.reader.clone(),
            collaborators.tasks.clone(),
            RollingConfig::from_config(config)?,
        )?;
        let status = controller.subscribe();
        handles.push(tokio::spawn(controller.run(shutdown_rx.clone())));

        // ── Autoscaler ─────────────────────────────────────────
        let interval = config.scaling_interval()?;
        let metrics = collaborators.metrics.clone().unwrap_or_else(|| {
            Arc::new(StoreMetricSource::new(
                state.clone(),
                interval * METRIC_MAX_AGE_INTERVALS,
            ))
        });
        let mut autoscaler = Autoscaler::new(state.clone(), metrics);
        let autoscale_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            autoscaler.run(interval, autoscale_shutdown).await;
        }));

        // ── Pipeline ───────────────────────────────────────────
        let (build, rollout) = config.pipeline_timings()?;
        let pipeline = Pipeline::new(
            state.clone(),
            collaborators.builder.clone(),
            VulnerabilityGate::new(
                collaborators.scanner.clone(),
                config.gate_retry()?,
                config.gate_scan_timeout()?,
            ),
            GatePolicy::from_config(&config.gate)?,
            Publisher::new(
                collaborators.registry.clone(),
                state.clone(),
                config.registry_retry()?,
                config.registry_push_timeout()?,
            ),
            Deployer::new(state.clone(), collaborators.spec_writer.clone())
                .with_rollout(&service_id, status.clone()),
            StageTimeouts { build, rollout },
        );
        let orchestrator = Arc::new(Orchestrator::new(pipeline));
        orchestrator
            .add_service(&service_id, &config.service.repository)
            .await;

        info!(service = %service_id, "convoy started");
        Ok(Self {
            state,
            orchestrator,
            policy,
            rollouts: HashMap::from([(service_id, status)]),
            shutdown_tx,
            handles,
        })
    }

    /// The REST API over this instance.
    pub fn router(&self) -> Router {
        convoy_api::build_router(convoy_api::ApiState {
            store: self.state.clone(),
            orchestrator: self.orchestrator.clone(),
            policy: self.policy.clone(),
            rollouts: Arc::new(self.rollouts.clone()),
        })
    }

    /// Stop the pipeline lanes, then the control loops.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("convoy stopped");
    }
}
