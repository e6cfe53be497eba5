//! REST API handlers for services, runs, rules, and metrics.
//!
//! Each handler reads/writes via `StateStore` (or the component that owns
//! the record) and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use convoy_policy::PolicyError;
use convoy_rollout::RolloutStatus;
use convoy_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

fn service_not_found() -> axum::response::Response {
    error_response("service not found", StatusCode::NOT_FOUND).into_response()
}

// ── Services ───────────────────────────────────────────────────

/// Desired state, observed state, and rollout status of a service.
#[derive(Serialize)]
pub struct ServiceView {
    pub spec: ServiceSpec,
    pub state: Option<ServiceState>,
    pub rollout: Option<RolloutStatus>,
    pub scaling: Option<ScalingPolicy>,
    pub security_rules: Option<RuleSet>,
}

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_service_specs() {
        Ok(specs) => ApiResponse::ok(specs).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/services/{id}
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let spec = match state.store.get_service_spec(&id) {
        Ok(Some(spec)) => spec,
        Ok(None) => return service_not_found(),
        Err(e) => return internal(e),
    };
    let view = (|| -> StateResult<ServiceView> {
        Ok(ServiceView {
            spec,
            state: state.store.get_service_state(&id)?,
            rollout: state.rollouts.get(&id).map(|rx| rx.borrow().clone()),
            scaling: state.store.get_scaling_policy(&id)?,
            security_rules: state.store.get_security_rules(&id)?,
        })
    })();
    match view {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => internal(e),
    }
}

// ── Runs ───────────────────────────────────────────────────────

/// GET /api/v1/services/{id}/runs
pub async fn list_runs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_runs_for_service(&id) {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/runs/{run_id}
pub async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_pipeline_run(&run_id) {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => error_response("run not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

// ── Security rules ─────────────────────────────────────────────

/// PUT /api/v1/services/{id}/security-rules
///
/// The body is the complete new rule set.
pub async fn put_security_rules(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(rules): Json<Vec<SecurityRule>>,
) -> impl IntoResponse {
    match state.policy.apply(&id, rules).await {
        Ok(set) => ApiResponse::ok(set).into_response(),
        Err(e @ (PolicyError::Violation { .. } | PolicyError::Invalid { .. })) => {
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY).into_response()
        }
        Err(PolicyError::UnknownService(_)) => service_not_found(),
        Err(e @ PolicyError::Platform(_)) => {
            error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response()
        }
        Err(e) => internal(e),
    }
}

// ── Metrics ────────────────────────────────────────────────────

/// Metric sample body.
#[derive(Debug, Deserialize)]
pub struct MetricSample {
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub healthy_tasks: u32,
}

/// POST /api/v1/services/{id}/metrics
pub async fn push_metrics(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(sample): Json<MetricSample>,
) -> impl IntoResponse {
    match state.store.get_service_spec(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return service_not_found(),
        Err(e) => return internal(e),
    }
    if !sample.cpu_percent.is_finite() || !sample.memory_percent.is_finite() {
        return error_response("metric values must be finite", StatusCode::BAD_REQUEST)
            .into_response();
    }
    let snapshot = MetricsSnapshot {
        service_id: id,
        epoch: epoch_secs(),
        cpu_percent: sample.cpu_percent,
        memory_percent: sample.memory_percent,
        healthy_tasks: sample.healthy_tasks,
    };
    match state.store.put_metrics(&snapshot) {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(snapshot)).into_response(),
        Err(e) => internal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    fn lb_rule() -> SecurityRule {
        SecurityRule {
            direction: Direction::Ingress,
            protocol: Protocol::Tcp,
            ports: PortRange::single(8080),
            source: RuleSource::PeerGroup("lb".into()),
        }
    }

    #[tokio::test]
    async fn get_service_and_missing_service() {
        let state = test_state().await;
        let resp = get_service(State(state.clone()), Path("web".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = get_service(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_runs_empty() {
        let state = test_state().await;
        let resp = list_runs(State(state), Path("web".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_nonexistent_run() {
        let state = test_state().await;
        let resp = get_run(State(state), Path("missing".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn security_rules_applied_or_rejected() {
        let state = test_state().await;
        let resp =
            put_security_rules(State(state.clone()), Path("web".to_string()), Json(vec![lb_rule()]))
                .await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let open = SecurityRule {
            source: RuleSource::Cidr("0.0.0.0/0".into()),
            ..lb_rule()
        };
        let resp =
            put_security_rules(State(state.clone()), Path("web".to_string()), Json(vec![open])).await;
        assert_eq!(resp.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);

        let active = state.store.get_security_rules("web").unwrap().unwrap();
        assert_eq!(active.rules, vec![lb_rule()]);
        assert_eq!(active.version, 1);
    }

    #[tokio::test]
    async fn metrics_are_stored() {
        let state = test_state().await;
        let sample = MetricSample {
            cpu_percent: 91.5,
            memory_percent: 40.0,
            healthy_tasks: 2,
        };
        let resp = push_metrics(State(state.clone()), Path("web".to_string()), Json(sample)).await;
        assert_eq!(resp.into_response().status(), StatusCode::ACCEPTED);
        let latest = state.store.latest_metrics("web").unwrap().unwrap();
        assert_eq!(latest.cpu_percent, 91.5);

        let sample = MetricSample {
            cpu_percent: 1.0,
            memory_percent: 1.0,
            healthy_tasks: 0,
        };
        let resp = push_metrics(State(state), Path("api".to_string()), Json(sample)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }
}
