//! convoy-api — REST API for convoy.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | List services |
//! | GET | `/api/v1/services/{id}` | Spec, observed state, rollout status |
//! | POST | `/api/v1/services/{id}/revisions` | "New revision available" trigger |
//! | POST | `/api/v1/services/{id}/abort` | Abort the run in progress |
//! | GET | `/api/v1/services/{id}/runs` | Pipeline run audit |
//! | PUT | `/api/v1/services/{id}/security-rules` | Validate and apply a rule set |
//! | POST | `/api/v1/services/{id}/metrics` | Push a metric sample |
//! | GET | `/api/v1/runs/{run_id}` | One pipeline run |

pub mod handlers;
pub mod trigger_handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tokio::sync::watch;

use convoy_pipeline::Orchestrator;
use convoy_policy::PolicyEnforcer;
use convoy_rollout::RolloutStatus;
use convoy_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub orchestrator: Arc<Orchestrator>,
    pub policy: Arc<PolicyEnforcer>,
    /// Status channels of the rollout controllers, by service.
    pub rollouts: Arc<HashMap<String, watch::Receiver<RolloutStatus>>>,
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/{id}", get(handlers::get_service))
        .route("/services/{id}/revisions", post(trigger_handlers::new_revision))
        .route("/services/{id}/abort", post(trigger_handlers::abort_run))
        .route("/services/{id}/runs", get(handlers::list_runs))
        .route("/services/{id}/security-rules", put(handlers::put_security_rules))
        .route("/services/{id}/metrics", post(handlers::push_metrics))
        .route("/runs/{run_id}", get(handlers::get_run))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
