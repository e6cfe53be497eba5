//! Standalone API tests: the REST surface over a fully wired convoy.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use convoy_core::ConvoyConfig;
use convoy_platform::memory::{InMemoryPlatform, InMemoryRegistry, InMemoryScanner, StaticBuilder};
use convoy_state::StateStore;
use convoyd::{Collaborators, System};

async fn start(state: StateStore) -> System {
    let mut config = ConvoyConfig::scaffold("web", "registry.local/web", 8080);
    config.rollout.poll_interval = "1s".to_string();
    let collaborators = Collaborators::in_memory(
        Arc::new(StaticBuilder::new()),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(InMemoryScanner::new()),
        Arc::new(InMemoryPlatform::new()),
    );
    System::start(&config, state, collaborators).await.unwrap()
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let resp = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test(start_paused = true)]
async fn trigger_runs_to_completion() {
    let system = start(StateStore::open_in_memory().unwrap()).await;
    let router = system.router();

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/services/web/revisions",
        Some(json!({ "repository": "git@host:team/web.git", "reference": "v1.0.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["data"]["run_id"].as_str().unwrap().to_string();

    let uri = format!("/api/v1/runs/{run_id}");
    let run = loop {
        let (status, body) = send(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        if !body["data"]["terminal"].is_null() {
            break body["data"].clone();
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    };
    assert_eq!(run["terminal"], "SUCCESS");
    assert_eq!(run["rollout_outcome"], "STEADY_STATE");

    let (status, body) = send(&router, "GET", "/api/v1/services/web", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["rollout"]["phase"]["phase"], "STEADY_STATE");
    assert_eq!(body["data"]["rollout"]["healthy"], 2);

    let (status, body) = send(&router, "GET", "/api/v1/services/web/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    system.shutdown().await;
}

#[tokio::test]
async fn open_ingress_is_rejected_with_422() {
    let system = start(StateStore::open_in_memory().unwrap()).await;
    let router = system.router();

    let open = json!([{
        "direction": "INGRESS",
        "protocol": "tcp",
        "ports": { "from": 8080, "to": 8080 },
        "source": { "type": "cidr", "value": "0.0.0.0/0" }
    }]);
    let (status, body) =
        send(&router, "PUT", "/api/v1/services/web/security-rules", Some(open)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);

    // The rules seeded from the config stay active.
    let (_, body) = send(&router, "GET", "/api/v1/services/web", None).await;
    let rules = &body["data"]["security_rules"];
    assert_eq!(rules["version"], 1);
    assert_eq!(rules["rules"][0]["source"]["type"], "peer_group");

    system.shutdown().await;
}

#[tokio::test]
async fn unknown_service_routes_are_404() {
    let system = start(StateStore::open_in_memory().unwrap()).await;
    let router = system.router();

    let (status, _) = send(&router, "GET", "/api/v1/services/db", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/services/db/revisions",
        Some(json!({ "repository": "r", "reference": "v1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/services/db/metrics",
        Some(json!({ "cpu_percent": 10.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, "POST", "/api/v1/services/db/abort", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    system.shutdown().await;
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("convoy.redb");

    let system = start(StateStore::open(&path).unwrap()).await;
    let router = system.router();
    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/services/web/metrics",
        Some(json!({ "cpu_percent": 42.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    system.shutdown().await;
    drop(router);

    let system = start(StateStore::open(&path).unwrap()).await;
    let latest = system.state.latest_metrics("web").unwrap().unwrap();
    assert_eq!(latest.cpu_percent, 42.0);
    assert_eq!(system.state.get_security_rules("web").unwrap().unwrap().version, 1);
    system.shutdown().await;
}
