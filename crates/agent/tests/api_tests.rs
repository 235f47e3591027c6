//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prm_lib::{
    health::{components, ComponentStatus, HealthRegistry, FAILURES_BEFORE_UNHEALTHY},
    models::{ContendedResource, ContentionAnomaly},
    observability::AgentMetrics,
    regulator::SharedStatus,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub status: SharedStatus,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn regulator_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status.read().await.clone();
    Json(status)
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/state", get(regulator_state))
        .with_state(state)
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();

    let state = Arc::new(AppState {
        health_registry,
        metrics: AgentMetrics::new(),
        status: SharedStatus::default(),
    });
    let router = create_test_router(state.clone());

    (router, state)
}

async fn fail_until_unhealthy(registry: &HealthRegistry, name: &str, message: &str) {
    for _ in 0..FAILURES_BEFORE_UNHEALTHY {
        registry.record_failure(name, message).await;
    }
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .record_failure(components::THRESHOLDS, "Using previous threshold snapshot")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200, the regulator keeps running on stale thresholds
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["thresholds"]["message"],
        "Using previous threshold snapshot"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    fail_until_unhealthy(
        &state.health_registry,
        components::SNAPSHOT_SOURCE,
        "Snapshot file unreadable",
    )
    .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "Regulator not yet initialized");
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    fail_until_unhealthy(&state.health_registry, components::ALLOCATION_SINK, "Failed").await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Unhealthy: allocation_sink");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_cycle_latency(0.001);
    state.metrics.set_tasks_tracked(3);
    state.metrics.set_lc_utilization_max(250.0);
    state
        .metrics
        .set_resource_level(ContendedResource::CpuCycles, 2);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("prm_agent_cycle_latency_seconds_bucket"));
    assert!(metrics_text.contains("prm_agent_tasks_tracked"));
    assert!(metrics_text.contains("prm_agent_lc_utilization_max"));
    assert!(metrics_text.contains("prm_agent_resource_level"));
}

#[tokio::test]
async fn test_state_reports_regulator_status() {
    let (app, state) = setup_test_app().await;

    {
        let mut status = state.status.write().await;
        status.cycles = 42;
        status.lc_util_max = 380.0;
        status.levels.cpu_cycles = 3;
        status.levels.llc = -1;
        status.cpu_model = "Intel(R) Xeon(R) Gold 6140".to_string();
        status.last_anomalies.push(ContentionAnomaly {
            resource: ContendedResource::Llc,
            contended_task_id: "lc-1".to_string(),
            contending_task_ids: vec!["be-1".to_string()],
            metrics: Vec::new(),
        });
    }

    let (code, body) = get_json(app, "/api/v1/state").await;

    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["cycles"], 42);
    assert_eq!(body["lc_util_max"], 380.0);
    assert_eq!(body["levels"]["cpu_cycles"], 3);
    assert_eq!(body["levels"]["llc"], -1);
    assert_eq!(body["cpu_model"], "Intel(R) Xeon(R) Gold 6140");
    assert_eq!(body["last_anomalies"][0]["resource"], "llc");
    assert_eq!(body["last_anomalies"][0]["contending_task_ids"][0], "be-1");
}

#[tokio::test]
async fn test_state_before_first_cycle_is_empty() {
    let (app, _state) = setup_test_app().await;

    let (code, body) = get_json(app, "/api/v1/state").await;

    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["cycles"], 0);
    assert!(body["last_anomalies"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_, health) = get_json(app, "/healthz").await;

    assert!(health["components"].is_object());
    for name in components::ALL {
        assert!(health["components"][name].is_object(), "missing {name}");
    }
}
