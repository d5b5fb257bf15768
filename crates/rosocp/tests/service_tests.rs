//! Integration tests for the HTTP surfaces served by the rosocp processes

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use rosocp_lib::{
    api::{self, ApiState, RECOMMENDATIONS_PATH},
    featureflags::{NamespaceGate, StaticFlags},
    health::components,
    identity::{encode_rh_identity, RhIdentityAuth, RH_IDENTITY_HEADER},
    probes,
    rbac::{PermissionSource, Permissions, RbacError},
    storage::{
        NamespaceRecommendationRecord, RecommendationReader, RecommendationRecord, SelectQuery,
        StoreError,
    },
    HealthRegistry, PipelineMetrics,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

async fn get(app: Router, uri: &str, identity: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(org) = identity {
        request = request.header(RH_IDENTITY_HEADER, encode_rh_identity(org, Some("tester")));
    }
    let response = app
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

// ---- probes ----

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let registry = HealthRegistry::new("processor");
    registry.register(components::DATABASE).await;
    registry.register(components::CONSUMER).await;

    let (status, health) = get(probes::router(registry), "/healthz", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "processor");
    assert!(health["components"]["database"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let registry = HealthRegistry::new("processor");
    registry.register(components::ANALYZER).await;
    registry
        .set_degraded(components::ANALYZER, "profile setup failed")
        .await;

    let (status, health) = get(probes::router(registry), "/healthz", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let registry = HealthRegistry::new("api");
    registry.register(components::READ_API).await;
    registry
        .set_unhealthy(components::READ_API, "address in use")
        .await;

    let (status, health) = get(probes::router(registry), "/healthz", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_startup() {
    let registry = HealthRegistry::new("recommendation-poller");
    registry.register(components::CONSUMER).await;

    let (status, readiness) = get(probes::router(registry.clone()), "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert!(readiness["reason"].is_string());

    registry.set_ready(true).await;
    let (status, readiness) = get(probes::router(registry), "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let registry = HealthRegistry::new("processor");
    registry.register(components::DATABASE).await;
    registry.set_ready(true).await;
    registry
        .set_unhealthy(components::DATABASE, "connection refused")
        .await;

    let (status, _) = get(probes::router(registry), "/readyz", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let metrics = PipelineMetrics::new();
    metrics.inc_db_errors();

    let response = probes::router(HealthRegistry::new("processor"))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("rosocp_db_error_total"));
    assert!(text.contains("rosocp_invalid_csv_total"));
}

// ---- read API ----

struct OneRecord;

#[async_trait]
impl RecommendationReader for OneRecord {
    async fn container_recommendations(
        &self,
        _query: &SelectQuery,
    ) -> Result<(Vec<RecommendationRecord>, i64), StoreError> {
        let record = RecommendationRecord {
            id: Uuid::nil(),
            cluster_uuid: "c-1".into(),
            cluster_alias: "prod".into(),
            source_id: "42".into(),
            project: "acme".into(),
            workload: "api".into(),
            workload_type: "deployment".into(),
            container: "web".into(),
            last_reported: None,
            recommendations: json!({"recommendation_terms": {}}),
        };
        Ok((vec![record], 1))
    }

    async fn namespace_recommendations(
        &self,
        _query: &SelectQuery,
    ) -> Result<(Vec<NamespaceRecommendationRecord>, i64), StoreError> {
        Ok((Vec::new(), 0))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct NoRbac;

#[async_trait]
impl PermissionSource for NoRbac {
    async fn permissions(&self, _identity_header: &str) -> Result<Permissions, RbacError> {
        Err(RbacError::Status(503))
    }
}

fn api_router(namespaces_enabled: bool) -> Router {
    let flags = Arc::new(StaticFlags::new(namespaces_enabled));
    api::router(Arc::new(ApiState {
        store: Arc::new(OneRecord),
        auth: Arc::new(RhIdentityAuth),
        permissions: Arc::new(NoRbac),
        namespace_gate: NamespaceGate::new(false, flags),
        rbac_enabled: false,
        record_limit_csv: 1000,
        metrics: PipelineMetrics::new(),
    }))
}

#[tokio::test]
async fn test_status_needs_no_identity() {
    let (status, body) = get(api_router(true), "/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api-server"], "working");
}

#[tokio::test]
async fn test_listing_requires_identity() {
    let (status, body) = get(api_router(true), RECOMMENDATIONS_PATH, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_listing_without_rbac_returns_the_page() {
    let (status, body) = get(api_router(true), RECOMMENDATIONS_PATH, Some("org-1")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 1);
    assert_eq!(body["data"][0]["workload"], "api");
    assert_eq!(body["data"][0]["cluster_alias"], "prod");
}

#[tokio::test]
async fn test_namespace_routes_closed_by_feature_flag() {
    let uri = format!("{RECOMMENDATIONS_PATH}/namespaces");

    let (status, _) = get(api_router(false), &uri, Some("org-1")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = get(api_router(true), &uri, Some("org-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 0);
}

#[tokio::test]
async fn test_api_requests_are_counted() {
    let (status, _) = get(api_router(true), "/status", None).await;
    assert_eq!(status, StatusCode::OK);

    let families = prometheus::gather();
    assert!(families
        .iter()
        .any(|family| family.get_name() == "rosocp_api_requests_total"));
}
