use super::*;
use crate::featureflags::StaticFlags;
use crate::identity::{encode_rh_identity, RhIdentityAuth, RH_IDENTITY_HEADER};
use crate::rbac::{Permissions, RbacError, CLUSTER_SCOPE, PROJECT_SCOPE};
use crate::storage::{NamespaceRecommendationRecord, RecommendationRecord};
use crate::testing::MockStore;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const RECORD_ID: &str = "6a1d6f4e-3a5c-4f8e-9b1a-2f6d1c0e7b21";

struct FixedPermissions(Option<Permissions>);

#[async_trait]
impl PermissionSource for FixedPermissions {
    async fn permissions(&self, _identity_header: &str) -> Result<Permissions, RbacError> {
        self.0.clone().ok_or(RbacError::Status(500))
    }
}

fn document() -> Value {
    json!({
        "monitoring_end_time": "2024-03-10T12:00:00.000Z",
        "notifications": {"111000": {"code": 111000}},
        "current": {"requests": {"cpu": {"amount": 2.0, "format": "cores"}, "memory": {"amount": 1073741824.0, "format": "bytes"}}},
        "recommendation_terms": {"short_term": {
            "duration_in_hours": 24.0,
            "plots": {"datapoints": 0, "plots_data": {}},
            "recommendation_engines": {"cost": {
                "config": {"requests": {"cpu": {"amount": 1.0, "format": "cores"}, "memory": {"amount": 536870912.0, "format": "bytes"}}},
                "variation": {"requests": {"cpu": {"amount": -1.0, "format": "cores"}, "memory": {"amount": -536870912.0, "format": "bytes"}}}
            }}
        }}
    })
}

fn container_record() -> RecommendationRecord {
    RecommendationRecord {
        id: Uuid::parse_str(RECORD_ID).unwrap(),
        cluster_uuid: "c-1".into(),
        cluster_alias: "prod".into(),
        source_id: "42".into(),
        project: "acme".into(),
        workload: "api".into(),
        workload_type: "deployment".into(),
        container: "web".into(),
        last_reported: Some(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()),
        recommendations: document(),
    }
}

fn namespace_record() -> NamespaceRecommendationRecord {
    NamespaceRecommendationRecord {
        id: Uuid::parse_str(RECORD_ID).unwrap(),
        cluster_uuid: "c-1".into(),
        cluster_alias: "prod".into(),
        source_id: "42".into(),
        project: "acme".into(),
        cpu_request_current: Some(2.0),
        cpu_variation: Some(-50.0),
        memory_request_current: Some(1073741824.0),
        memory_variation: Some(-50.0),
        last_reported: None,
        recommendations: document(),
    }
}

struct Harness {
    store: Arc<MockStore>,
    permissions: Option<Permissions>,
    rbac_enabled: bool,
    namespaces: bool,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MockStore::default());
        store.with_state(|s| {
            s.container_page = vec![container_record()];
            s.namespace_page = vec![namespace_record()];
        });
        let mut all = Permissions::new();
        all.grant_all();
        Self {
            store,
            permissions: Some(all),
            rbac_enabled: true,
            namespaces: true,
        }
    }

    fn router(&self) -> Router {
        router(Arc::new(ApiState {
            store: self.store.clone(),
            auth: Arc::new(RhIdentityAuth),
            permissions: Arc::new(FixedPermissions(self.permissions.clone())),
            namespace_gate: NamespaceGate::new(false, Arc::new(StaticFlags::new(self.namespaces))),
            rbac_enabled: self.rbac_enabled,
            record_limit_csv: 1000,
            metrics: PipelineMetrics::new(),
        }))
    }

    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        self.send(Request::get(uri).header(RH_IDENTITY_HEADER, encode_rh_identity("o", Some("user"))))
            .await
    }

    async fn send(&self, request: axum::http::request::Builder) -> (StatusCode, Vec<u8>) {
        let response = self
            .router()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn queries(&self) -> Vec<String> {
        self.store.with_state(|s| s.queries.clone())
    }
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_status_needs_no_identity() {
    let harness = Harness::new();
    let (status, body) = harness.send(Request::get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"api-server": "working"}));
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let harness = Harness::new();
    let (status, body) = harness
        .send(Request::get(format!("{RECOMMENDATIONS_PATH}/openapi.json")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["openapi"], json!("3.0.3"));
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let harness = Harness::new();
    let (status, body) = harness.send(Request::get(RECOMMENDATIONS_PATH)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["status"], json!("error"));
    assert!(harness.queries().is_empty());
}

#[tokio::test]
async fn test_list_presents_documents() {
    let harness = Harness::new();
    let (status, body) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::OK);

    let body = json_body(&body);
    assert_eq!(body["meta"], json!({"count": 1, "limit": 10, "offset": 0}));
    assert_eq!(body["links"]["first"], json!(format!("{RECOMMENDATIONS_PATH}?limit=10&offset=0")));
    assert!(body["links"].get("next").is_none());

    let item = &body["data"][0];
    assert_eq!(item["id"], json!(RECORD_ID));
    assert_eq!(item["container"], json!("web"));
    assert_eq!(item["last_reported"], json!("2024-03-10T12:00:00Z"));

    let doc = &item["recommendations"];
    assert_eq!(doc["notifications"], json!({}));
    assert_eq!(doc["current"]["requests"]["memory"], json!({"amount": 1024.0, "format": "MiB"}));
    let short = &doc["recommendation_terms"]["short_term"];
    assert!(short.get("plots").is_none());
    assert_eq!(
        short["recommendation_engines"]["cost"]["variation"]["requests"]["cpu"],
        json!({"amount": -50.0, "format": "percent"})
    );

    let queries = harness.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("ORDER BY clusters.last_reported_at DESC LIMIT 10 OFFSET 0"));
}

#[tokio::test]
async fn test_list_ordering_and_paging() {
    let harness = Harness::new();
    let (status, _) = harness
        .get(&format!("{RECOMMENDATIONS_PATH}?order_by=workload&order_how=asc&limit=5&offset=15"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.queries()[0].ends_with("ORDER BY workloads.workload_name ASC LIMIT 5 OFFSET 15"));
}

#[tokio::test]
async fn test_invalid_parameters_are_bad_requests() {
    let harness = Harness::new();
    for query in [
        "order_by=nope",
        "order_how=up",
        "format=xml",
        "start_date=yesterday",
        "cpu_unit=kilocores",
    ] {
        let (status, body) = harness.get(&format!("{RECOMMENDATIONS_PATH}?{query}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{query}");
        assert_eq!(json_body(&body)["status"], json!("error"));
    }
    assert!(harness.queries().is_empty());
}

#[tokio::test]
async fn test_end_date_in_earlier_month_returns_empty_page() {
    let harness = Harness::new();
    harness.store.with_state(|s| s.container_page.clear());
    let (status, body) = harness
        .get(&format!("{RECOMMENDATIONS_PATH}?end_date=2000-01-31"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["meta"]["count"], json!(0));
    assert_eq!(harness.queries().len(), 1);
}

#[tokio::test]
async fn test_csv_export_uses_cap() {
    let harness = Harness::new();
    let response = harness
        .router()
        .oneshot(
            Request::get(format!("{RECOMMENDATIONS_PATH}?limit=5"))
                .header(RH_IDENTITY_HEADER, encode_rh_identity("o", None))
                .header(header::ACCEPT, "text/csv")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("id,cluster_uuid,cluster_alias,container"));
    assert!(lines[1].starts_with(RECORD_ID));
    assert!(harness.queries()[0].ends_with("LIMIT 1000 OFFSET 0"));
}

#[tokio::test]
async fn test_empty_permissions_are_forbidden() {
    let mut harness = Harness::new();
    harness.permissions = Some(Permissions::new());
    let (status, _) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_permission_lookup_failure_is_internal() {
    let mut harness = Harness::new();
    harness.permissions = None;
    let (status, body) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(&body)["message"], json!("Internal server error"));
}

#[tokio::test]
async fn test_rbac_narrows_query() {
    let mut harness = Harness::new();
    let mut permissions = Permissions::new();
    permissions.grant(PROJECT_SCOPE, ["acme".to_string()]);
    harness.permissions = Some(permissions);

    let (status, _) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::OK);
    let query = &harness.queries()[0];
    assert!(query.contains("workloads.namespace IN ($"));
    assert!(!query.contains("clusters.cluster_uuid IN"));
}

#[tokio::test]
async fn test_unrelated_scopes_return_empty_page() {
    let mut harness = Harness::new();
    let mut permissions = Permissions::new();
    permissions.grant("openshift.node", ["n1".to_string()]);
    harness.permissions = Some(permissions);

    let (status, body) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["data"], json!([]));
    assert_eq!(body["meta"]["count"], json!(0));
    assert!(harness.queries().is_empty());
}

#[tokio::test]
async fn test_rbac_disabled_skips_permission_lookup() {
    let mut harness = Harness::new();
    harness.rbac_enabled = false;
    harness.permissions = None;
    let (status, _) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_single_recommendation() {
    let harness = Harness::new();
    let (status, body) = harness.get(&format!("{RECOMMENDATIONS_PATH}/{RECORD_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["workload"], json!("api"));
    // plots stay on the detail route
    assert!(body["recommendations"]["recommendation_terms"]["short_term"]
        .get("plots")
        .is_some());
    assert!(harness.queries()[0].contains("recommendation_sets.id = $2::uuid"));

    let (status, _) = harness.get(&format!("{RECOMMENDATIONS_PATH}/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_single_recommendation_not_found() {
    let harness = Harness::new();
    harness.store.with_state(|s| s.container_page.clear());
    let (status, _) = harness.get(&format!("{RECOMMENDATIONS_PATH}/{RECORD_ID}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_namespace_listing() {
    let harness = Harness::new();
    let (status, body) = harness
        .get(&format!("{RECOMMENDATIONS_PATH}/namespaces?order_by=cpu_variation&cpu_unit=millicores"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let item = &json_body(&body)["data"][0];
    assert_eq!(item["project"], json!("acme"));
    assert_eq!(item["cpu_request_current"], json!(2000.0));
    assert_eq!(item["memory_request_current"], json!(1024.0));
    assert_eq!(item["cpu_variation"], json!(-50.0));
    assert!(harness.queries()[0].contains("ORDER BY namespace_recommendation_sets.cpu_variation DESC"));
}

#[tokio::test]
async fn test_namespace_routes_follow_gate() {
    let mut harness = Harness::new();
    harness.namespaces = false;

    let (status, _) = harness.get(&format!("{RECOMMENDATIONS_PATH}/namespaces")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = harness
        .get(&format!("{RECOMMENDATIONS_PATH}/namespaces/{RECORD_ID}"))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // container routes are unaffected
    let (status, _) = harness.get(RECOMMENDATIONS_PATH).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cluster_scope_applies_to_namespace_listing() {
    let mut harness = Harness::new();
    let mut permissions = Permissions::new();
    permissions.grant(CLUSTER_SCOPE, ["c-1".to_string()]);
    harness.permissions = Some(permissions);

    let (status, _) = harness.get(&format!("{RECOMMENDATIONS_PATH}/namespaces")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.queries()[0].contains("clusters.cluster_uuid IN ($"));
}
