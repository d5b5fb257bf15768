//! Route handlers of the read API

use super::error::ApiError;
use super::export;
use super::list_options::{apply_filters, ListOptions, Listing, QueryParams, ResponseFormat};
use super::transform::{present, truncate_three_decimals, Units};
use super::ApiState;
use crate::identity::Identity;
use crate::rbac::{apply_rbac, Access, Permissions, ResourceKind};
use crate::storage::{
    container_recommendation_query, namespace_recommendation_query, NamespaceRecommendationRecord,
    RecommendationRecord, SelectQuery, SqlValue, StoreError,
};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

const OPENAPI: &str = include_str!("openapi.json");

#[derive(Debug, Serialize, PartialEq)]
pub struct Meta {
    pub count: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Links {
    pub first: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub last: String,
}

impl Links {
    /// Page links over `count` rows; `last` points at the final page
    pub fn new(path: &str, params: &QueryParams, count: i64, limit: i64, offset: i64) -> Self {
        let link = |offset: i64| format!("{path}?{}", params.with_page(limit, offset));
        let step = limit.max(1);
        let last_offset = if count > 0 { (count - 1) / step * step } else { 0 };
        Self {
            first: link(offset),
            previous: (offset > 0).then(|| link((offset - limit).max(0))),
            next: (offset + limit < count).then(|| link(offset + limit)),
            last: link(last_offset),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Collection {
    pub data: Vec<Value>,
    pub meta: Meta,
    pub links: Links,
}

pub async fn status() -> impl IntoResponse {
    Json(json!({"api-server": "working"}))
}

pub async fn openapi() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], OPENAPI)
}

fn storage_error(state: &ApiState, err: StoreError) -> ApiError {
    state.metrics.inc_db_errors();
    error!(error = %err, "Unable to fetch records from database");
    ApiError::Internal(err.to_string())
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("bad recommendation_id"))
}

/// Present a stored document, logging the notifications that were hidden
fn presented(id: &Uuid, cluster_uuid: &str, stored: &Value, units: Units, drop_plots: bool) -> Value {
    let mut doc = stored.clone();
    let dropped = present(&mut doc, units, drop_plots);
    if !dropped.is_empty() {
        warn!(
            recommendation_id = %id,
            cluster_uuid = %cluster_uuid,
            dropped = %dropped.join(", "),
            "Notifications dropped from recommendation"
        );
    }
    doc
}

fn container_json(record: &RecommendationRecord, doc: Value) -> Value {
    json!({
        "id": record.id,
        "source_id": record.source_id,
        "cluster_uuid": record.cluster_uuid,
        "cluster_alias": record.cluster_alias,
        "project": record.project,
        "workload_type": record.workload_type,
        "workload": record.workload,
        "container": record.container,
        "last_reported": record.last_reported,
        "recommendations": doc,
    })
}

fn namespace_json(record: &NamespaceRecommendationRecord, doc: Value, units: Units) -> Value {
    json!({
        "id": record.id,
        "source_id": record.source_id,
        "cluster_uuid": record.cluster_uuid,
        "cluster_alias": record.cluster_alias,
        "project": record.project,
        "cpu_request_current": record.cpu_request_current.map(|v| units.cpu.convert(v)),
        "cpu_variation": record.cpu_variation.map(truncate_three_decimals),
        "memory_request_current": record.memory_request_current.map(|v| units.memory.convert(v)),
        "memory_variation": record.memory_variation.map(truncate_three_decimals),
        "last_reported": record.last_reported,
        "recommendations": doc,
    })
}

/// Options shared by both list routes
struct ListRequest {
    params: QueryParams,
    options: ListOptions,
    units: Units,
}

impl ListRequest {
    fn parse(uri: &Uri, headers: &HeaderMap, listing: Listing) -> Result<Self, ApiError> {
        let params = QueryParams::parse(uri.query());
        let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
        let options = ListOptions::parse(&params, accept, listing)?;
        let units = Units::parse(&params)?;
        Ok(Self {
            params,
            options,
            units,
        })
    }

    /// Filtered, ordered and paged query; CSV replaces the page size with the export cap
    fn prepare(
        &self,
        query: &mut SelectQuery,
        listing: Listing,
        permissions: &Permissions,
        state: &ApiState,
    ) -> Result<(Access, i64), ApiError> {
        apply_filters(query, &self.params, listing, Utc::now())?;
        let kind = match listing {
            Listing::Container => ResourceKind::Container,
            Listing::Namespace => ResourceKind::Project,
        };
        let access = apply_rbac(query, permissions, kind, state.rbac_enabled);
        let limit = match self.options.format {
            ResponseFormat::Csv => state.record_limit_csv,
            ResponseFormat::Json => self.options.limit,
        };
        query
            .order_by(self.options.order_by, self.options.order)
            .page(limit, self.options.offset);
        Ok((access, limit))
    }

    fn collection(&self, uri: &Uri, data: Vec<Value>, count: i64, limit: i64) -> Collection {
        let offset = self.options.offset;
        Collection {
            data,
            meta: Meta {
                count,
                limit,
                offset,
            },
            links: Links::new(uri.path(), &self.params, count, limit, offset),
        }
    }
}

fn csv_response(body: Result<Vec<u8>, csv::Error>, filename: &str) -> Result<Response, ApiError> {
    let body = body.map_err(|e| {
        error!(error = %e, "Unable to write CSV");
        ApiError::Internal(e.to_string())
    })?;
    let disposition = format!("attachment; filename={filename}");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn list_containers(
    State(state): State<Arc<ApiState>>,
    Extension(identity): Extension<Identity>,
    Extension(permissions): Extension<Permissions>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = ListRequest::parse(&uri, &headers, Listing::Container)?;
    let mut query = container_recommendation_query(&identity.org_id);
    let (access, limit) = request.prepare(&mut query, Listing::Container, &permissions, &state)?;

    let (records, count) = match access {
        Access::Denied => (Vec::new(), 0),
        _ => state
            .store
            .container_recommendations(&query)
            .await
            .map_err(|e| storage_error(&state, e))?,
    };

    let items: Vec<(RecommendationRecord, Value)> = records
        .into_iter()
        .map(|r| {
            let doc = presented(&r.id, &r.cluster_uuid, &r.recommendations, request.units, true);
            (r, doc)
        })
        .collect();

    match request.options.format {
        ResponseFormat::Csv => csv_response(export::container_csv(&items), "recommendations.csv"),
        ResponseFormat::Json => {
            let data = items.into_iter().map(|(r, doc)| container_json(&r, doc)).collect();
            Ok(Json(request.collection(&uri, data, count, limit)).into_response())
        }
    }
}

pub async fn get_container(
    State(state): State<Arc<ApiState>>,
    Extension(identity): Extension<Identity>,
    Extension(permissions): Extension<Permissions>,
    Path(id): Path<String>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let units = Units::parse(&QueryParams::parse(uri.query()))?;

    let mut query = container_recommendation_query(&identity.org_id);
    query.where_sql("recommendation_sets.id = ?::uuid", vec![SqlValue::Text(id.to_string())]);
    if apply_rbac(&mut query, &permissions, ResourceKind::Container, state.rbac_enabled) == Access::Denied {
        return Err(ApiError::NotFound("recommendation not found".into()));
    }
    query.page(1, 0);

    let (records, _) = state
        .store
        .container_recommendations(&query)
        .await
        .map_err(|e| storage_error(&state, e))?;
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound("recommendation not found".into()))?;

    let doc = presented(&record.id, &record.cluster_uuid, &record.recommendations, units, false);
    Ok(Json(container_json(&record, doc)).into_response())
}

pub async fn list_namespaces(
    State(state): State<Arc<ApiState>>,
    Extension(identity): Extension<Identity>,
    Extension(permissions): Extension<Permissions>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = ListRequest::parse(&uri, &headers, Listing::Namespace)?;
    let mut query = namespace_recommendation_query(&identity.org_id);
    let (access, limit) = request.prepare(&mut query, Listing::Namespace, &permissions, &state)?;

    let (records, count) = match access {
        Access::Denied => (Vec::new(), 0),
        _ => state
            .store
            .namespace_recommendations(&query)
            .await
            .map_err(|e| storage_error(&state, e))?,
    };

    let items: Vec<(NamespaceRecommendationRecord, Value)> = records
        .into_iter()
        .map(|r| {
            let doc = presented(&r.id, &r.cluster_uuid, &r.recommendations, request.units, true);
            (r, doc)
        })
        .collect();

    match request.options.format {
        ResponseFormat::Csv => csv_response(
            export::namespace_csv(&items),
            "namespace-recommendations.csv",
        ),
        ResponseFormat::Json => {
            let data = items
                .into_iter()
                .map(|(r, doc)| namespace_json(&r, doc, request.units))
                .collect();
            Ok(Json(request.collection(&uri, data, count, limit)).into_response())
        }
    }
}

pub async fn get_namespace(
    State(state): State<Arc<ApiState>>,
    Extension(identity): Extension<Identity>,
    Extension(permissions): Extension<Permissions>,
    Path(id): Path<String>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let units = Units::parse(&QueryParams::parse(uri.query()))?;

    let mut query = namespace_recommendation_query(&identity.org_id);
    query.where_sql(
        "namespace_recommendation_sets.id = ?::uuid",
        vec![SqlValue::Text(id.to_string())],
    );
    if apply_rbac(&mut query, &permissions, ResourceKind::Project, state.rbac_enabled) == Access::Denied {
        return Err(ApiError::NotFound("recommendation not found".into()));
    }
    query.page(1, 0);

    let (records, _) = state
        .store
        .namespace_recommendations(&query)
        .await
        .map_err(|e| storage_error(&state, e))?;
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound("recommendation not found".into()))?;

    let doc = presented(&record.id, &record.cluster_uuid, &record.recommendations, units, false);
    Ok(Json(namespace_json(&record, doc, units)).into_response())
}
