//! Request middleware of the read API

use super::error::ApiError;
use super::ApiState;
use crate::identity::Identity;
use crate::rbac::Permissions;
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Count every response by route template and status
pub async fn track_requests(
    State(state): State<Arc<ApiState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().clone();

    let response = next.run(req).await;
    let status = response.status().as_u16();
    state.metrics.inc_api_request(&route, status);
    debug!(%method, route = %route, status, "Handled request");
    response
}

/// Resolve the caller and their permissions
///
/// Adds [`Identity`] and [`Permissions`] to the request extensions. With
/// RBAC disabled every caller gets global access.
pub async fn authenticate(
    State(state): State<Arc<ApiState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = state.auth.authenticate(req.headers()).await.map_err(|e| {
        warn!(error = %e, "Authentication failed");
        ApiError::from(e)
    })?;

    let permissions = if state.rbac_enabled {
        state
            .permissions
            .permissions(&identity.header)
            .await
            .map_err(|e| {
                error!(org_id = %identity.org_id, error = %e, "Unable to fetch permissions");
                ApiError::Internal(e.to_string())
            })?
    } else {
        let mut all = Permissions::new();
        all.grant_all();
        all
    };
    if permissions.is_empty() {
        return Err(ApiError::Forbidden(
            "User is not authorized to access the resource".into(),
        ));
    }

    req.extensions_mut().insert(identity);
    req.extensions_mut().insert(permissions);
    Ok(next.run(req).await)
}

/// Namespace routes answer 503 unless enabled for the caller's org
pub async fn require_namespace_gate(
    State(state): State<Arc<ApiState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let org_id = req
        .extensions()
        .get::<Identity>()
        .map(|i| i.org_id.clone())
        .unwrap_or_default();
    if !state.namespace_gate.is_enabled(&org_id).await {
        return Err(ApiError::ServiceUnavailable(
            "Namespace recommendations are not available".into(),
        ));
    }
    Ok(next.run(req).await)
}
