//! Read API over stored recommendations
//!
//! This module provides:
//! - Container and namespace recommendation listings (JSON or CSV) and single-record lookups
//! - Caller authentication and RBAC narrowing as route middleware
//! - The namespace feature gate
//! - `/status` and the bundled OpenAPI document

pub mod error;
pub mod export;
pub mod handlers;
pub mod list_options;
pub mod middleware;
pub mod transform;

#[cfg(test)]
mod tests;

pub use error::ApiError;

use crate::featureflags::NamespaceGate;
use crate::identity::Authenticator;
use crate::observability::PipelineMetrics;
use crate::rbac::PermissionSource;
use crate::storage::RecommendationReader;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tracing::info;

pub const RECOMMENDATIONS_PATH: &str = "/api/cost-management/v1/recommendations/openshift";

/// Shared state of the read API
pub struct ApiState {
    pub store: Arc<dyn RecommendationReader>,
    pub auth: Arc<dyn Authenticator>,
    pub permissions: Arc<dyn PermissionSource>,
    pub namespace_gate: NamespaceGate,
    pub rbac_enabled: bool,
    /// Row cap of CSV exports
    pub record_limit_csv: i64,
    pub metrics: PipelineMetrics,
}

/// Create the read API router
pub fn router(state: Arc<ApiState>) -> Router {
    let namespaces = Router::new()
        .route(
            &format!("{RECOMMENDATIONS_PATH}/namespaces"),
            get(handlers::list_namespaces),
        )
        .route(
            &format!("{RECOMMENDATIONS_PATH}/namespaces/:id"),
            get(handlers::get_namespace),
        )
        .route_layer(from_fn_with_state(state.clone(), middleware::require_namespace_gate));

    let recommendations = Router::new()
        .route(RECOMMENDATIONS_PATH, get(handlers::list_containers))
        .route(&format!("{RECOMMENDATIONS_PATH}/:id"), get(handlers::get_container))
        .merge(namespaces)
        .route_layer(from_fn_with_state(state.clone(), middleware::authenticate));

    Router::new()
        .route("/status", get(handlers::status))
        .route(&format!("{RECOMMENDATIONS_PATH}/openapi.json"), get(handlers::openapi))
        .merge(recommendations)
        .layer(from_fn_with_state(state.clone(), middleware::track_requests))
        .with_state(state)
}

/// Serve the read API until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<ApiState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "Starting read API");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
