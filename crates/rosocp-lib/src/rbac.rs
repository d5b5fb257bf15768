//! Access control for the read API
//!
//! This module provides:
//! - [`Permissions`], the caller's scope → identifiers map
//! - [`apply_rbac`], which narrows a recommendation query to what the caller may see
//! - [`RbacClient`], which fetches and aggregates the caller's access list

use crate::config::RbacSettings;
use crate::storage::{Predicate, SelectQuery};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CLUSTER_SCOPE: &str = "openshift.cluster";
pub const PROJECT_SCOPE: &str = "openshift.project";
/// Scope key and identifier meaning "everything"
pub const WILDCARD: &str = "*";

const ACCESS_PATH: &str = "/api/rbac/v1/access/?application=cost-management&limit=100";
const MAX_PAGES: usize = 100;

/// Scope → identifiers the caller may see
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions(BTreeMap<String, Vec<String>>);

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, scope: impl Into<String>, values: impl IntoIterator<Item = String>) -> &mut Self {
        self.0.entry(scope.into()).or_default().extend(values);
        self
    }

    /// Full access to every scope
    pub fn grant_all(&mut self) -> &mut Self {
        self.0.entry(WILDCARD.to_string()).or_default();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_global(&self) -> bool {
        self.0.contains_key(WILDCARD)
    }

    pub fn scope(&self, scope: &str) -> Option<&[String]> {
        self.0.get(scope).map(Vec::as_slice)
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<String>)> for Permissions {
    fn from_iter<I: IntoIterator<Item = (S, Vec<String>)>>(iter: I) -> Self {
        let mut permissions = Permissions::new();
        for (scope, values) in iter {
            permissions.grant(scope, values);
        }
        permissions
    }
}

/// Which recommendation listing a query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Project,
}

impl ResourceKind {
    fn project_column(&self) -> &'static str {
        match self {
            ResourceKind::Container => "workloads.namespace",
            ResourceKind::Project => "namespace_recommendation_sets.namespace_name",
        }
    }
}

const CLUSTER_COLUMN: &str = "clusters.cluster_uuid";

/// Outcome of [`apply_rbac`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No predicate needed
    Unrestricted,
    /// Predicates were added to the query
    Filtered,
    /// Neither scope is granted; the caller should answer with an empty page
    Denied,
}

/// Restrict `query` to the clusters and projects in `permissions`
pub fn apply_rbac(
    query: &mut SelectQuery,
    permissions: &Permissions,
    kind: ResourceKind,
    enabled: bool,
) -> Access {
    if !enabled || permissions.is_global() {
        return Access::Unrestricted;
    }

    let clusters = permissions.scope(CLUSTER_SCOPE);
    let projects = permissions.scope(PROJECT_SCOPE);
    if clusters.is_none() && projects.is_none() {
        return Access::Denied;
    }

    let clusters = restricted(clusters);
    let projects = restricted(projects);
    // A granted scope without identifiers matches nothing
    if clusters.is_some_and(<[String]>::is_empty) || projects.is_some_and(<[String]>::is_empty) {
        return Access::Denied;
    }

    let mut access = Access::Unrestricted;
    if let Some(values) = clusters {
        query.filter(Predicate::any_of(CLUSTER_COLUMN, values));
        access = Access::Filtered;
    }
    if let Some(values) = projects {
        query.filter(Predicate::any_of(kind.project_column(), values));
        access = Access::Filtered;
    }
    access
}

/// Identifiers of a scope, or `None` when the scope is absent or wildcarded
fn restricted(values: Option<&[String]>) -> Option<&[String]> {
    values.filter(|v| !v.iter().any(|x| x == WILDCARD))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttributeFilter {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub operation: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceDefinition {
    #[serde(rename = "attributeFilter", default)]
    pub attribute_filter: AttributeFilter,
}

/// One access-list entry, e.g. `cost-management:openshift.cluster:read`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessEntry {
    pub permission: String,
    #[serde(rename = "resourceDefinitions", default)]
    pub resource_definitions: Vec<ResourceDefinition>,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AccessPage {
    #[serde(default)]
    data: Vec<AccessEntry>,
    #[serde(default)]
    links: Links,
}

fn filter_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Fold an access list into a permission map
pub fn aggregate_permissions(entries: &[AccessEntry]) -> Permissions {
    let mut permissions = Permissions::new();
    for entry in entries {
        let Some(resource) = entry.permission.split(':').nth(1) else {
            continue;
        };
        if resource.contains("openshift") {
            if entry.resource_definitions.is_empty() {
                permissions.grant(resource, [WILDCARD.to_string()]);
            } else {
                let values = entry
                    .resource_definitions
                    .iter()
                    .flat_map(|d| filter_values(&d.attribute_filter.value));
                permissions.grant(resource, values);
            }
        } else if resource == WILDCARD {
            permissions.grant_all();
        }
    }
    permissions
}

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("access service request failed: {0}")]
    Transport(String),

    #[error("access service returned HTTP {0}")]
    Status(u16),

    #[error("cannot decode access list: {0}")]
    Decode(String),
}

/// Where the read API gets a caller's permissions from
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Permissions of the caller identified by the raw `X-Rh-Identity` header
    async fn permissions(&self, identity_header: &str) -> Result<Permissions, RbacError>;
}

/// Client for the platform access service
pub struct RbacClient {
    client: reqwest::Client,
    base: Url,
}

impl RbacClient {
    pub fn new(settings: &RbacSettings, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        let base = Url::parse(&settings.access_url())
            .map_err(|e| anyhow::anyhow!("Invalid RBAC URL: {e}"))?;
        Ok(Self { client, base })
    }

    async fn page(&self, url: Url, identity_header: &str) -> Result<AccessPage, RbacError> {
        let response = self
            .client
            .get(url)
            .header("x-rh-identity", identity_header)
            .send()
            .await
            .map_err(|e| RbacError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RbacError::Status(status.as_u16()));
        }
        response
            .json::<AccessPage>()
            .await
            .map_err(|e| RbacError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PermissionSource for RbacClient {
    async fn permissions(&self, identity_header: &str) -> Result<Permissions, RbacError> {
        let mut entries = Vec::new();
        let mut next = Some(ACCESS_PATH.to_string());

        for _ in 0..MAX_PAGES {
            let Some(path) = next.take() else {
                break;
            };
            let url = self
                .base
                .join(&path)
                .map_err(|e| RbacError::Transport(e.to_string()))?;
            let page = self.page(url, identity_header).await?;
            debug!(entries = page.data.len(), "Fetched access page");
            entries.extend(page.data);
            next = page.links.next.filter(|n| !n.is_empty());
        }
        if next.is_some() {
            warn!(pages = MAX_PAGES, "Access list paging stopped early");
        }

        Ok(aggregate_permissions(&entries))
    }
}
