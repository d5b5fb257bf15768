//! Feature flags
//!
//! Flags come from an Unleash server's client API when one is configured
//! and from a static answer otherwise. The toggle set is cached and
//! refreshed in the background; lookups never touch the network.

use crate::config::FeatureSettings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Gate for namespace recommendations
pub const NAMESPACE_FLAG: &str = "rosocp.namespace_enabled";

const ORG_CONTEXT: &str = "orgId";

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("feature flag request failed: {0}")]
    Transport(String),

    #[error("feature flag server returned HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn is_enabled(&self, flag: &str, org_id: Option<&str>) -> bool;
}

/// Same answer for every flag
#[derive(Debug, Clone, Copy)]
pub struct StaticFlags {
    enabled: bool,
}

impl StaticFlags {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl FeatureFlags for StaticFlags {
    async fn is_enabled(&self, _flag: &str, _org_id: Option<&str>) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Constraint {
    #[serde(rename = "contextName")]
    pub context_name: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Strategy {
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Toggle {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
}

#[derive(Debug, Default, Deserialize)]
struct FeaturesResponse {
    #[serde(default)]
    features: Vec<Toggle>,
}

impl Constraint {
    fn matches(&self, org_id: Option<&str>) -> bool {
        // only the org context is ever supplied
        let value = match self.context_name.as_str() {
            ORG_CONTEXT => org_id,
            _ => None,
        };
        let contained = value.is_some_and(|v| self.values.iter().any(|x| x == v));
        match self.operator.as_str() {
            "IN" => contained,
            "NOT_IN" => !contained,
            _ => false,
        }
    }
}

impl Strategy {
    fn matches(&self, org_id: Option<&str>) -> bool {
        if !self.constraints.iter().all(|c| c.matches(org_id)) {
            return false;
        }
        match self.name.as_str() {
            "default" => true,
            // partial percentage rollouts are treated as off
            "flexibleRollout" | "gradualRolloutRandom" => {
                let rollout = self
                    .parameters
                    .get("rollout")
                    .or_else(|| self.parameters.get("percentage"))
                    .and_then(|v| match v {
                        Value::String(s) => s.parse::<u32>().ok(),
                        Value::Number(n) => n.as_u64().map(|n| n as u32),
                        _ => None,
                    });
                rollout == Some(100)
            }
            "userWithId" | "orgIds" => {
                let listed = self
                    .parameters
                    .values()
                    .filter_map(Value::as_str)
                    .flat_map(|s| s.split(','))
                    .map(str::trim)
                    .collect::<Vec<_>>();
                org_id.is_some_and(|org| listed.contains(&org))
            }
            _ => false,
        }
    }
}

impl Toggle {
    pub fn evaluate(&self, org_id: Option<&str>) -> bool {
        self.enabled
            && (self.strategies.is_empty() || self.strategies.iter().any(|s| s.matches(org_id)))
    }
}

/// Client API of an Unleash server
pub struct UnleashFlags {
    client: reqwest::Client,
    features_url: String,
    token: Option<String>,
    app_name: String,
    refresh: Duration,
    toggles: RwLock<HashMap<String, Toggle>>,
}

impl UnleashFlags {
    pub fn new(url: &str, token: Option<String>, app_name: &str, refresh: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            client,
            features_url: format!("{}/client/features", url.trim_end_matches('/')),
            token,
            app_name: app_name.to_string(),
            refresh,
            toggles: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch the toggle set once
    pub async fn refresh(&self) -> Result<usize, FlagError> {
        let mut request = self
            .client
            .get(&self.features_url)
            .header("UNLEASH-APPNAME", &self.app_name);
        if let Some(token) = &self.token {
            request = request.header("Authorization", token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FlagError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FlagError::Status(status.as_u16()));
        }
        let body: FeaturesResponse = response
            .json()
            .await
            .map_err(|e| FlagError::Transport(e.to_string()))?;

        let count = body.features.len();
        let toggles = body.features.into_iter().map(|t| (t.name.clone(), t)).collect();
        *self.toggles.write().await = toggles;
        debug!(toggles = count, "Feature flags refreshed");
        Ok(count)
    }

    /// Refresh on an interval until shutdown
    pub fn spawn_refresh(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "Feature flag refresh failed; keeping cached flags");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl FeatureFlags for UnleashFlags {
    async fn is_enabled(&self, flag: &str, org_id: Option<&str>) -> bool {
        self.toggles
            .read()
            .await
            .get(flag)
            .is_some_and(|t| t.evaluate(org_id))
    }
}

/// Whether namespace recommendations are processed and served for an org
#[derive(Clone)]
pub struct NamespaceGate {
    disabled: bool,
    flags: Arc<dyn FeatureFlags>,
}

impl NamespaceGate {
    pub fn new(disabled: bool, flags: Arc<dyn FeatureFlags>) -> Self {
        Self { disabled, flags }
    }

    pub async fn is_enabled(&self, org_id: &str) -> bool {
        if self.disabled {
            return false;
        }
        let org = (!org_id.is_empty()).then_some(org_id);
        self.flags.is_enabled(NAMESPACE_FLAG, org).await
    }
}

/// Build the gate from settings, starting the Unleash refresher when configured
pub async fn namespace_gate(
    settings: &FeatureSettings,
    app_name: &str,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<NamespaceGate> {
    let flags: Arc<dyn FeatureFlags> = match &settings.unleash_url {
        Some(url) => {
            let unleash = Arc::new(UnleashFlags::new(
                url,
                settings.unleash_token.clone(),
                app_name,
                settings.unleash_refresh,
            )?);
            if let Err(e) = unleash.refresh().await {
                warn!(error = %e, "Initial feature flag fetch failed");
            }
            Arc::clone(&unleash).spawn_refresh(shutdown);
            info!(url = %url, "Unleash feature flags enabled");
            unleash
        }
        None => Arc::new(StaticFlags::new(true)),
    };
    Ok(NamespaceGate::new(settings.disable_namespace_recommendation, flags))
}
