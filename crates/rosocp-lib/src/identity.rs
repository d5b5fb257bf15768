//! Caller identity for the read API
//!
//! Two providers exist, chosen per process by `ID_PROVIDER`:
//! - `rhsso`: a base64 JSON `X-Rh-Identity` header set by the platform gateway
//! - `oauth2`: an `Authorization: Bearer` token checked with a TokenReview call

use crate::config::{ApiSettings, AuthMode};
use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const RH_IDENTITY_HEADER: &str = "x-rh-identity";
const AUTHORIZATION_HEADER: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("Missing {0} header")]
    Missing(&'static str),

    #[error("Unable to decode {0}")]
    Malformed(String),

    #[error("{0}")]
    Invalid(String),

    #[error("Failed to validate token: {0}")]
    Review(String),
}

impl IdentityError {
    /// Whether the failure is on the server side rather than the caller's
    pub fn is_internal(&self) -> bool {
        matches!(self, IdentityError::Review(_))
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub org_id: String,
    pub account_number: Option<String>,
    pub username: Option<String>,
    /// Identity header forwarded to the access service
    pub header: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XrhInternal {
    #[serde(default)]
    org_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XrhUser {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XrhIdentity {
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    account_number: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    internal: Option<XrhInternal>,
    #[serde(default)]
    user: Option<XrhUser>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XrhEnvelope {
    identity: XrhIdentity,
}

/// Decode an `X-Rh-Identity` header value
pub fn decode_rh_identity(header: &str) -> Result<Identity, IdentityError> {
    let bytes = STANDARD
        .decode(header.trim())
        .map_err(|_| IdentityError::Malformed("X-Rh-Identity".into()))?;
    let envelope: XrhEnvelope = serde_json::from_slice(&bytes)
        .map_err(|_| IdentityError::Invalid("Unable to marshal X-Rh-Identity into struct".into()))?;
    let identity = envelope.identity;

    let org_id = identity
        .org_id
        .filter(|o| !o.is_empty())
        .or_else(|| identity.internal.and_then(|i| i.org_id))
        .filter(|o| !o.is_empty())
        .ok_or_else(|| IdentityError::Invalid("X-Rh-Identity has no org_id".into()))?;

    Ok(Identity {
        org_id,
        account_number: identity.account_number.filter(|a| !a.is_empty()),
        username: identity.user.and_then(|u| u.username),
        header: header.trim().to_string(),
    })
}

/// Encode an identity header for a caller authenticated another way
pub fn encode_rh_identity(org_id: &str, username: Option<&str>) -> String {
    let envelope = XrhEnvelope {
        identity: XrhIdentity {
            org_id: Some(org_id.to_string()),
            kind: Some("User".into()),
            internal: Some(XrhInternal {
                org_id: Some(org_id.to_string()),
            }),
            user: Some(XrhUser {
                username: username.map(str::to_string),
            }),
            ..Default::default()
        },
    };
    STANDARD.encode(serde_json::to_vec(&envelope).unwrap_or_default())
}

/// Extract the token from an `Authorization: Bearer` value
pub fn bearer_token(value: &str) -> Result<&str, IdentityError> {
    let token = value.strip_prefix(BEARER_PREFIX).ok_or_else(|| {
        IdentityError::Invalid(
            "Invalid Authorization header format, must start with 'Bearer '".into(),
        )
    })?;
    let token = token.trim();
    if token.is_empty() {
        return Err(IdentityError::Invalid("Empty token in Authorization header".into()));
    }
    Ok(token)
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str, label: &'static str) -> Result<&'a str, IdentityError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::Missing(label))
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, IdentityError>;
}

/// Trusts the gateway's identity header
#[derive(Debug, Clone, Copy, Default)]
pub struct RhIdentityAuth;

#[async_trait]
impl Authenticator for RhIdentityAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, IdentityError> {
        decode_rh_identity(header(headers, RH_IDENTITY_HEADER, "X-Rh-Identity")?)
    }
}

#[derive(Debug, Deserialize)]
struct ReviewUser {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    extra: std::collections::HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    user: Option<ReviewUser>,
}

#[derive(Debug, Deserialize)]
struct TokenReview {
    #[serde(default)]
    status: Option<ReviewStatus>,
}

/// Validates bearer tokens against a TokenReview endpoint
pub struct TokenReviewAuth {
    client: reqwest::Client,
    review_url: String,
    auth_token: Option<String>,
    default_org_id: String,
}

impl TokenReviewAuth {
    pub fn new(
        review_url: &str,
        auth_token: Option<String>,
        default_org_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            client,
            review_url: review_url.to_string(),
            auth_token,
            default_org_id: default_org_id.to_string(),
        })
    }

    async fn review(&self, token: &str) -> Result<ReviewStatus, IdentityError> {
        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenReview",
            "spec": {"token": token},
        });
        let mut request = self.client.post(&self.review_url).json(&body);
        if let Some(auth) = &self.auth_token {
            request = request.bearer_auth(auth);
        }
        let response = request
            .send()
            .await
            .map_err(|e| IdentityError::Review(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "TokenReview request rejected");
            return Err(IdentityError::Review(format!("HTTP {}", status.as_u16())));
        }
        let review: TokenReview = response
            .json()
            .await
            .map_err(|e| IdentityError::Review(e.to_string()))?;
        review
            .status
            .ok_or_else(|| IdentityError::Invalid("User information is missing from TokenReview API".into()))
    }
}

#[async_trait]
impl Authenticator for TokenReviewAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, IdentityError> {
        let token = bearer_token(header(headers, AUTHORIZATION_HEADER, "Authorization")?)?;
        let status = self.review(token).await?;
        if !status.authenticated {
            return Err(IdentityError::Invalid("Invalid or expired token".into()));
        }
        let user = status
            .user
            .ok_or_else(|| IdentityError::Invalid("User information is missing from TokenReview API".into()))?;

        let org_id = user
            .extra
            .get("org_id")
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_else(|| self.default_org_id.clone());
        debug!(org_id = %org_id, username = ?user.username, "Token validated");

        Ok(Identity {
            header: encode_rh_identity(&org_id, user.username.as_deref()),
            org_id,
            account_number: None,
            username: user.username,
        })
    }
}

/// The authenticator selected by `ID_PROVIDER`
pub fn authenticator(settings: &ApiSettings, timeout: Duration) -> anyhow::Result<Box<dyn Authenticator>> {
    match settings.auth_mode {
        AuthMode::RhIdentity => Ok(Box::new(RhIdentityAuth)),
        AuthMode::BearerToken => {
            let url = settings
                .token_review_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("TOKEN_REVIEW_URL is required for the oauth2 provider"))?;
            Ok(Box::new(TokenReviewAuth::new(
                url,
                settings.token_review_auth_token.clone(),
                &settings.default_org_id,
                timeout,
            )?))
        }
    }
}
