//! Core data types shared across the pipeline
//!
//! Bus envelopes (ingest, recommendation-due, sources events) and the
//! workload kinds recognized by the analyzer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kubernetes object kinds that can back an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    DeploymentConfig,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    ReplicationController,
    Namespace,
}

impl WorkloadKind {
    /// Kinds accepted in the `workload_type` column of an uploaded report
    pub const REPORTED: [WorkloadKind; 6] = [
        WorkloadKind::Deployment,
        WorkloadKind::DeploymentConfig,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
        WorkloadKind::ReplicaSet,
        WorkloadKind::ReplicationController,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::DeploymentConfig => "deploymentconfig",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::ReplicaSet => "replicaset",
            WorkloadKind::ReplicationController => "replicationcontroller",
            WorkloadKind::Namespace => "namespace",
        }
    }

    /// Parse a reported workload type, case-insensitively
    ///
    /// Returns `None` for `namespace` and anything outside [`Self::REPORTED`].
    pub fn from_reported(value: &str) -> Option<Self> {
        let lowered = value.trim().to_lowercase();
        Self::REPORTED.into_iter().find(|k| k.as_str() == lowered)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("namespace") {
            return Ok(WorkloadKind::Namespace);
        }
        Self::from_reported(s).ok_or_else(|| ValidationError::new(format!("unknown workload kind {s:?}")))
    }
}

/// Granularity of an analyzer experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentType {
    #[default]
    Container,
    Namespace,
}

impl ExperimentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentType::Container => "container",
            ExperimentType::Namespace => "namespace",
        }
    }
}

impl fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural validation failure of a bus envelope
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid message: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new(format!("{field} is required")))
    } else {
        Ok(())
    }
}

/// Upload announcement consumed by the ingest processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestMessage {
    pub request_id: String,
    pub b64_identity: String,
    pub metadata: IngestMetadata,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestMetadata {
    #[serde(default)]
    pub account: String,
    pub org_id: String,
    pub source_id: String,
    pub cluster_uuid: String,
    pub cluster_alias: String,
}

impl IngestMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("request_id", &self.request_id)?;
        require("b64_identity", &self.b64_identity)?;
        require("metadata.org_id", &self.metadata.org_id)?;
        require("metadata.source_id", &self.metadata.source_id)?;
        require("metadata.cluster_uuid", &self.metadata.cluster_uuid)?;
        require("metadata.cluster_alias", &self.metadata.cluster_alias)?;
        if self.files.is_empty() {
            return Err(ValidationError::new("files must not be empty"));
        }
        for file in &self.files {
            let url = url::Url::parse(file)
                .map_err(|e| ValidationError::new(format!("file {file:?} is not a URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ValidationError::new(format!("file {file:?} is not an http(s) URL")));
            }
        }
        Ok(())
    }
}

/// Hand-off from the ingest processor to the recommendation poller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationDue {
    pub request_id: String,
    pub metadata: RecommendationDueMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationDueMetadata {
    pub org_id: String,
    pub workload_id: i64,
    pub experiment_name: String,
    pub max_endtime_report: DateTime<Utc>,
    #[serde(default)]
    pub new_record: bool,
    #[serde(default)]
    pub experiment_type: ExperimentType,
}

impl RecommendationDue {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("request_id", &self.request_id)?;
        require("metadata.org_id", &self.metadata.org_id)?;
        require("metadata.experiment_name", &self.metadata.experiment_name)?;
        if self.metadata.workload_id <= 0 {
            return Err(ValidationError::new("metadata.workload_id must be positive"));
        }
        Ok(())
    }
}

/// Application lifecycle event published by the sources service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesEvent {
    pub id: i64,
    pub source_id: i64,
    pub application_type_id: i64,
    pub tenant: String,
}

impl SourcesEvent {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id <= 0 {
            return Err(ValidationError::new("source_id is required"));
        }
        require("tenant", &self.tenant)
    }
}
