//! Client side of the external recommendation analyzer
//!
//! This module provides:
//! - Request payloads for experiments and usage results ([`payload`])
//! - Recommendation response types and validity rules ([`recommendation`])
//! - The [`Analyzer`] trait and its HTTP implementation ([`KruizeClient`])

mod client;
pub mod payload;
pub mod recommendation;


pub use client::KruizeClient;
pub use payload::{CreateExperiment, UpdateResult};
pub use recommendation::{RecommendedExperiment, Recommendations};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Performance profile every experiment is attached to
pub const PERFORMANCE_PROFILE: &str = "resource-optimization-openshift";

/// Payload version sent with experiments and results
pub const PAYLOAD_VERSION: &str = "v2.0";

/// Profile definition installed by [`Analyzer::bootstrap_profile`]
pub const PERFORMANCE_PROFILE_JSON: &str =
    include_str!("../../profiles/resource_optimization_openshift.json");

/// A measurement interval, `(interval_start, interval_end)`
pub type Interval = (DateTime<Utc>, DateTime<Utc>);

/// Errors returned by analyzer calls
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("experiment {0} is not known to the analyzer")]
    ExperimentMissing(String),

    #[error("recommendation for {experiment} at {end} is not ready")]
    RecommendationNotReady { experiment: String, end: DateTime<Utc> },

    #[error("performance profile is missing")]
    ProfileMissing,

    #[error("analyzer rejected {path} ({status}): {message}")]
    Rejected {
        path: String,
        status: u16,
        message: String,
    },

    #[error("request to {path} failed: {message}")]
    Transport { path: String, message: String },

    #[error("cannot decode response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl AnalyzerError {
    /// Worth another attempt after a delay
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalyzerError::Transport { .. } => true,
            AnalyzerError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Operations the pipeline needs from the analyzer
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Ensure the performance profile exists
    async fn bootstrap_profile(&self) -> Result<(), AnalyzerError>;

    /// Register an experiment; an already registered one counts as success
    async fn create_experiment(&self, experiment: &CreateExperiment) -> Result<(), AnalyzerError>;

    /// Send usage intervals and return the ones the analyzer acknowledged
    async fn update_results(&self, results: &[UpdateResult]) -> Result<Vec<Interval>, AnalyzerError>;

    /// Ask the analyzer to compute recommendations up to `end`
    async fn update_recommendations(
        &self,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError>;

    /// Fetch already computed recommendations
    async fn list_recommendations(
        &self,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError>;

    /// Remove an experiment; an unknown one counts as success
    async fn delete_experiment(&self, experiment_name: &str) -> Result<(), AnalyzerError>;
}
