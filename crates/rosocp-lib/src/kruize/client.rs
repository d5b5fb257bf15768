//! HTTP client for the analyzer REST API

use super::payload::kruize_time;
use super::{
    Analyzer, AnalyzerError, CreateExperiment, Interval, RecommendedExperiment, UpdateResult,
    PERFORMANCE_PROFILE, PERFORMANCE_PROFILE_JSON,
};
use crate::config::KruizeSettings;
use crate::observability::PipelineMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const PROFILE_ATTEMPTS: u32 = 5;

const DUPLICATE_EXPERIMENT: [&str; 2] = ["is duplicate", "Experiment name already exists"];
const DUPLICATE_RESULT: [&str; 2] = [
    "already contains result for timestamp",
    "An entry for this record already exists",
];
const PROFILE_MISSING: &str = "Performance Profile doesn't exist";
const PROFILE_NULL: &str = "\"performanceProfile\" is null";
const EXPERIMENT_NOT_FOUND: &str = "Experiment not found";

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Vec<IntervalError>,
}

#[derive(Debug, Deserialize)]
struct IntervalError {
    #[serde(default)]
    interval_start_time: Option<String>,
    #[serde(default)]
    interval_end_time: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProfileSummary {
    #[serde(default)]
    name: String,
}

/// Analyzer client over reqwest
pub struct KruizeClient {
    client: Client,
    base_url: String,
    max_chunk: usize,
    profile_retry_delay: Duration,
    metrics: PipelineMetrics,
}

impl KruizeClient {
    pub fn new(settings: &KruizeSettings, metrics: PipelineMetrics) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Url::parse(&settings.url).map_err(|e| anyhow::anyhow!("Invalid analyzer URL: {e}"))?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            max_chunk: settings.max_bulk_chunk_size.max(1),
            profile_retry_delay: settings.profile_retry_delay,
            metrics,
        })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, AnalyzerError> {
        let raw = format!("{}/{}", self.base_url, path);
        Url::parse_with_params(&raw, query).map_err(|e| AnalyzerError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn transport(&self, path: &str, err: reqwest::Error) -> AnalyzerError {
        self.metrics.inc_kruize_exception(path);
        AnalyzerError::Transport {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    async fn error_body(response: Response) -> (u16, ErrorBody) {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(ErrorBody {
            message: text,
            data: Vec::new(),
        });
        (status, body)
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T, AnalyzerError> {
        let text = response.text().await.map_err(|e| AnalyzerError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        debug!(path, body = %text, "Analyzer response");
        serde_json::from_str(&text).map_err(|e| AnalyzerError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn rejected(&self, path: &str, status: u16, message: String) -> AnalyzerError {
        self.metrics.inc_kruize_exception(path);
        AnalyzerError::Rejected {
            path: path.to_string(),
            status,
            message,
        }
    }

    async fn profile_installed(&self) -> Result<bool, AnalyzerError> {
        let path = "listPerformanceProfiles";
        let response = self
            .client
            .get(self.url(path, &[])?)
            .send()
            .await
            .map_err(|e| self.transport(path, e))?;
        if !response.status().is_success() {
            let (status, body) = Self::error_body(response).await;
            return Err(self.rejected(path, status, body.message));
        }
        let profiles: Vec<ProfileSummary> = Self::decode(path, response).await.unwrap_or_default();
        Ok(profiles.iter().any(|p| p.name == PERFORMANCE_PROFILE))
    }

    async fn install_profile(&self) -> Result<(), AnalyzerError> {
        let path = "createPerformanceProfile";
        let response = self
            .client
            .post(self.url(path, &[])?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(PERFORMANCE_PROFILE_JSON)
            .send()
            .await
            .map_err(|e| self.transport(path, e))?;
        match response.status() {
            StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            _ => {
                let (status, body) = Self::error_body(response).await;
                if body.message.contains("is duplicate") || body.message.contains("already exists") {
                    return Ok(());
                }
                Err(self.rejected(path, status, body.message))
            }
        }
    }

    async fn try_bootstrap(&self) -> Result<(), AnalyzerError> {
        if self.profile_installed().await? {
            debug!(profile = PERFORMANCE_PROFILE, "Performance profile already installed");
            return Ok(());
        }
        self.install_profile().await?;
        info!(profile = PERFORMANCE_PROFILE, "Performance profile created");
        Ok(())
    }

    async fn post_experiment(&self, experiment: &CreateExperiment) -> Result<(), AnalyzerError> {
        let path = "createExperiment";
        let response = self
            .client
            .post(self.url(path, &[])?)
            .json(&[experiment])
            .send()
            .await
            .map_err(|e| self.transport(path, e))?;
        if response.status() == StatusCode::CREATED {
            self.metrics.inc_experiments_created();
            return Ok(());
        }
        let (status, body) = Self::error_body(response).await;
        if DUPLICATE_EXPERIMENT.iter().any(|m| body.message.contains(m)) {
            debug!(experiment = %experiment.experiment_name, "Experiment already exists");
            return Ok(());
        }
        if body.message.contains(PROFILE_MISSING) {
            return Err(AnalyzerError::ProfileMissing);
        }
        Err(self.rejected(path, status, body.message))
    }

    /// Post one chunk and work out which intervals were accepted
    async fn post_results(&self, chunk: &[UpdateResult]) -> Result<Vec<Interval>, AnalyzerError> {
        let path = "updateResults";
        let response = self
            .client
            .post(self.url(path, &[])?)
            .json(chunk)
            .send()
            .await
            .map_err(|e| self.transport(path, e))?;
        let all: Vec<Interval> = chunk.iter().map(UpdateResult::interval).collect();
        if response.status() == StatusCode::CREATED {
            return Ok(all);
        }

        let (status, body) = Self::error_body(response).await;
        if body.message.contains(PROFILE_NULL) {
            return Err(AnalyzerError::ProfileMissing);
        }
        let experiment = chunk
            .first()
            .map(|r| r.experiment_name.clone())
            .unwrap_or_default();
        let messages = || {
            std::iter::once(body.message.as_str())
                .chain(body.data.iter().flat_map(|d| d.errors.iter().map(|e| e.message.as_str())))
        };
        if messages().any(|m| m.contains(EXPERIMENT_NOT_FOUND)) {
            return Err(AnalyzerError::ExperimentMissing(experiment));
        }
        if DUPLICATE_RESULT.iter().any(|d| body.message.contains(d)) && body.data.is_empty() {
            return Ok(all);
        }
        if body.data.is_empty() {
            return Err(self.rejected(path, status, body.message));
        }

        let mut failed: HashSet<(String, String)> = HashSet::new();
        for entry in &body.data {
            let duplicate = !entry.errors.is_empty()
                && entry
                    .errors
                    .iter()
                    .all(|e| DUPLICATE_RESULT.iter().any(|d| e.message.contains(d)));
            if duplicate {
                continue;
            }
            for e in &entry.errors {
                error!(experiment = %experiment, error = %e.message, "Interval rejected by analyzer");
            }
            failed.insert((
                entry.interval_start_time.clone().unwrap_or_default(),
                entry.interval_end_time.clone().unwrap_or_default(),
            ));
        }
        if !failed.is_empty() {
            self.metrics.inc_kruize_exception(path);
        }

        Ok(all
            .into_iter()
            .filter(|(start, end)| {
                !failed.contains(&(kruize_time::format(start), kruize_time::format(end)))
            })
            .collect())
    }

    async fn recommendations(
        &self,
        path: &str,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError> {
        let url = self.url(
            path,
            &[
                ("experiment_name", experiment_name.to_string()),
                ("monitoring_end_time", kruize_time::format(&end)),
            ],
        )?;
        let request = if path == "listRecommendations" {
            self.client.get(url)
        } else {
            self.client.post(url)
        };
        let response = request.send().await.map_err(|e| self.transport(path, e))?;
        if response.status().is_success() {
            return Self::decode(path, response).await;
        }

        let (status, body) = Self::error_body(response).await;
        if status == 400
            && body.message.contains("Recommendation for timestamp")
            && body.message.contains("does not exist")
        {
            return Err(AnalyzerError::RecommendationNotReady {
                experiment: experiment_name.to_string(),
                end,
            });
        }
        Err(self.rejected(path, status, body.message))
    }
}

#[async_trait]
impl Analyzer for KruizeClient {
    async fn bootstrap_profile(&self) -> Result<(), AnalyzerError> {
        let mut attempt = 1;
        loop {
            match self.try_bootstrap().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < PROFILE_ATTEMPTS => {
                    warn!(
                        attempt,
                        retry_in_secs = self.profile_retry_delay.as_secs(),
                        error = %e,
                        "Performance profile setup failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.profile_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_experiment(&self, experiment: &CreateExperiment) -> Result<(), AnalyzerError> {
        match self.post_experiment(experiment).await {
            Err(AnalyzerError::ProfileMissing) => {
                warn!(experiment = %experiment.experiment_name, "Performance profile missing, installing");
                self.bootstrap_profile().await?;
                self.post_experiment(experiment).await
            }
            other => other,
        }
    }

    async fn update_results(&self, results: &[UpdateResult]) -> Result<Vec<Interval>, AnalyzerError> {
        let mut acknowledged = Vec::with_capacity(results.len());

        for chunk in results.chunks(self.max_chunk) {
            let outcome = match self.post_results(chunk).await {
                Err(AnalyzerError::ProfileMissing) => {
                    warn!("Performance profile missing, installing");
                    match self.bootstrap_profile().await {
                        Ok(()) => self.post_results(chunk).await,
                        Err(e) => Err(e),
                    }
                }
                other => other,
            };
            match outcome {
                Ok(intervals) => acknowledged.extend(intervals),
                // Later chunks would fail the same way
                Err(e @ AnalyzerError::ExperimentMissing(_)) => return Err(e),
                Err(e) => error!(error = %e, size = chunk.len(), "Result chunk rejected"),
            }
        }
        Ok(acknowledged)
    }

    async fn update_recommendations(
        &self,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError> {
        self.recommendations("updateRecommendations", experiment_name, end)
            .await
    }

    async fn list_recommendations(
        &self,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError> {
        self.recommendations("listRecommendations", experiment_name, end)
            .await
    }

    async fn delete_experiment(&self, experiment_name: &str) -> Result<(), AnalyzerError> {
        let path = "deleteExperiment";
        let response = self
            .client
            .post(self.url(path, &[("name", experiment_name.to_string())])?)
            .send()
            .await
            .map_err(|e| self.transport(path, e))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let (status, body) = Self::error_body(response).await;
        Err(self.rejected(path, status, body.message))
    }
}
