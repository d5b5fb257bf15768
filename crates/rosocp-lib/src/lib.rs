//! Resource optimization pipeline for OpenShift workloads
//!
//! This crate provides the core functionality for:
//! - Loading and aggregating usage reports uploaded by clusters
//! - Driving analyzer experiments (Kruize) and polling for recommendations
//! - Persisting workloads, metrics and recommendations
//! - Serving recommendations through an RBAC-aware read API
//! - Housekeeping (source deletion, partition retention)

pub mod api;
pub mod bus;
pub mod config;
pub mod experiment;
pub mod featureflags;
pub mod health;
pub mod housekeeper;
pub mod identity;
pub mod kruize;
pub mod models;
pub mod observability;
pub mod poller;
pub mod probes;
pub mod processor;
pub mod rbac;
pub mod report;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Settings;
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::PipelineMetrics;
