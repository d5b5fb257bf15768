//! Experiment identity
//!
//! The analyzer knows an experiment only by its name, so the name is the
//! join key between analyzer state and the `workloads` table.

use crate::models::{ExperimentType, WorkloadKind};
use std::fmt;

const SEPARATOR: &str = "|";

/// The tuple identifying one analyzer experiment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExperimentKey {
    pub org_id: String,
    pub source_id: String,
    pub cluster_uuid: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
}

impl ExperimentKey {
    pub fn new(
        org_id: impl Into<String>,
        source_id: impl Into<String>,
        cluster_uuid: impl Into<String>,
        namespace: impl Into<String>,
        kind: WorkloadKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            source_id: source_id.into(),
            cluster_uuid: cluster_uuid.into(),
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    /// Key of the namespace-level experiment; kind and name are both `namespace`
    pub fn for_namespace(
        org_id: impl Into<String>,
        source_id: impl Into<String>,
        cluster_uuid: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self::new(
            org_id,
            source_id,
            cluster_uuid,
            namespace,
            WorkloadKind::Namespace,
            WorkloadKind::Namespace.as_str(),
        )
    }

    /// `org|source|cluster|namespace|kind|name`
    pub fn experiment_name(&self) -> String {
        [
            self.org_id.as_str(),
            self.source_id.as_str(),
            self.cluster_uuid.as_str(),
            self.namespace.as_str(),
            self.kind.as_str(),
            self.name.as_str(),
        ]
        .join(SEPARATOR)
    }

    /// Analyzer `cluster_name`: `org;cluster_uuid`
    pub fn cluster_name(&self) -> String {
        cluster_name(&self.org_id, &self.cluster_uuid)
    }

    pub fn experiment_type(&self) -> ExperimentType {
        if self.kind == WorkloadKind::Namespace {
            ExperimentType::Namespace
        } else {
            ExperimentType::Container
        }
    }

    /// Split an experiment name back into its key
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split(SEPARATOR).collect();
        let [org, source, cluster, namespace, kind, object] = parts.as_slice() else {
            return None;
        };
        let kind = kind.parse().ok()?;
        Some(Self::new(*org, *source, *cluster, *namespace, kind, *object))
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.experiment_name())
    }
}

pub fn cluster_name(org_id: &str, cluster_uuid: &str) -> String {
    format!("{org_id};{cluster_uuid}")
}
