//! Resolved policies: execution plans and reporting trees.
//!
//! Resolution compiles a policy DAG against a set of asset filters into two
//! artifacts: the [`ExecutionJob`] (the flat, CodeID-deduplicated set of
//! queries an agent must run) and the [`CollectorJob`] (the reporting tree
//! that aggregates per-query scores, plus the catalog of expected
//! datapoints). Both are sealed with checksums so identical inputs produce
//! byte-identical plans.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::compiler::CodeBundle;
use crate::policy::checksums::CHECKSUM_VERSION;
use crate::policy::model::{DataType, Impact, Mquery, ScoringSystem};

/// QrID of the apex reporting job; replaced by the asset MRN in reports.
pub const QR_ID_ROOT: &str = "root";

/// How a child contributes to its parent reporting job's score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringSpec {
    /// Relative weight in the parent's aggregation.
    pub weight: u32,
    /// Aggregation system for the child's own subtree.
    pub scoring: ScoringSystem,
    /// Severity override, when the member carries an impact.
    #[serde(default)]
    pub severity: Option<u32>,
}

impl Default for ScoringSpec {
    fn default() -> Self {
        Self {
            weight: 1,
            scoring: ScoringSystem::default(),
            severity: None,
        }
    }
}

impl ScoringSpec {
    /// Builds a spec from an optional member impact.
    #[must_use]
    pub fn from_impact(impact: Option<&Impact>) -> Self {
        match impact {
            None => Self::default(),
            Some(impact) => Self {
                weight: impact.weight,
                scoring: impact.scoring,
                severity: Some(impact.severity),
            },
        }
    }

    fn fold(&self, checksum: Checksum) -> Checksum {
        let severity = self
            .severity
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        checksum
            .add(&self.weight.to_string())
            .add(self.scoring.label())
            .add(&severity)
    }
}

/// A node in the scoring tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportingJob {
    /// Identifier of this node, derived from the resolution inputs.
    pub uuid: String,
    /// MRN of the policy or query this node scores, or `"root"`.
    pub qr_id: String,
    /// Child reporting jobs by UUID, each with its scoring contribution.
    #[serde(default)]
    pub child_jobs: BTreeMap<String, ScoringSpec>,
    /// Datapoint checksums feeding this node.
    #[serde(default)]
    pub datapoints: BTreeSet<String>,
    /// Aggregation system applied across this node's children.
    #[serde(default)]
    pub scoring_system: ScoringSystem,
    /// Structural checksum; see [`ReportingJob::refresh_checksum`].
    #[serde(default)]
    pub checksum: String,
}

impl ReportingJob {
    /// Creates a node with no children or datapoints.
    #[must_use]
    pub fn new(uuid: String, qr_id: String) -> Self {
        Self {
            uuid,
            qr_id,
            ..Self::default()
        }
    }

    /// Recomputes the structural checksum from the QrID, the sorted child
    /// specs, and the sorted datapoints.
    pub fn refresh_checksum(&mut self) {
        let mut checksum = Checksum::new().add(CHECKSUM_VERSION).add(&self.qr_id);
        for (child_uuid, spec) in &self.child_jobs {
            checksum = checksum.add(child_uuid);
            checksum = spec.fold(checksum);
        }
        for datapoint in &self.datapoints {
            checksum = checksum.add(datapoint);
        }
        checksum = checksum.add(self.scoring_system.label());
        self.checksum = checksum.encode();
    }
}

/// One deduplicated query within an execution job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    /// CodeID of the compiled query.
    pub code_id: String,
    /// Query source text.
    #[serde(default)]
    pub mql: String,
    /// Checksums of the datapoints this query reports.
    #[serde(default)]
    pub datapoints: Vec<String>,
    /// The executable artifact.
    pub code: CodeBundle,
    /// Identity checksum over CodeID and datapoints.
    #[serde(default)]
    pub checksum: String,
}

impl ExecutionQuery {
    /// Recomputes the identity checksum.
    pub fn refresh_checksum(&mut self) {
        self.checksum = Checksum::new()
            .add(CHECKSUM_VERSION)
            .add(&self.code_id)
            .add_sorted(self.datapoints.iter())
            .encode();
    }
}

/// The flat set of queries an agent must run on an asset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionJob {
    /// Queries by CodeID.
    #[serde(default)]
    pub queries: BTreeMap<String, ExecutionQuery>,
    /// Seal over all query checksums.
    #[serde(default)]
    pub checksum: String,
}

impl ExecutionJob {
    /// Recomputes the seal: a fold over the sorted queries' checksums.
    pub fn refresh_checksum(&mut self) {
        let mut checksum = Checksum::new().add(CHECKSUM_VERSION);
        for query in self.queries.values() {
            checksum = checksum.add(&query.checksum);
        }
        self.checksum = checksum.encode();
    }
}

/// Catalog entry for one expected datapoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatapointInfo {
    /// Declared type of the datapoint.
    #[serde(default)]
    pub data_type: DataType,
    /// UUIDs of reporting jobs notified when this datapoint arrives.
    #[serde(default)]
    pub notify: Vec<String>,
}

/// The reporting tree plus the datapoint type catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectorJob {
    /// Reporting jobs by UUID.
    #[serde(default)]
    pub reporting_jobs: BTreeMap<String, ReportingJob>,
    /// Expected datapoints by checksum.
    #[serde(default)]
    pub datapoints: BTreeMap<String, DatapointInfo>,
    /// Seal over reporting jobs and datapoints.
    #[serde(default)]
    pub checksum: String,
}

impl CollectorJob {
    /// Recomputes every reporting job checksum, then the collector seal.
    pub fn refresh_checksum(&mut self) {
        for job in self.reporting_jobs.values_mut() {
            job.refresh_checksum();
        }

        let mut checksum = Checksum::new().add(CHECKSUM_VERSION);
        for (uuid, job) in &self.reporting_jobs {
            checksum = checksum.add(uuid).add(&job.checksum);
        }
        for (datapoint, info) in &self.datapoints {
            checksum = checksum.add(datapoint).add(info.data_type.label());
            checksum = checksum.add_sorted(info.notify.iter());
        }
        self.checksum = checksum.encode();
    }
}

/// The compiled artifact of resolving a policy against asset filters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    /// Graph execution checksum of the resolved policy (input identity).
    pub graph_execution_checksum: String,
    /// Checksum over the matching asset filters (input identity).
    pub filters_checksum: String,
    /// The subset of asset filters that matched the policy.
    #[serde(default)]
    pub filters: Vec<Mquery>,
    /// Queries to run.
    pub execution_job: ExecutionJob,
    /// Reporting tree and datapoint catalog.
    pub collector_job: CollectorJob,
    /// UUID of the apex reporting job.
    pub reporting_job_uuid: String,
}

impl ResolvedPolicy {
    /// Approximate in-memory size, used as the cache weight.
    #[must_use]
    pub fn cache_weight(&self) -> u64 {
        serde_json::to_vec(self).map_or(1024, |bytes| bytes.len() as u64)
    }
}
