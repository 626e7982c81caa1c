//! Core data model: policies, groups, queries, scores, and reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mrn;

/// How a reporting node aggregates the scores of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringSystem {
    /// Weighted average of all child scores.
    #[default]
    Average,
    /// The worst child score wins.
    Worst,
    /// The child with the highest impact (lowest score wins ties).
    #[serde(alias = "highest impact")]
    HighestImpact,
}

impl ScoringSystem {
    /// Stable label used in checksums and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Worst => "worst",
            Self::HighestImpact => "highest impact",
        }
    }
}

/// Scoring impact attached to a check or a sub-policy reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impact {
    /// Severity from 0 (informational) to 100 (critical).
    pub severity: u32,
    /// Aggregation override for the subtree below this member.
    #[serde(default)]
    pub scoring: ScoringSystem,
    /// Relative weight in the parent's aggregation.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

const fn default_weight() -> u32 {
    1
}

impl Default for Impact {
    fn default() -> Self {
        Self {
            severity: 100,
            scoring: ScoringSystem::default(),
            weight: 1,
        }
    }
}

/// Overlay action a group member carries relative to inherited content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberAction {
    /// The member is newly introduced by this policy.
    Add,
    /// The member redefines one inherited from a sub-policy.
    Modify,
    /// The member removes one inherited from a sub-policy.
    Remove,
}

/// A query: either a scoring check or a data-collection query.
///
/// A query's identity for execution is its `code_id` — two queries with the
/// same source collapse to one execution regardless of their MRNs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mquery {
    /// Full MRN; empty until a bundle-local UID is realized.
    #[serde(default)]
    pub mrn: String,
    /// Bundle-local id, only meaningful before MRN realization.
    #[serde(default)]
    pub uid: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Query source text.
    #[serde(default)]
    pub mql: String,
    /// Scoring impact; `None` for pure data queries.
    #[serde(default)]
    pub impact: Option<Impact>,
    /// Overlay action relative to inherited members.
    #[serde(default)]
    pub action: Option<MemberAction>,
    /// Content hash of the compiled form; set by compilation.
    #[serde(default)]
    pub code_id: String,
    /// Properties referenced by this query.
    #[serde(default)]
    pub props: Vec<Property>,
}

impl Mquery {
    /// The identifier to use when indexing: MRN when realized, else UID.
    #[must_use]
    pub fn identifier(&self) -> &str {
        if self.mrn.is_empty() {
            &self.uid
        } else {
            &self.mrn
        }
    }
}

/// A named, reusable query fragment referenced by queries and policies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Property {
    /// Full MRN; empty until realized.
    #[serde(default)]
    pub mrn: String,
    /// Bundle-local id.
    #[serde(default)]
    pub uid: String,
    /// Property source text.
    #[serde(default)]
    pub mql: String,
}

impl Property {
    /// The identifier to use when indexing: MRN when realized, else UID.
    #[must_use]
    pub fn identifier(&self) -> &str {
        if self.mrn.is_empty() {
            &self.uid
        } else {
            &self.mrn
        }
    }
}

/// A reference to a sub-policy from within a group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyRef {
    /// MRN of the referenced policy.
    pub mrn: String,
    /// Overlay action relative to inherited members.
    #[serde(default)]
    pub action: Option<MemberAction>,
    /// Scoring override applied to the referenced policy's node.
    #[serde(default)]
    pub impact: Option<Impact>,
    /// Aggregation override for the referenced policy's node.
    #[serde(default)]
    pub scoring_system: Option<ScoringSystem>,
}

/// Asset filter set keyed by filter CodeID.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filters {
    /// Filter queries, keyed by their CodeID.
    pub items: BTreeMap<String, Mquery>,
}

impl Filters {
    /// Whether the set holds no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts a filter query, keyed by its CodeID.
    ///
    /// Uncompiled filters (empty CodeID) are keyed by their source text
    /// until compilation re-keys them.
    pub fn insert(&mut self, filter: Mquery) {
        let key = if filter.code_id.is_empty() {
            filter.mql.clone()
        } else {
            filter.code_id.clone()
        };
        self.items.insert(key, filter);
    }

    /// Merges another filter set into this one; CodeIDs deduplicate.
    pub fn union(&mut self, other: &Filters) {
        for (code_id, query) in &other.items {
            self.items.insert(code_id.clone(), query.clone());
        }
    }

    /// The sorted CodeIDs of all filters.
    #[must_use]
    pub fn code_ids(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }
}

/// An ordered collection of checks, data queries, and sub-policy references
/// gated by a shared set of filters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyGroup {
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Filters gating this group; empty means always applicable.
    #[serde(default)]
    pub filters: Filters,
    /// Scoring queries.
    #[serde(default)]
    pub checks: Vec<Mquery>,
    /// Data-collection queries.
    #[serde(default)]
    pub queries: Vec<Mquery>,
    /// Sub-policy references.
    #[serde(default)]
    pub policies: Vec<PolicyRef>,
    /// Creation timestamp (unix seconds); documentation-level only.
    #[serde(default)]
    pub created: i64,
    /// Last-modified timestamp (unix seconds); documentation-level only.
    #[serde(default)]
    pub modified: i64,
}

/// A policy author.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Contact email.
    #[serde(default)]
    pub email: String,
}

/// A declarative compliance policy: a tree of checks, data queries, and
/// sub-policy references.
///
/// The four checksum fields span two orthogonal axes — local vs. graph and
/// content vs. execution — and are maintained by
/// [`Policy::update_checksums`](crate::policy::Policy). Empty strings mean
/// "not computed".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Full MRN; empty until a bundle-local UID is realized.
    #[serde(default)]
    pub mrn: String,
    /// Bundle-local id.
    #[serde(default)]
    pub uid: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Semver version string.
    #[serde(default)]
    pub version: String,
    /// MRN of the owning entity.
    #[serde(default)]
    pub owner_mrn: String,
    /// Default aggregation at this policy's reporting node.
    #[serde(default)]
    pub scoring_system: ScoringSystem,
    /// Authors; documentation-level only.
    #[serde(default)]
    pub authors: Vec<Author>,
    /// Free-form tags; documentation-level only.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Member groups in declaration order.
    #[serde(default)]
    pub groups: Vec<PolicyGroup>,
    /// Properties declared by this policy.
    #[serde(default)]
    pub props: Vec<Property>,
    /// Effective asset filters: own group filters plus every transitive
    /// dependency's filters, keyed by CodeID.
    #[serde(default)]
    pub filters: Filters,
    /// Hash of this policy's own documentation-level fields.
    #[serde(default)]
    pub local_content_checksum: String,
    /// Hash of this policy's own execution-relevant fields.
    #[serde(default)]
    pub local_execution_checksum: String,
    /// Local content plus the graph content of every dependency.
    #[serde(default)]
    pub graph_content_checksum: String,
    /// Local execution plus every dependency's graph execution plus the
    /// filters checksum.
    #[serde(default)]
    pub graph_execution_checksum: String,
}

impl Policy {
    /// Creates the implicit wrapper policy for an asset.
    ///
    /// The wrapper's sole purpose is to hold the list of policies assigned
    /// to the asset; it starts with one empty group that assignment deltas
    /// mutate.
    #[must_use]
    pub fn for_asset(asset_mrn: &str, owner_mrn: &str) -> Self {
        Self {
            mrn: asset_mrn.to_string(),
            name: asset_mrn.to_string(),
            version: "n/a".to_string(),
            owner_mrn: owner_mrn.to_string(),
            groups: vec![PolicyGroup::default()],
            ..Self::default()
        }
    }

    /// Whether this policy is an asset wrapper policy.
    #[must_use]
    pub fn is_asset_policy(&self) -> bool {
        mrn::Mrn::parse(&self.mrn)
            .map(|m| m.resource() == mrn::RESOURCE_ASSET)
            .unwrap_or(false)
    }
}

/// The determination state of a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    /// No result has been reported yet.
    #[default]
    Unknown,
    /// A concrete result was computed.
    Result,
    /// The query errored.
    Error,
    /// The query was skipped.
    Skip,
}

/// A score for one query or policy node on one asset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Score {
    /// The MRN of the policy or query this score belongs to.
    #[serde(default)]
    pub qr_id: String,
    /// Determination state.
    #[serde(default)]
    pub score_type: ScoreType,
    /// Score value from 0 (failing) to 100 (passing).
    #[serde(default)]
    pub value: u32,
    /// Relative weight in the parent's aggregation.
    #[serde(default)]
    pub weight: u32,
    /// Number of datapoints expected for this node.
    #[serde(default)]
    pub data_total: u32,
    /// Percentage of expected datapoints that have arrived.
    #[serde(default)]
    pub data_completion: u32,
    /// Percentage of descendant scores that are determined.
    #[serde(default)]
    pub score_completion: u32,
    /// Optional human-readable message (e.g. error text).
    #[serde(default)]
    pub message: String,
    /// Unix time the value last changed.
    #[serde(default)]
    pub value_modified_time: i64,
    /// Unix time of the first failure after the most recent passing state;
    /// 0 while passing.
    #[serde(default)]
    pub failure_time: i64,
}

/// The declared type of a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// No type declared; accepts anything.
    #[default]
    Unset,
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Ordered list.
    Array,
    /// Keyed map.
    Map,
}

impl DataType {
    /// Human-readable label for logs and error messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Map => "map",
        }
    }
}

/// A single typed result cell produced by query execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataValue {
    /// Declared type of the value.
    #[serde(default)]
    pub data_type: DataType,
    /// The value itself; `null` marks an initialized-but-empty slot.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl DataValue {
    /// Whether the value is empty.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.value.is_null()
    }

    /// Loose truthiness used when deriving check outcomes from datapoints.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match &self.value {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
        }
    }
}

/// Scores and data stitched together for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Report {
    /// The asset the report covers.
    pub entity_mrn: String,
    /// The policy or query MRN the top-level score refers to.
    pub scoring_mrn: String,
    /// The top-level score.
    pub score: Score,
    /// Determined scores by QrID.
    #[serde(default)]
    pub scores: BTreeMap<String, Score>,
    /// Collected data values by datapoint checksum; nil slots omitted.
    #[serde(default)]
    pub data: BTreeMap<String, DataValue>,
    /// Version tag of the resolved policy the scores were produced under.
    #[serde(default)]
    pub resolved_policy_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_policy_has_one_empty_group() {
        let p = Policy::for_asset("//d.example.com/assets/a1", "//d.example.com");
        assert_eq!(p.groups.len(), 1);
        assert!(p.groups[0].policies.is_empty());
        assert!(p.is_asset_policy());
        assert_eq!(p.version, "n/a");
    }

    #[test]
    fn non_asset_mrn_is_not_asset_policy() {
        let p = Policy {
            mrn: "//d.example.com/policies/p1".to_string(),
            ..Policy::default()
        };
        assert!(!p.is_asset_policy());
    }

    #[test]
    fn filters_union_dedups_by_code_id() {
        let mut a = Filters::default();
        a.insert(Mquery {
            code_id: "c1".to_string(),
            mql: "asset.family.contains('unix')".to_string(),
            ..Mquery::default()
        });

        let mut b = Filters::default();
        b.insert(Mquery {
            code_id: "c1".to_string(),
            mql: "asset.family.contains('unix')".to_string(),
            ..Mquery::default()
        });
        b.insert(Mquery {
            code_id: "c2".to_string(),
            mql: "asset.platform == 'debian'".to_string(),
            ..Mquery::default()
        });

        a.union(&b);
        assert_eq!(a.code_ids(), vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn data_value_truthiness() {
        let truthy = DataValue {
            data_type: DataType::Int,
            value: serde_json::json!(22),
        };
        assert!(truthy.is_truthy());

        let falsy = DataValue {
            data_type: DataType::Bool,
            value: serde_json::json!(false),
        };
        assert!(!falsy.is_truthy());

        let nil = DataValue::default();
        assert!(nil.is_nil());
        assert!(!nil.is_truthy());
    }

    #[test]
    fn identifier_prefers_mrn() {
        let q = Mquery {
            mrn: "//d.example.com/queries/q1".to_string(),
            uid: "q1".to_string(),
            ..Mquery::default()
        };
        assert_eq!(q.identifier(), "//d.example.com/queries/q1");

        let unrealized = Mquery {
            uid: "q1".to_string(),
            ..Mquery::default()
        };
        assert_eq!(unrealized.identifier(), "q1");
    }
}
