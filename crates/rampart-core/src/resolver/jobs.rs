//! Turning a policy DAG into execution and collector jobs.
//!
//! [`JobsBuilder`] walks the policy graph (phase 3), producing one
//! reporting job per scoring scope: the root job stands for the resolved
//! policy itself, sub-policy references become child jobs and recurse,
//! checks become leaf jobs. Only groups whose filters match the asset's
//! filter set materialize. Phase 4 then flattens the claimed queries into a
//! CodeID-deduplicated [`ExecutionJob`] and wires datapoints into the
//! [`CollectorJob`]'s catalog, union-merging `notify` lists when one query
//! is claimed by several reporting jobs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::checksum::checksum_strings;
use crate::error::Error;
use crate::policy::{
    BundleMap, CollectorJob, DatapointInfo, ExecutionJob, ExecutionQuery, MemberAction, Mquery,
    PolicyGroup, ReportingJob, ScoringSpec, ScoringSystem, CHECKSUM_VERSION, QR_ID_ROOT,
};

/// Per-scope state of the graph walk.
///
/// Cloned before descending into a sub-policy; the child sets are merged
/// back into the parent scope afterwards.
#[derive(Debug, Clone, Default)]
struct ScopeCache {
    /// Policies marked removed by an override in a descendant.
    removed_policies: BTreeSet<String>,
    /// Queries marked removed by an override in a descendant.
    removed_queries: BTreeSet<String>,
    /// Ancestry of the current scope, for cycle breaking.
    parent_policies: BTreeSet<String>,
    /// Policies contributed by the subtree walked so far.
    child_policies: BTreeSet<String>,
    /// Queries contributed by the subtree walked so far.
    child_queries: BTreeSet<String>,
}

impl ScopeCache {
    fn clone_for_child(&self) -> Self {
        Self {
            removed_policies: self.removed_policies.clone(),
            removed_queries: self.removed_queries.clone(),
            parent_policies: self.parent_policies.clone(),
            child_policies: BTreeSet::new(),
            child_queries: BTreeSet::new(),
        }
    }

    fn add_children(&mut self, other: &Self) {
        self.child_policies
            .extend(other.child_policies.iter().cloned());
        self.child_queries
            .extend(other.child_queries.iter().cloned());
    }
}

/// Builds the reporting tree and query set for one resolution.
pub(crate) struct JobsBuilder<'a> {
    bundle: &'a BundleMap,
    graph_execution_checksum: String,
    filters_checksum: String,
    /// CodeIDs of the asset filters that matched the policy.
    asset_filters: BTreeSet<String>,
    reporting_jobs: BTreeMap<String, ReportingJob>,
    uuid_by_qr_id: BTreeMap<String, String>,
    /// Scoring queries: CodeID to the reporting jobs claiming it.
    scoring_claims: BTreeMap<String, BTreeSet<String>>,
    /// Data-collection queries by CodeID.
    data_queries: BTreeSet<String>,
    queries_by_code_id: BTreeMap<String, Mquery>,
    root_uuid: String,
}

impl<'a> JobsBuilder<'a> {
    /// Creates a builder with the root reporting job in place.
    pub(crate) fn new(
        bundle: &'a BundleMap,
        graph_execution_checksum: String,
        filters_checksum: String,
        asset_filters: BTreeSet<String>,
        root_scoring: ScoringSystem,
    ) -> Self {
        let mut builder = Self {
            bundle,
            graph_execution_checksum,
            filters_checksum,
            asset_filters,
            reporting_jobs: BTreeMap::new(),
            uuid_by_qr_id: BTreeMap::new(),
            scoring_claims: BTreeMap::new(),
            data_queries: BTreeSet::new(),
            queries_by_code_id: BTreeMap::new(),
            root_uuid: String::new(),
        };

        let root_uuid = builder.relative_checksum(QR_ID_ROOT);
        let mut root = ReportingJob::new(root_uuid.clone(), QR_ID_ROOT.to_string());
        root.scoring_system = root_scoring;
        builder.reporting_jobs.insert(root_uuid.clone(), root);
        builder
            .uuid_by_qr_id
            .insert(QR_ID_ROOT.to_string(), root_uuid.clone());
        builder.root_uuid = root_uuid;
        builder
    }

    /// UUID of the apex reporting job.
    pub(crate) fn root_uuid(&self) -> &str {
        &self.root_uuid
    }

    /// Checksum relative to this resolution's identity.
    fn relative_checksum(&self, s: &str) -> String {
        checksum_strings([
            self.graph_execution_checksum.as_str(),
            self.filters_checksum.as_str(),
            CHECKSUM_VERSION,
            s,
        ])
    }

    /// Phase 3 entry point: walk the policy rooted at `policy_mrn` into the
    /// root reporting job.
    pub(crate) fn policy_to_jobs(&mut self, policy_mrn: &str) -> Result<(), Error> {
        let mut scope = ScopeCache::default();
        let root_uuid = self.root_uuid.clone();
        self.walk_policy(policy_mrn, &root_uuid, &mut scope)
    }

    fn walk_policy(
        &mut self,
        policy_mrn: &str,
        owner_uuid: &str,
        parent_scope: &mut ScopeCache,
    ) -> Result<(), Error> {
        let policy = self.bundle.policies.get(policy_mrn).cloned().ok_or_else(|| {
            Error::internal(format!(
                "resolver cannot find policy '{policy_mrn}' in the validated bundle"
            ))
        })?;

        let mut scope = parent_scope.clone_for_child();
        scope.parent_policies.insert(policy_mrn.to_string());

        // First pass: find applicable groups and collect removal overrides,
        // so a later group can remove members an earlier group contributed.
        let matching: Vec<PolicyGroup> = policy
            .groups
            .iter()
            .filter(|g| self.group_applies(g))
            .cloned()
            .collect();

        for group in &matching {
            for policy_ref in &group.policies {
                if policy_ref.action == Some(MemberAction::Remove) {
                    scope.removed_policies.insert(policy_ref.mrn.clone());
                }
            }
            for member in group.checks.iter().chain(group.queries.iter()) {
                if member.action == Some(MemberAction::Remove) {
                    scope.removed_queries.insert(member.mrn.clone());
                }
            }
        }

        for group in &matching {
            for policy_ref in &group.policies {
                if policy_ref.action == Some(MemberAction::Remove)
                    || scope.removed_policies.contains(&policy_ref.mrn)
                {
                    continue;
                }
                if scope.parent_policies.contains(&policy_ref.mrn) {
                    return Err(Error::internal(format!(
                        "circular dependency: policy '{}' is part of its own ancestry",
                        policy_ref.mrn
                    )));
                }

                let child_policy =
                    self.bundle.policies.get(&policy_ref.mrn).cloned().ok_or_else(|| {
                        Error::internal(format!(
                            "resolver cannot find policy '{}' in the validated bundle",
                            policy_ref.mrn
                        ))
                    })?;

                let child_uuid = self.ensure_reporting_job(
                    &policy_ref.mrn,
                    policy_ref
                        .scoring_system
                        .unwrap_or(child_policy.scoring_system),
                );
                let spec = ScoringSpec::from_impact(policy_ref.impact.as_ref());
                self.link(owner_uuid, &child_uuid, spec);

                if scope.child_policies.contains(&policy_ref.mrn) {
                    continue;
                }
                self.walk_policy(&policy_ref.mrn, &child_uuid, &mut scope)?;
                scope.child_policies.insert(policy_ref.mrn.clone());
            }

            for check in &group.checks {
                if check.action == Some(MemberAction::Remove)
                    || scope.removed_queries.contains(&check.mrn)
                {
                    continue;
                }
                let query = self.resolve_query(check)?;
                let rj_uuid =
                    self.ensure_reporting_job(&check.mrn, ScoringSystem::default());
                let spec =
                    ScoringSpec::from_impact(check.impact.as_ref().or(query.impact.as_ref()));
                self.link(owner_uuid, &rj_uuid, spec);

                self.scoring_claims
                    .entry(query.code_id.clone())
                    .or_default()
                    .insert(rj_uuid);
                self.queries_by_code_id
                    .insert(query.code_id.clone(), query);
                scope.child_queries.insert(check.mrn.clone());
            }

            for data_query in &group.queries {
                if data_query.action == Some(MemberAction::Remove)
                    || scope.removed_queries.contains(&data_query.mrn)
                {
                    continue;
                }
                let query = self.resolve_query(data_query)?;
                self.data_queries.insert(query.code_id.clone());
                self.queries_by_code_id
                    .insert(query.code_id.clone(), query);
                scope.child_queries.insert(data_query.mrn.clone());
            }
        }

        parent_scope.add_children(&scope);
        Ok(())
    }

    /// Whether a group's filters intersect the asset's matching filters.
    fn group_applies(&self, group: &PolicyGroup) -> bool {
        if group.filters.is_empty() {
            return true;
        }
        group
            .filters
            .items
            .keys()
            .any(|code_id| self.asset_filters.contains(code_id))
    }

    fn resolve_query(&self, member: &Mquery) -> Result<Mquery, Error> {
        if let Some(query) = self.bundle.queries.get(&member.mrn) {
            let mut query = query.clone();
            if member.impact.is_some() {
                query.impact = member.impact;
            }
            return Ok(query);
        }
        if !member.code_id.is_empty() {
            return Ok(member.clone());
        }
        Err(Error::internal(format!(
            "resolver cannot find query '{}' in the validated bundle",
            member.mrn
        )))
    }

    fn ensure_reporting_job(&mut self, qr_id: &str, scoring: ScoringSystem) -> String {
        if let Some(uuid) = self.uuid_by_qr_id.get(qr_id) {
            return uuid.clone();
        }
        let uuid = self.relative_checksum(qr_id);
        let mut job = ReportingJob::new(uuid.clone(), qr_id.to_string());
        job.scoring_system = scoring;
        self.reporting_jobs.insert(uuid.clone(), job);
        self.uuid_by_qr_id.insert(qr_id.to_string(), uuid.clone());
        uuid
    }

    fn link(&mut self, owner_uuid: &str, child_uuid: &str, spec: ScoringSpec) {
        if let Some(owner) = self.reporting_jobs.get_mut(owner_uuid) {
            owner.child_jobs.insert(child_uuid.to_string(), spec);
        }
    }

    /// Phase 4: flatten claimed queries into the execution job and wire
    /// datapoints into the collector catalog.
    pub(crate) fn jobs_to_queries(mut self) -> Result<(ExecutionJob, CollectorJob), Error> {
        let mut execution = ExecutionJob::default();
        let mut collector = CollectorJob::default();

        let scoring_claims = std::mem::take(&mut self.scoring_claims);
        let data_queries = std::mem::take(&mut self.data_queries);

        for (code_id, claims) in &scoring_claims {
            let (query, code) = self.lookup_code(code_id)?;
            let mut eq = ExecutionQuery {
                code_id: code_id.clone(),
                mql: query.mql.clone(),
                datapoints: code.datapoints.iter().map(|d| d.checksum.clone()).collect(),
                code: code.clone(),
                checksum: String::new(),
            };
            eq.refresh_checksum();
            execution.queries.insert(code_id.clone(), eq);

            for datapoint in &code.datapoints {
                let info = collector
                    .datapoints
                    .entry(datapoint.checksum.clone())
                    .or_insert_with(|| DatapointInfo {
                        data_type: datapoint.data_type,
                        notify: Vec::new(),
                    });
                for rj_uuid in claims {
                    if !info.notify.contains(rj_uuid) {
                        info.notify.push(rj_uuid.clone());
                    }
                }
            }
            for rj_uuid in claims {
                if let Some(job) = self.reporting_jobs.get_mut(rj_uuid) {
                    for datapoint in &code.datapoints {
                        job.datapoints.insert(datapoint.checksum.clone());
                    }
                }
            }
        }

        for code_id in &data_queries {
            let (query, code) = self.lookup_code(code_id)?;
            if !execution.queries.contains_key(code_id) {
                let mut eq = ExecutionQuery {
                    code_id: code_id.clone(),
                    mql: query.mql.clone(),
                    datapoints: code.datapoints.iter().map(|d| d.checksum.clone()).collect(),
                    code: code.clone(),
                    checksum: String::new(),
                };
                eq.refresh_checksum();
                execution.queries.insert(code_id.clone(), eq);
            }
            for datapoint in &code.datapoints {
                collector
                    .datapoints
                    .entry(datapoint.checksum.clone())
                    .or_insert_with(|| DatapointInfo {
                        data_type: datapoint.data_type,
                        notify: Vec::new(),
                    });
            }
        }

        for info in collector.datapoints.values_mut() {
            info.notify.sort();
        }
        collector.reporting_jobs = std::mem::take(&mut self.reporting_jobs);

        debug!(
            queries = execution.queries.len(),
            reporting_jobs = collector.reporting_jobs.len(),
            datapoints = collector.datapoints.len(),
            "aggregated queries and jobs"
        );
        Ok((execution, collector))
    }

    fn lookup_code(&self, code_id: &str) -> Result<(Mquery, crate::compiler::CodeBundle), Error> {
        let query = self.queries_by_code_id.get(code_id).cloned().ok_or_else(|| {
            Error::internal(format!("resolver lost track of query with code ID '{code_id}'"))
        })?;
        let code = self.bundle.code.get(code_id).cloned().ok_or_else(|| {
            Error::not_found(format!("no compiled code for CodeID '{code_id}'"))
        })?;
        Ok((query, code))
    }
}
