//! Content-addressed datalake: the in-memory reference store.
//!
//! The datalake wraps a size-weighted LRU cache with namespaced keys:
//!
//! ```text
//! policy/<mrn>                                  wrapped policy + edges
//! asset/<mrn>                                   asset wrapper
//! query/<mrn>                                   query + compiled code
//! data/<assetMrn>\0<checksum>                   datapoint slot
//! score/<assetMrn>\0<qrId>                      score slot
//! resolvedPolicy/<graphChk>\0<filtersChk>       resolved policy (own LRU)
//! ```
//!
//! The nul separator keeps composite keys unambiguous. Every write goes
//! through the cache in one `set`, so partial updates are impossible; a
//! refused write surfaces as `Unavailable` rather than being dropped.
//!
//! Parent/child edges between policies are stored as two mirrored sets on
//! the wrapped policies (`children` on the parent, `parents` on the child).
//! Mutations write both ends; a failure of the second write is reported as a
//! failed mutation.
//!
//! A durable backend must preserve the key namespace bit-exactly to be
//! swap-compatible.

mod scores;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use crate::cache::KvCache;
use crate::compiler::CodeBundle;
use crate::error::Error;
use crate::mrn;
use crate::policy::{
    BundleMap, DataValue, DependencyResolver, Mquery, Policy, PolicyRef, ResolvedPolicy, Score,
};

pub use scores::RESOLVED_POLICY_VERSION;

/// Default weight capacity of the main store (entries weigh 1-2 units).
pub const DEFAULT_STORE_WEIGHT: u64 = 200_000;

/// Default size of the resolved-policy cache: 50 MiB.
pub const DEFAULT_RESOLVED_POLICY_CACHE_SIZE: u64 = 50 * 1024 * 1024;

const WEIGHT_POLICY: u64 = 2;
const WEIGHT_ASSET: u64 = 1;
const WEIGHT_QUERY: u64 = 1;
pub(crate) const WEIGHT_SLOT: u64 = 1;

/// A policy as stored, with graph edges and invalidation state.
#[derive(Debug, Clone, Default)]
pub struct WrapPolicy {
    /// The policy itself.
    pub policy: Policy,
    /// MRNs of policies that reference this one.
    pub parents: BTreeSet<String>,
    /// MRNs of policies this one references.
    pub children: BTreeSet<String>,
    /// When true, any cached resolved policy for this MRN is stale.
    pub invalidated: bool,
}

/// An asset as stored.
#[derive(Debug, Clone, Default)]
pub struct WrapAsset {
    /// The asset's MRN.
    pub mrn: String,
    /// The resolved policy currently bound to the asset.
    pub resolved_policy: Option<Arc<ResolvedPolicy>>,
    /// Version tag under which the resolved policy was bound.
    pub resolved_policy_version: String,
}

/// A query as stored, together with its compiled code.
#[derive(Debug, Clone, Default)]
pub struct WrapQuery {
    /// The query.
    pub query: Mquery,
    /// The compiled executable, when compilation has happened.
    pub code: Option<CodeBundle>,
}

#[derive(Clone)]
pub(crate) enum CacheValue {
    Policy(WrapPolicy),
    Asset(WrapAsset),
    Query(WrapQuery),
    Score(Score),
    Data(DataValue),
}

/// Whether an assignment delta adds or removes a child policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDeltaAction {
    /// Add the policy as a child; idempotent.
    Add,
    /// Remove the policy from the children; idempotent.
    Delete,
}

/// A set of child-policy changes against one target policy.
#[derive(Debug, Clone)]
pub struct PolicyMutationDelta {
    /// MRN of the policy to mutate (often an asset's wrapper policy).
    pub policy_mrn: String,
    /// Actions by child policy MRN.
    pub policy_deltas: BTreeMap<String, PolicyDeltaAction>,
}

type NowFn = dyn Fn() -> i64 + Send + Sync;

/// The in-memory, write-through reference datalake.
pub struct Datalake {
    cache: KvCache<CacheValue>,
    pub(crate) resolved_policies: KvCache<Arc<ResolvedPolicy>>,
    pub(crate) now: Box<NowFn>,
}

impl Default for Datalake {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn key_policy(mrn: &str) -> String {
    format!("policy/{mrn}")
}

pub(crate) fn key_asset(mrn: &str) -> String {
    format!("asset/{mrn}")
}

pub(crate) fn key_query(mrn: &str) -> String {
    format!("query/{mrn}")
}

pub(crate) fn key_data(asset_mrn: &str, checksum: &str) -> String {
    format!("data/{asset_mrn}\x00{checksum}")
}

pub(crate) fn key_score(asset_mrn: &str, qr_id: &str) -> String {
    format!("score/{asset_mrn}\x00{qr_id}")
}

pub(crate) fn key_resolved(graph_checksum: &str, filters_checksum: &str) -> String {
    format!("resolvedPolicy/{graph_checksum}\x00{filters_checksum}")
}

impl Datalake {
    /// Creates a datalake with default cache sizes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: KvCache::new(DEFAULT_STORE_WEIGHT),
            resolved_policies: KvCache::new(DEFAULT_RESOLVED_POLICY_CACHE_SIZE),
            now: Box::new(unix_now),
        }
    }

    /// Creates a datalake with a custom resolved-policy cache size.
    #[must_use]
    pub fn with_resolved_policy_cache_size(size: u64) -> Self {
        Self {
            resolved_policies: KvCache::new(size),
            ..Self::new()
        }
    }

    /// Replaces the time source; scores use it for temporal bookkeeping.
    #[must_use]
    pub fn with_now_provider(mut self, now: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.now = Box::new(now);
        self
    }

    // ========================================================================
    // Policies
    // ========================================================================

    /// Returns the stored policy wrapper, including its graph edges.
    ///
    /// # Errors
    ///
    /// `NotFound` when no policy is stored under `mrn`.
    pub fn get_policy_wrapper(&self, mrn: &str) -> Result<WrapPolicy, Error> {
        match self.cache.get(&key_policy(mrn)) {
            Some(CacheValue::Policy(w)) => Ok(w),
            _ => Err(Error::not_found(format!("policy '{mrn}'"))),
        }
    }

    /// Returns the stored policy exactly as written.
    ///
    /// # Errors
    ///
    /// `NotFound` when no policy is stored under `mrn`.
    pub fn get_raw_policy(&self, mrn: &str) -> Result<Policy, Error> {
        Ok(self.get_policy_wrapper(mrn)?.policy)
    }

    /// Returns the policy with all four checksums computed, computing and
    /// persisting them if necessary.
    ///
    /// # Errors
    ///
    /// `NotFound` when the policy or one of its dependencies is missing.
    pub fn get_validated_policy(&self, mrn: &str) -> Result<Policy, Error> {
        let mut wrapper = self.get_policy_wrapper(mrn)?;
        if !wrapper.policy.graph_execution_checksum.is_empty()
            && !wrapper.policy.graph_content_checksum.is_empty()
        {
            return Ok(wrapper.policy);
        }

        wrapper.policy.update_checksums(&LakeResolver { lake: self })?;
        self.store_policy_wrapper(&wrapper)?;
        Ok(wrapper.policy)
    }

    fn store_policy_wrapper(&self, wrapper: &WrapPolicy) -> Result<(), Error> {
        let key = key_policy(&wrapper.policy.mrn);
        if !self
            .cache
            .set(&key, CacheValue::Policy(wrapper.clone()), WEIGHT_POLICY)
        {
            return Err(Error::unavailable(format!(
                "failed to store policy '{}'",
                wrapper.policy.mrn
            )));
        }
        Ok(())
    }

    /// Stores a policy, wiring up parent/child edges with its dependencies
    /// and propagating refreshed asset filters to its ancestors.
    ///
    /// Dependencies must already be stored; store bundles deps-first (see
    /// [`Datalake::set_bundle`]).
    ///
    /// # Errors
    ///
    /// `NotFound` for missing dependencies, `Unavailable` for refused cache
    /// writes.
    pub fn set_policy(&self, policy: Policy) -> Result<Policy, Error> {
        let mut policy = policy;
        if !mrn::is_valid(&policy.mrn) {
            return Err(Error::invalid_argument(format!(
                "policy MRN is not valid: {}",
                policy.mrn
            )));
        }

        let resolver = LakeResolver { lake: self };
        // Filters depend on stored children, so refresh before checksums.
        let deps = policy.dependent_policy_mrns();
        policy.refresh_asset_filters(&resolver)?;
        policy.invalidate_graph_checksums();
        policy.update_checksums(&resolver)?;

        let existing = self.get_policy_wrapper(&policy.mrn).ok();
        let old_children = existing
            .as_ref()
            .map(|w| w.children.clone())
            .unwrap_or_default();

        let mut wrapper = existing.unwrap_or_default();
        wrapper.policy = policy.clone();
        wrapper.children = deps.clone();
        wrapper.invalidated = true;
        self.store_policy_wrapper(&wrapper)?;

        for removed in old_children.difference(&deps) {
            if let Ok(mut child) = self.get_policy_wrapper(removed) {
                child.parents.remove(&policy.mrn);
                self.store_policy_wrapper(&child)?;
            }
        }
        for added in deps.difference(&old_children) {
            let mut child = self.get_policy_wrapper(added).map_err(|_| {
                Error::not_found(format!(
                    "cannot find child policy '{added}' when storing '{}'",
                    policy.mrn
                ))
            })?;
            child.parents.insert(policy.mrn.clone());
            self.store_policy_wrapper(&child)?;
        }

        self.refresh_dependent_asset_filters(wrapper)?;
        Ok(policy)
    }

    /// Stores a compiled bundle: all queries, then all policies in
    /// dependency order.
    ///
    /// # Errors
    ///
    /// Propagates cycle detection and storage failures.
    pub fn set_bundle(&self, map: &BundleMap) -> Result<(), Error> {
        for query in map.queries.values() {
            let code = map.code.get(&query.code_id).cloned();
            self.set_query(query.clone(), code)?;
        }

        for policy in map.policies_sorted_by_dependency()? {
            self.set_policy(policy)?;
        }
        Ok(())
    }

    /// Stores a query and its compiled code.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the cache refuses the write.
    pub fn set_query(&self, query: Mquery, code: Option<CodeBundle>) -> Result<(), Error> {
        let key = key_query(&query.mrn);
        let mrn = query.mrn.clone();
        if !self
            .cache
            .set(&key, CacheValue::Query(WrapQuery { query, code }), WEIGHT_QUERY)
        {
            return Err(Error::unavailable(format!("failed to store query '{mrn}'")));
        }
        Ok(())
    }

    /// Returns a stored query.
    ///
    /// # Errors
    ///
    /// `NotFound` when no query is stored under `mrn`.
    pub fn get_query(&self, mrn: &str) -> Result<Mquery, Error> {
        Ok(self.get_query_wrapper(mrn)?.query)
    }

    pub(crate) fn get_query_wrapper(&self, mrn: &str) -> Result<WrapQuery, Error> {
        match self.cache.get(&key_query(mrn)) {
            Some(CacheValue::Query(w)) => Ok(w),
            _ => Err(Error::not_found(format!("query '{mrn}'"))),
        }
    }

    // ========================================================================
    // Assets
    // ========================================================================

    /// Returns a stored asset wrapper.
    ///
    /// # Errors
    ///
    /// `NotFound` when no asset is stored under `mrn`.
    pub fn get_asset(&self, mrn: &str) -> Result<WrapAsset, Error> {
        match self.cache.get(&key_asset(mrn)) {
            Some(CacheValue::Asset(w)) => Ok(w),
            _ => Err(Error::not_found(format!("asset '{mrn}'"))),
        }
    }

    pub(crate) fn store_asset(&self, asset: &WrapAsset) -> Result<(), Error> {
        if !self.cache.set(
            &key_asset(&asset.mrn),
            CacheValue::Asset(asset.clone()),
            WEIGHT_ASSET,
        ) {
            return Err(Error::unavailable(format!(
                "failed to store asset '{}'",
                asset.mrn
            )));
        }
        Ok(())
    }

    /// Ensures an asset and its implicit wrapper policy exist.
    ///
    /// The wrapper policy shares the asset's MRN (stored in the policy
    /// namespace) and holds one empty group for assignment deltas.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `asset_mrn` does not parse.
    pub fn ensure_asset(&self, asset_mrn: &str) -> Result<(WrapAsset, WrapPolicy), Error> {
        let parsed = mrn::Mrn::parse(asset_mrn)?;

        let asset = match self.get_asset(asset_mrn) {
            Ok(asset) => asset,
            Err(_) => {
                let asset = WrapAsset {
                    mrn: asset_mrn.to_string(),
                    ..WrapAsset::default()
                };
                self.store_asset(&asset)?;
                asset
            }
        };

        let wrapper = match self.get_policy_wrapper(asset_mrn) {
            Ok(w) => w,
            Err(_) => {
                let owner = format!("//{}", parsed.domain());
                let mut policy = Policy::for_asset(asset_mrn, &owner);
                policy.update_checksums(&LakeResolver { lake: self })?;
                let wrapper = WrapPolicy {
                    policy,
                    ..WrapPolicy::default()
                };
                self.store_policy_wrapper(&wrapper)?;
                wrapper
            }
        };

        Ok((asset, wrapper))
    }

    fn ensure_policy(&self, mrn: &str, create_if_missing: bool) -> Result<WrapPolicy, Error> {
        if let Ok(wrapper) = self.get_policy_wrapper(mrn) {
            return Ok(wrapper);
        }
        if !create_if_missing {
            return Err(Error::not_found(format!(
                "failed to modify policy '{mrn}', could not find it"
            )));
        }
        let (_, wrapper) = self.ensure_asset(mrn)?;
        Ok(wrapper)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Applies child-policy deltas to a target policy.
    ///
    /// Used by assignment: an asset's wrapper policy gains or loses child
    /// edges. Both edge ends are written; afterwards the target's filters
    /// and checksums are refreshed and the change propagates to all
    /// ancestors.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing target (unless `create_if_missing`) or a
    /// missing child, `FailedPrecondition` when the target has no groups,
    /// `Unavailable` for refused cache writes.
    pub fn mutate_policy(
        &self,
        mutation: &PolicyMutationDelta,
        create_if_missing: bool,
    ) -> Result<Policy, Error> {
        let target_mrn = mutation.policy_mrn.as_str();
        let mut wrapper = self.ensure_policy(target_mrn, create_if_missing)?;

        if wrapper.policy.groups.is_empty() {
            error!(policy = target_mrn, "cannot modify policy, it has no groups");
            return Err(Error::failed_precondition(
                "cannot modify policy, it has no groups (invalid state)",
            ));
        }

        let mut refs: BTreeMap<String, PolicyRef> = wrapper.policy.groups[0]
            .policies
            .iter()
            .map(|r| (r.mrn.clone(), r.clone()))
            .collect();

        let mut changed = false;
        for (child_mrn, action) in &mutation.policy_deltas {
            match action {
                PolicyDeltaAction::Add => {
                    if refs.contains_key(child_mrn) {
                        continue;
                    }
                    let mut child = self.get_policy_wrapper(child_mrn).map_err(|_| {
                        Error::not_found(format!(
                            "cannot find child policy '{child_mrn}' when trying to assign it"
                        ))
                    })?;
                    refs.insert(
                        child_mrn.clone(),
                        PolicyRef {
                            mrn: child_mrn.clone(),
                            ..PolicyRef::default()
                        },
                    );
                    wrapper.children.insert(child_mrn.clone());
                    child.parents.insert(target_mrn.to_string());
                    self.store_policy_wrapper(&child)?;
                    changed = true;
                }
                PolicyDeltaAction::Delete => {
                    let mut child = self.get_policy_wrapper(child_mrn).map_err(|_| {
                        Error::not_found(format!(
                            "cannot find child policy '{child_mrn}' when trying to unassign it"
                        ))
                    })?;
                    refs.remove(child_mrn);
                    wrapper.children.remove(child_mrn);
                    child.parents.remove(target_mrn);
                    self.store_policy_wrapper(&child)?;
                    changed = true;
                }
            }
        }

        if !changed {
            return Ok(wrapper.policy);
        }

        wrapper.policy.groups[0].policies = refs.into_values().collect();

        wrapper
            .policy
            .refresh_asset_filters(&LakeResolver { lake: self })?;
        wrapper.policy.invalidate_execution_checksums();
        wrapper
            .policy
            .update_checksums(&LakeResolver { lake: self })?;
        wrapper.invalidated = true;
        self.store_policy_wrapper(&wrapper)?;

        debug!(policy = target_mrn, "mutated policy assignments");

        self.refresh_dependent_asset_filters(wrapper.clone())?;
        Ok(wrapper.policy)
    }

    // ========================================================================
    // Filter propagation
    // ========================================================================

    /// Pushes refreshed asset filters from `start` to every ancestor.
    ///
    /// BFS over `parents`: each ancestor recomputes its filters, invalidates
    /// its graph checksums, recomputes, persists, and is marked stale for
    /// resolution. Each node is visited at most once per call.
    ///
    /// # Errors
    ///
    /// A failure on any ancestor aborts the whole propagation; callers must
    /// re-issue.
    pub fn refresh_dependent_asset_filters(&self, start: WrapPolicy) -> Result<(), Error> {
        let mut pending: Vec<String> = start.parents.iter().cloned().collect();
        let mut seen: BTreeSet<String> = pending.iter().cloned().collect();

        while let Some(mrn) = pending.pop() {
            let mut wrapper = self
                .get_policy_wrapper(&mrn)
                .map_err(|_| Error::not_found(format!("failed to get parent policy '{mrn}'")))?;

            wrapper
                .policy
                .refresh_asset_filters(&LakeResolver { lake: self })?;
            wrapper.policy.invalidate_graph_checksums();
            wrapper
                .policy
                .update_checksums(&LakeResolver { lake: self })?;
            wrapper.invalidated = true;
            self.store_policy_wrapper(&wrapper)?;

            for parent in &wrapper.parents {
                if seen.insert(parent.clone()) {
                    pending.push(parent.clone());
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Bundle assembly
    // ========================================================================

    /// Assembles the validated bundle for a policy: the policy, every
    /// transitively referenced policy, and every referenced query with its
    /// compiled code.
    ///
    /// # Errors
    ///
    /// `NotFound` when the policy graph references missing content.
    pub fn get_validated_bundle(&self, policy_mrn: &str) -> Result<BundleMap, Error> {
        let root = self.get_validated_policy(policy_mrn)?;
        let owner = if root.owner_mrn.is_empty() {
            crate::policy::DEFAULT_OWNER_MRN.to_string()
        } else {
            root.owner_mrn.clone()
        };

        let mut map = BundleMap::new(&owner);
        let mut pending = vec![policy_mrn.to_string()];

        while let Some(mrn) = pending.pop() {
            if map.policies.contains_key(&mrn) {
                continue;
            }
            let policy = self.get_validated_policy(&mrn)?;

            for dep in policy.dependent_policy_mrns() {
                pending.push(dep);
            }

            for group in &policy.groups {
                for member in group.checks.iter().chain(group.queries.iter()) {
                    if map.queries.contains_key(&member.mrn) {
                        continue;
                    }
                    let wrapper = self.get_query_wrapper(&member.mrn)?;
                    if let Some(code) = &wrapper.code {
                        map.code.insert(code.code_id.clone(), code.clone());
                    }
                    map.queries.insert(member.mrn.clone(), wrapper.query);
                }
            }

            map.policies.insert(mrn, policy);
        }

        Ok(map)
    }

    // ========================================================================
    // Asset lifecycle
    // ========================================================================

    /// Deletes an asset, its wrapper policy, and all per-asset score and
    /// data slots.
    ///
    /// # Errors
    ///
    /// `NotFound` when the asset does not exist.
    pub fn delete_asset(&self, asset_mrn: &str) -> Result<(), Error> {
        let asset = self.get_asset(asset_mrn)?;

        if let Some(resolved) = &asset.resolved_policy {
            for checksum in resolved.collector_job.datapoints.keys() {
                self.cache.delete(&key_data(asset_mrn, checksum));
            }
            for job in resolved.collector_job.reporting_jobs.values() {
                let qr_id = if job.qr_id == crate::policy::QR_ID_ROOT {
                    asset_mrn
                } else {
                    job.qr_id.as_str()
                };
                self.cache.delete(&key_score(asset_mrn, qr_id));
            }
        }

        if let Ok(wrapper) = self.get_policy_wrapper(asset_mrn) {
            for child_mrn in &wrapper.children {
                if let Ok(mut child) = self.get_policy_wrapper(child_mrn) {
                    child.parents.remove(asset_mrn);
                    self.store_policy_wrapper(&child)?;
                }
            }
            self.cache.delete(&key_policy(asset_mrn));
        }

        self.cache.delete(&key_asset(asset_mrn));
        Ok(())
    }

    // ========================================================================
    // Scores and data (see scores.rs for the implementations)
    // ========================================================================

    pub(crate) fn cache_get_score(&self, key: &str) -> Option<Score> {
        match self.cache.get(key) {
            Some(CacheValue::Score(s)) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn cache_set_score(&self, key: &str, score: Score) -> bool {
        self.cache.set(key, CacheValue::Score(score), WEIGHT_SLOT)
    }

    pub(crate) fn cache_get_data(&self, key: &str) -> Option<DataValue> {
        match self.cache.get(key) {
            Some(CacheValue::Data(d)) => Some(d),
            _ => None,
        }
    }

    pub(crate) fn cache_set_data(&self, key: &str, value: DataValue) -> bool {
        self.cache.set(key, CacheValue::Data(value), WEIGHT_SLOT)
    }

    pub(crate) fn cache_has(&self, key: &str) -> bool {
        self.cache.get(key).is_some()
    }
}

/// Dependency resolution backed by the lake's validated views.
struct LakeResolver<'a> {
    lake: &'a Datalake,
}

impl DependencyResolver for LakeResolver<'_> {
    fn policy(&self, mrn: &str) -> Result<Policy, Error> {
        self.lake.get_validated_policy(mrn)
    }

    fn query(&self, mrn: &str) -> Result<Mquery, Error> {
        self.lake.get_query(mrn)
    }
}
