//! Policy resolution service.
//!
//! [`PolicyResolver`] is the service surface over the datalake: assignment,
//! resolution, result storage, and report retrieval. Resolution runs in
//! five phases:
//!
//! 1. Cache lookup by `(graph_execution_checksum, filters_checksum)`,
//!    first with all asset filters, then with the matching subset.
//! 2. Asset/space-policy optimization (reserved; currently a no-op).
//! 3. `policy_to_jobs`: walk the DAG into a reporting tree.
//! 4. `jobs_to_queries`: flatten into execution and collector jobs.
//! 5. Checksum sealing and persistence.
//!
//! The whole attempt runs inside a retry envelope: when the policy's graph
//! checksum changes between the start and the end of an attempt (a
//! concurrent mutation), the attempt is retried up to three times with a
//! jittered backoff before failing.

mod jobs;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::checksum::Checksum;
use crate::datalake::{Datalake, PolicyDeltaAction, PolicyMutationDelta, RESOLVED_POLICY_VERSION};
use crate::error::Error;
use crate::policy::{DataValue, Mquery, Property, Report, ResolvedPolicy, Score};

use jobs::JobsBuilder;

/// Maximum resolution attempts before giving up.
const MAX_RESOLVE_RETRY: u32 = 3;

/// Base backoff between attempts.
const RESOLVE_RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Upper bound of the random jitter added to the backoff.
const RESOLVE_RETRY_JITTER_MS: u64 = 25;

/// Outcome of a single resolution attempt. `Retry` never escapes the
/// envelope.
enum Attempt {
    Done(Arc<ResolvedPolicy>),
    Retry,
}

/// Checksum over a set of asset filters: a fold of their sorted CodeIDs.
#[must_use]
pub fn checksum_asset_filters(filters: &[Mquery]) -> String {
    Checksum::new()
        .add_sorted(filters.iter().map(|f| f.code_id.as_str()))
        .encode()
}

/// The local policy resolution service.
pub struct PolicyResolver {
    lake: Arc<Datalake>,
}

impl PolicyResolver {
    /// Creates a resolver over the given datalake.
    #[must_use]
    pub fn new(lake: Arc<Datalake>) -> Self {
        Self { lake }
    }

    /// The backing datalake.
    #[must_use]
    pub fn lake(&self) -> &Arc<Datalake> {
        &self.lake
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Assigns policies to an asset.
    ///
    /// Creates the asset and its wrapper policy on first use, then adds one
    /// child edge per policy. Adding an already-assigned policy is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when no policies are given, `NotFound` when a
    /// policy is not stored.
    pub fn assign(&self, asset_mrn: &str, policy_mrns: &[String]) -> Result<(), Error> {
        let deltas = Self::deltas(policy_mrns, PolicyDeltaAction::Add)?;
        self.lake.mutate_policy(
            &PolicyMutationDelta {
                policy_mrn: asset_mrn.to_string(),
                policy_deltas: deltas,
            },
            true,
        )?;
        Ok(())
    }

    /// Removes policies from an asset.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when no policies are given, `NotFound` when the
    /// asset has no wrapper policy.
    pub fn unassign(&self, asset_mrn: &str, policy_mrns: &[String]) -> Result<(), Error> {
        let deltas = Self::deltas(policy_mrns, PolicyDeltaAction::Delete)?;
        self.lake.mutate_policy(
            &PolicyMutationDelta {
                policy_mrn: asset_mrn.to_string(),
                policy_deltas: deltas,
            },
            false,
        )?;
        Ok(())
    }

    fn deltas(
        policy_mrns: &[String],
        action: PolicyDeltaAction,
    ) -> Result<BTreeMap<String, PolicyDeltaAction>, Error> {
        if policy_mrns.is_empty() {
            return Err(Error::invalid_argument("a policy mrn is required"));
        }
        Ok(policy_mrns
            .iter()
            .map(|mrn| (mrn.clone(), action))
            .collect())
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolves a policy for a set of asset filters.
    ///
    /// # Errors
    ///
    /// `NoMatchingPolicy` when the filter intersection is empty,
    /// `Unavailable` when concurrent mutation exhausts the retry budget.
    pub fn resolve(
        &self,
        policy_mrn: &str,
        asset_filters: &[Mquery],
    ) -> Result<Arc<ResolvedPolicy>, Error> {
        for attempt in 0..MAX_RESOLVE_RETRY {
            match self.try_resolve(policy_mrn, asset_filters)? {
                Attempt::Done(resolved) => return Ok(resolved),
                Attempt::Retry => {
                    if attempt + 1 < MAX_RESOLVE_RETRY {
                        let jitter = rand::thread_rng().gen_range(0..RESOLVE_RETRY_JITTER_MS);
                        let sleep_time = RESOLVE_RETRY_BACKOFF + Duration::from_millis(jitter);
                        warn!(
                            attempt = attempt + 1,
                            sleep_ms = sleep_time.as_millis() as u64,
                            "retrying policy resolution"
                        );
                        thread::sleep(sleep_time);
                    }
                }
            }
        }
        Err(Error::unavailable("concurrent policy resolve"))
    }

    fn try_resolve(
        &self,
        policy_mrn: &str,
        asset_filters: &[Mquery],
    ) -> Result<Attempt, Error> {
        // Phase 1: look for a cached plan, first under all asset filters.
        let all_filters_checksum = checksum_asset_filters(asset_filters);
        if let Some(resolved) = self
            .lake
            .cached_resolved_policy(policy_mrn, &all_filters_checksum)?
        {
            return Ok(Attempt::Done(resolved));
        }

        let bundle = self.lake.get_validated_bundle(policy_mrn)?;
        let policy = bundle.policies.get(policy_mrn).cloned().ok_or_else(|| {
            Error::internal(format!("validated bundle is missing its root '{policy_mrn}'"))
        })?;

        let matching: Vec<Mquery> = asset_filters
            .iter()
            .filter(|f| policy.filters.items.contains_key(&f.code_id))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(no_matching_policy_error(&policy, asset_filters));
        }

        // ... and again under only the matching subset.
        let filters_checksum = checksum_asset_filters(&matching);
        if filters_checksum != all_filters_checksum {
            if let Some(resolved) = self
                .lake
                .cached_resolved_policy(policy_mrn, &filters_checksum)?
            {
                return Ok(Attempt::Done(resolved));
            }
        }

        debug!(
            policy = policy_mrn,
            filters = matching.len(),
            "resolver> phase 1: no cached result, resolve the policy now"
        );

        // Phase 2: asset/space-policy optimization. Reserved as an
        // extension point.
        debug!(policy = policy_mrn, "resolver> phase 2: optimizations [no-op]");

        // Phase 3: build the reporting tree.
        let graph_execution_checksum = policy.graph_execution_checksum.clone();
        let matching_code_ids: BTreeSet<String> =
            matching.iter().map(|f| f.code_id.clone()).collect();

        let mut builder = JobsBuilder::new(
            &bundle,
            graph_execution_checksum.clone(),
            filters_checksum.clone(),
            matching_code_ids,
            policy.scoring_system,
        );
        builder.policy_to_jobs(policy_mrn)?;
        let reporting_job_uuid = builder.root_uuid().to_string();
        debug!(policy = policy_mrn, "resolver> phase 3: turn policy into jobs [ok]");

        // Phase 4: flatten into execution and collector jobs.
        let (mut execution_job, mut collector_job) = builder.jobs_to_queries()?;
        debug!(policy = policy_mrn, "resolver> phase 4: aggregate queries and jobs [ok]");

        // Phase 5: seal all checksums.
        execution_job.refresh_checksum();
        collector_job.refresh_checksum();

        // Detect concurrent mutation: the graph checksum we resolved against
        // must still be current, otherwise the plan is already stale.
        let latest = self.lake.get_validated_policy(policy_mrn)?;
        if latest.graph_execution_checksum != graph_execution_checksum {
            return Ok(Attempt::Retry);
        }

        let resolved = ResolvedPolicy {
            graph_execution_checksum,
            filters_checksum,
            filters: matching,
            execution_job,
            collector_job,
            reporting_job_uuid,
        };

        let resolved = self.lake.set_resolved_policy(policy_mrn, resolved, false)?;
        Ok(Attempt::Done(resolved))
    }

    // ========================================================================
    // Results and reports
    // ========================================================================

    /// Binds a resolved policy to an asset under the current version tag.
    ///
    /// # Errors
    ///
    /// See [`Datalake::set_asset_resolved_policy`].
    pub fn set_asset_resolved_policy(
        &self,
        asset_mrn: &str,
        resolved: &Arc<ResolvedPolicy>,
    ) -> Result<(), Error> {
        self.lake
            .set_asset_resolved_policy(asset_mrn, resolved, RESOLVED_POLICY_VERSION)
    }

    /// Stores scan results: data values first, then scores.
    ///
    /// Scores are stored even when some data entries were rejected; the
    /// data error (an aggregated type-mismatch list) is returned afterwards.
    ///
    /// # Errors
    ///
    /// Propagates data and score storage failures.
    pub fn store_results(
        &self,
        asset_mrn: &str,
        data: &BTreeMap<String, DataValue>,
        scores: &[Score],
    ) -> Result<(), Error> {
        let data_result = if data.is_empty() {
            Ok(BTreeMap::new())
        } else {
            self.lake.update_data(asset_mrn, data)
        };

        self.lake.update_scores(asset_mrn, scores)?;
        data_result?;
        Ok(())
    }

    /// Returns the stitched report for an entity.
    ///
    /// # Errors
    ///
    /// See [`Datalake::get_report`].
    pub fn get_report(&self, entity_mrn: &str, scoring_mrn: &str) -> Result<Report, Error> {
        self.lake.get_report(entity_mrn, scoring_mrn)
    }

    /// Returns a report carrying just one score.
    ///
    /// # Errors
    ///
    /// `NotFound` when the score does not exist.
    pub fn get_score(&self, entity_mrn: &str, scoring_mrn: &str) -> Result<Report, Error> {
        let score = self.lake.get_score(entity_mrn, scoring_mrn)?;
        Ok(Report {
            entity_mrn: entity_mrn.to_string(),
            scoring_mrn: scoring_mrn.to_string(),
            score,
            ..Report::default()
        })
    }

    /// Overrides properties on an entity's policy.
    ///
    /// # Errors
    ///
    /// See [`Datalake::set_props`].
    pub fn set_props(&self, entity_mrn: &str, props: &[Property]) -> Result<(), Error> {
        self.lake.set_props(entity_mrn, props)
    }
}

fn no_matching_policy_error(policy: &crate::policy::Policy, asset_filters: &[Mquery]) -> Error {
    let mut supported: Vec<String> = policy
        .filters
        .items
        .values()
        .map(|f| f.mql.trim().to_string())
        .collect();
    supported.sort();

    let mut presented: Vec<String> = asset_filters
        .iter()
        .map(|f| f.mql.trim().to_string())
        .collect();
    presented.sort();

    Error::NoMatchingPolicy {
        policy: policy.mrn.clone(),
        supported_filters: supported,
        asset_filters: presented,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(code_id: &str) -> Mquery {
        Mquery {
            code_id: code_id.to_string(),
            mql: format!("filter-{code_id}"),
            ..Mquery::default()
        }
    }

    #[test]
    fn filters_checksum_ignores_order() {
        let a = checksum_asset_filters(&[filter("f1"), filter("f2")]);
        let b = checksum_asset_filters(&[filter("f2"), filter("f1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn filters_checksum_tracks_membership() {
        let one = checksum_asset_filters(&[filter("f1")]);
        let two = checksum_asset_filters(&[filter("f1"), filter("f2")]);
        assert_ne!(one, two);
    }

    #[test]
    fn assignment_requires_at_least_one_policy() {
        let resolver = PolicyResolver::new(Arc::new(Datalake::new()));
        let err = resolver
            .assign("//captain.example.com/assets/a1", &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let err = resolver
            .unassign("//captain.example.com/assets/a1", &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
