//! Score and data slots, reports, and resolved-policy binding.
//!
//! Scores live at `score/<asset>\0<qrId>`, data at `data/<asset>\0<checksum>`.
//! Score updates carry temporal bookkeeping: `value_modified_time` moves
//! whenever the value changes, `failure_time` records the first failure
//! after the most recent passing state and resets to 0 on full recovery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{key_data, key_resolved, key_score, Datalake};
use crate::error::{Error, TypeMismatch};
use crate::policy::{
    CollectorJob, DataType, DataValue, Property, Report, ResolvedPolicy, Score, ScoreType,
    QR_ID_ROOT,
};

/// Version tag for resolved policies produced by this engine generation.
pub const RESOLVED_POLICY_VERSION: &str = "v2";

impl Datalake {
    // ========================================================================
    // Scores
    // ========================================================================

    /// Returns one score for an asset.
    ///
    /// # Errors
    ///
    /// `NotFound` when no score is stored for `(asset, qr_id)`.
    pub fn get_score(&self, asset_mrn: &str, qr_id: &str) -> Result<Score, Error> {
        self.cache_get_score(&key_score(asset_mrn, qr_id))
            .ok_or_else(|| {
                Error::not_found(format!("score for asset '{asset_mrn}' with ID '{qr_id}'"))
            })
    }

    /// Returns the scores for all given QrIDs.
    ///
    /// # Errors
    ///
    /// `NotFound` when any requested score is missing.
    pub fn get_scores(
        &self,
        asset_mrn: &str,
        qr_ids: &[String],
    ) -> Result<BTreeMap<String, Score>, Error> {
        let mut res = BTreeMap::new();
        for qr_id in qr_ids {
            let score = self.get_score(asset_mrn, qr_id)?;
            res.insert(qr_id.clone(), score);
        }
        Ok(res)
    }

    /// Applies a batch of score updates and returns the QrIDs that changed.
    ///
    /// Unchanged scores are skipped without error.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the cache refuses a write.
    pub fn update_scores(
        &self,
        asset_mrn: &str,
        scores: &[Score],
    ) -> Result<BTreeSet<String>, Error> {
        let mut updated = BTreeSet::new();
        let now = (self.now)();

        for score in scores {
            if self.update_score(asset_mrn, score, now)? {
                updated.insert(score.qr_id.clone());
            }
        }

        Ok(updated)
    }

    /// Stores one score; returns whether anything changed.
    fn update_score(&self, asset_mrn: &str, score: &Score, now: i64) -> Result<bool, Error> {
        let key = key_score(asset_mrn, &score.qr_id);
        let prev = self.cache_get_score(&key);

        if let Some(prev) = &prev {
            if prev.value == score.value
                && prev.score_type == score.score_type
                && prev.data_completion == score.data_completion
                && prev.data_total == score.data_total
                && prev.score_completion == score.score_completion
                && prev.weight == score.weight
            {
                return Ok(false);
            }
        }

        let mut score = score.clone();
        let first_result = prev.is_none()
            || (prev.as_ref().is_some_and(|p| p.score_completion == 0)
                && score.score_type == ScoreType::Result);

        if first_result {
            score.value_modified_time = now;
            score.failure_time = if score.value == 100 || score.score_completion < 100 {
                0
            } else {
                now
            };
        } else if let Some(prev) = &prev {
            if (prev.value != score.value || prev.score_completion == 0)
                && score.score_type == ScoreType::Result
            {
                score.value_modified_time = now;
                if score.value == 100 && score.score_completion == 100 {
                    // Full recovery resets the failure clock.
                    score.failure_time = 0;
                } else if prev.value == 100 {
                    // Transition from passing into failure.
                    score.failure_time = now;
                } else {
                    // Still failing since the original failure.
                    score.failure_time = prev.failure_time;
                }
            } else {
                score.value_modified_time = prev.value_modified_time;
                score.failure_time = prev.failure_time;
            }
        }

        if !self.cache_set_score(&key, score.clone()) {
            return Err(Error::unavailable(format!(
                "failed to set score for asset '{asset_mrn}' with ID '{}'",
                score.qr_id
            )));
        }

        debug!(
            asset = asset_mrn,
            query = %score.qr_id,
            value = score.value,
            score_completion = score.score_completion,
            data_completion = score.data_completion,
            "update score"
        );
        Ok(true)
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Returns the data values for the given catalog fields.
    ///
    /// Initialized-but-empty slots come back as nil values.
    ///
    /// # Errors
    ///
    /// `NotFound` when a slot was never initialized.
    pub fn get_data(
        &self,
        asset_mrn: &str,
        fields: &BTreeMap<String, DataType>,
    ) -> Result<BTreeMap<String, DataValue>, Error> {
        let mut res = BTreeMap::new();
        for checksum in fields.keys() {
            let value = self
                .cache_get_data(&key_data(asset_mrn, checksum))
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "data for asset '{asset_mrn}' and checksum '{checksum}'"
                    ))
                })?;
            res.insert(checksum.clone(), value);
        }
        Ok(res)
    }

    /// Stores uploaded data values, checking each against the collector
    /// job's type catalog.
    ///
    /// Entries whose declared type disagrees with the catalog are rejected
    /// individually; the rest are stored. Returns the stored checksums with
    /// their catalog types.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` when the asset has no resolved policy,
    /// `NotFound` for unknown datapoints, and an aggregated
    /// [`Error::DataTypeMismatch`] naming every rejected entry.
    pub fn update_data(
        &self,
        asset_mrn: &str,
        data: &BTreeMap<String, DataValue>,
    ) -> Result<BTreeMap<String, DataType>, Error> {
        let collector = self.get_collector_job(asset_mrn)?;

        let mut updated = BTreeMap::new();
        let mut mismatches = Vec::new();

        for (checksum, value) in data {
            let info = collector.datapoints.get(checksum).ok_or_else(|| {
                Error::not_found(format!("cannot find datapoint to store values: {checksum}"))
            })?;

            if !value.is_nil()
                && value.data_type != DataType::Unset
                && info.data_type != DataType::Unset
                && value.data_type != info.data_type
            {
                warn!(
                    checksum = %checksum,
                    asset = asset_mrn,
                    expected = info.data_type.label(),
                    received = value.data_type.label(),
                    "failed to store data, types don't match"
                );
                mismatches.push(TypeMismatch {
                    checksum: checksum.clone(),
                    expected: info.data_type,
                    received: value.data_type,
                });
                continue;
            }

            if !self.cache_set_data(&key_data(asset_mrn, checksum), value.clone()) {
                return Err(Error::unavailable(format!(
                    "failed to save data for asset '{asset_mrn}' and checksum '{checksum}'"
                )));
            }
            updated.insert(checksum.clone(), info.data_type);
        }

        if !mismatches.is_empty() {
            return Err(Error::DataTypeMismatch { mismatches });
        }
        Ok(updated)
    }

    // ========================================================================
    // Resolved policies
    // ========================================================================

    /// Looks up a cached resolved policy for `(policy, filters_checksum)`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the policy itself is missing.
    pub fn cached_resolved_policy(
        &self,
        policy_mrn: &str,
        filters_checksum: &str,
    ) -> Result<Option<Arc<ResolvedPolicy>>, Error> {
        let policy = self.get_validated_policy(policy_mrn)?;
        Ok(self
            .resolved_policies
            .get(&key_resolved(&policy.graph_execution_checksum, filters_checksum)))
    }

    /// Stores a resolved policy in the resolution cache.
    ///
    /// `cached` marks artifacts received from upstream rather than derived
    /// locally; those also update the local policy's graph checksum and
    /// clear its invalidation flag.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the cache refuses the entry.
    pub fn set_resolved_policy(
        &self,
        policy_mrn: &str,
        resolved: ResolvedPolicy,
        cached: bool,
    ) -> Result<Arc<ResolvedPolicy>, Error> {
        let resolved = Arc::new(resolved);
        let weight = resolved.cache_weight();
        let key = key_resolved(&resolved.graph_execution_checksum, &resolved.filters_checksum);

        if !self.resolved_policies.set(&key, resolved.clone(), weight) {
            return Err(Error::unavailable(format!(
                "failed to save resolved policy '{policy_mrn}'"
            )));
        }

        if cached {
            let mut wrapper = self.get_policy_wrapper(policy_mrn).map_err(|_| {
                Error::not_found(format!(
                    "failed to save resolved policy, cannot find its policy locally: '{policy_mrn}'"
                ))
            })?;
            wrapper.policy.graph_execution_checksum = resolved.graph_execution_checksum.clone();
            wrapper.invalidated = false;
            self.store_policy_wrapper(&wrapper)?;
        }

        Ok(resolved)
    }

    /// Returns the resolved policy currently bound to an asset.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing asset, `FailedPrecondition` when no
    /// resolved policy is bound.
    pub fn get_resolved_policy(&self, asset_mrn: &str) -> Result<Arc<ResolvedPolicy>, Error> {
        let asset = self.get_asset(asset_mrn)?;
        asset.resolved_policy.ok_or_else(|| {
            Error::failed_precondition(format!("asset '{asset_mrn}' has no resolved policy"))
        })
    }

    /// Returns the collector job of the asset's bound resolved policy.
    ///
    /// # Errors
    ///
    /// Same as [`Datalake::get_resolved_policy`].
    pub fn get_collector_job(&self, asset_mrn: &str) -> Result<CollectorJob, Error> {
        Ok(self.get_resolved_policy(asset_mrn)?.collector_job.clone())
    }

    /// Binds a resolved policy to an asset and initializes its slots.
    ///
    /// A no-op when the asset already carries the same graph execution
    /// checksum under the same version tag. Otherwise every catalog
    /// datapoint gets a nil slot (unless one exists) and every reporting
    /// job gets an empty score with `Unknown` type.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing asset, `Unavailable` for refused writes.
    pub fn set_asset_resolved_policy(
        &self,
        asset_mrn: &str,
        resolved: &Arc<ResolvedPolicy>,
        version: &str,
    ) -> Result<(), Error> {
        let mut asset = self.get_asset(asset_mrn)?;

        if let Some(existing) = &asset.resolved_policy {
            if existing.graph_execution_checksum == resolved.graph_execution_checksum
                && asset.resolved_policy_version == version
            {
                debug!(asset = asset_mrn, "asset resolved policy is already bound");
                return Ok(());
            }
        }

        asset.resolved_policy = Some(resolved.clone());
        asset.resolved_policy_version = version.to_string();

        for (checksum, info) in &resolved.collector_job.datapoints {
            let key = key_data(asset_mrn, checksum);
            if self.cache_has(&key) {
                continue;
            }
            let slot = DataValue {
                data_type: info.data_type,
                value: serde_json::Value::Null,
            };
            if !self.cache_set_data(&key, slot) {
                return Err(Error::unavailable(format!(
                    "failed to initialize data value for asset '{asset_mrn}' \
                     with checksum '{checksum}'"
                )));
            }
        }

        for job in resolved.collector_job.reporting_jobs.values() {
            let qr_id = if job.qr_id == QR_ID_ROOT {
                asset_mrn
            } else {
                job.qr_id.as_str()
            };
            let empty = Score {
                qr_id: qr_id.to_string(),
                ..Score::default()
            };
            if !self.cache_set_score(&key_score(asset_mrn, qr_id), empty) {
                return Err(Error::unavailable(format!(
                    "failed to initialize score for asset '{asset_mrn}' with qrID '{qr_id}'"
                )));
            }
        }

        self.store_asset(&asset)
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Stitches scores and data into a report for one asset.
    ///
    /// A missing top-level score yields an empty report rather than an
    /// error; the report lifecycle bootstraps with empty. The `scores` map
    /// carries only determined scores and `data` only non-nil slots.
    ///
    /// # Errors
    ///
    /// `NotFound` when the asset itself is missing.
    pub fn get_report(&self, asset_mrn: &str, qr_id: &str) -> Result<Report, Error> {
        let score = match self.get_score(asset_mrn, qr_id) {
            Ok(score) => score,
            Err(_) => {
                return Ok(Report {
                    entity_mrn: asset_mrn.to_string(),
                    scoring_mrn: qr_id.to_string(),
                    ..Report::default()
                })
            }
        };

        let asset = self.get_asset(asset_mrn)?;
        let resolved = asset.resolved_policy.ok_or_else(|| {
            Error::failed_precondition(format!("asset '{asset_mrn}' has no resolved policy"))
        })?;

        let mut qr_ids = BTreeSet::new();
        for job in resolved.collector_job.reporting_jobs.values() {
            if job.qr_id == QR_ID_ROOT {
                qr_ids.insert(asset_mrn.to_string());
            } else {
                qr_ids.insert(job.qr_id.clone());
            }
        }
        let qr_ids: Vec<String> = qr_ids.into_iter().collect();
        let scores = self.get_scores(asset_mrn, &qr_ids)?;

        let fields: BTreeMap<String, DataType> = resolved
            .collector_job
            .datapoints
            .iter()
            .map(|(k, v)| (k.clone(), v.data_type))
            .collect();
        let data = self.get_data(asset_mrn, &fields)?;

        Ok(Report {
            entity_mrn: asset_mrn.to_string(),
            scoring_mrn: qr_id.to_string(),
            score,
            scores: scores
                .into_iter()
                .filter(|(_, s)| s.score_type != ScoreType::Unknown)
                .collect(),
            data: data.into_iter().filter(|(_, v)| !v.is_nil()).collect(),
            resolved_policy_version: asset.resolved_policy_version,
        })
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Overrides properties on an entity's policy.
    ///
    /// Existing properties (matched by MRN or UID) get their source
    /// replaced; new ones are appended. The mutated policy is persisted and
    /// its checksums recomputed.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing entity, `InvalidArgument` for a property
    /// with neither MRN nor UID.
    pub fn set_props(&self, entity_mrn: &str, props: &[Property]) -> Result<(), Error> {
        let mut wrapper = self.get_policy_wrapper(entity_mrn).map_err(|_| {
            Error::not_found(format!("failed to modify policy '{entity_mrn}', could not find it"))
        })?;

        for incoming in props {
            let id = incoming.identifier();
            if id.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "cannot set property without MRN: {}",
                    incoming.mql
                )));
            }

            let existing = wrapper
                .policy
                .props
                .iter_mut()
                .find(|p| p.mrn == id || p.uid == id);
            match existing {
                Some(prop) => prop.mql = incoming.mql.clone(),
                None => wrapper.policy.props.push(incoming.clone()),
            }
        }

        wrapper.policy.invalidate_local_checksums();
        wrapper
            .policy
            .update_checksums(&super::LakeResolver { lake: self })?;
        wrapper.invalidated = true;
        self.store_policy_wrapper(&wrapper)
    }
}
