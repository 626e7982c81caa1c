//! Score derivation and tree rollup for scan workers.
//!
//! Leaf reporting jobs (checks) derive their score from the truthiness of
//! their datapoints; interior jobs aggregate their children according to
//! their scoring system. The rollup walks the tree bottom-up from the root
//! reporting job.

use std::collections::BTreeMap;

use crate::policy::{
    CollectorJob, DataValue, ReportingJob, Score, ScoreType, ScoringSystem, QR_ID_ROOT,
};

/// Derives scores for every reporting job of a collector.
///
/// `data` holds the collected datapoint values, `query_errors` maps
/// datapoint checksums to error messages for queries that failed to run.
/// The root job's score is emitted under `asset_mrn`.
pub(crate) fn rollup_scores(
    collector: &CollectorJob,
    data: &BTreeMap<String, DataValue>,
    query_errors: &BTreeMap<String, String>,
    asset_mrn: &str,
) -> Vec<Score> {
    let root = collector
        .reporting_jobs
        .values()
        .find(|job| job.qr_id == QR_ID_ROOT);

    let mut scores: BTreeMap<String, Score> = BTreeMap::new();
    if let Some(root) = root {
        score_job(collector, root, data, query_errors, &mut scores);
    }

    scores
        .into_values()
        .map(|mut score| {
            if score.qr_id == QR_ID_ROOT {
                score.qr_id = asset_mrn.to_string();
            }
            score
        })
        .collect()
}

fn score_job(
    collector: &CollectorJob,
    job: &ReportingJob,
    data: &BTreeMap<String, DataValue>,
    query_errors: &BTreeMap<String, String>,
    scores: &mut BTreeMap<String, Score>,
) -> Score {
    if let Some(existing) = scores.get(&job.uuid) {
        return existing.clone();
    }

    let score = if job.child_jobs.is_empty() {
        leaf_score(job, data, query_errors)
    } else {
        let mut children = Vec::new();
        for (child_uuid, spec) in &job.child_jobs {
            let Some(child) = collector.reporting_jobs.get(child_uuid) else {
                continue;
            };
            let mut child_score = score_job(collector, child, data, query_errors, scores);
            child_score.weight = spec.weight;
            children.push((child_score, spec.severity));
        }
        aggregate(job, &children)
    };

    scores.insert(job.uuid.clone(), score.clone());
    score
}

fn leaf_score(
    job: &ReportingJob,
    data: &BTreeMap<String, DataValue>,
    query_errors: &BTreeMap<String, String>,
) -> Score {
    let total = job.datapoints.len() as u32;
    let mut arrived = 0u32;
    let mut passing = true;

    for checksum in &job.datapoints {
        if let Some(message) = query_errors.get(checksum) {
            return Score {
                qr_id: job.qr_id.clone(),
                score_type: ScoreType::Error,
                value: 0,
                weight: 1,
                data_total: total,
                data_completion: 100,
                score_completion: 100,
                message: message.clone(),
                ..Score::default()
            };
        }
        match data.get(checksum) {
            Some(value) if !value.is_nil() => {
                arrived += 1;
                if !value.is_truthy() {
                    passing = false;
                }
            }
            _ => passing = false,
        }
    }

    let data_completion = if total == 0 {
        100
    } else {
        arrived * 100 / total
    };

    Score {
        qr_id: job.qr_id.clone(),
        score_type: ScoreType::Result,
        value: if passing { 100 } else { 0 },
        weight: 1,
        data_total: total,
        data_completion,
        score_completion: 100,
        ..Score::default()
    }
}

fn aggregate(job: &ReportingJob, children: &[(Score, Option<u32>)]) -> Score {
    let determined: Vec<&(Score, Option<u32>)> = children
        .iter()
        .filter(|(s, _)| s.score_type != ScoreType::Unknown)
        .collect();

    let score_completion = if children.is_empty() {
        100
    } else {
        (determined.len() as u32) * 100 / (children.len() as u32)
    };

    let value = match job.scoring_system {
        ScoringSystem::Average => {
            let total_weight: u32 = determined.iter().map(|(s, _)| s.weight.max(1)).sum();
            if total_weight == 0 {
                100
            } else {
                determined
                    .iter()
                    .map(|(s, _)| s.value * s.weight.max(1))
                    .sum::<u32>()
                    / total_weight
            }
        }
        ScoringSystem::Worst => determined.iter().map(|(s, _)| s.value).min().unwrap_or(100),
        ScoringSystem::HighestImpact => determined
            .iter()
            .max_by_key(|(s, severity)| (100 - s.value.min(100)) * severity.unwrap_or(100))
            .map_or(100, |(s, _)| s.value),
    };

    let data_total: u32 = children.iter().map(|(s, _)| s.data_total).sum();
    let data_completion = if children.is_empty() {
        100
    } else {
        children.iter().map(|(s, _)| s.data_completion).sum::<u32>() / (children.len() as u32)
    };

    Score {
        qr_id: job.qr_id.clone(),
        score_type: ScoreType::Result,
        value,
        weight: 1,
        data_total,
        data_completion,
        score_completion,
        ..Score::default()
    }
}
