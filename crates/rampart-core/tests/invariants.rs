//! Property tests for the engine's structural invariants.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use rampart_core::datalake::{Datalake, PolicyDeltaAction, PolicyMutationDelta};
use rampart_core::policy::{Mquery, Policy, PolicyGroup, PolicyRef, Score, ScoreType};

const DOMAIN: &str = "//captain.example.com";

fn filter(code_id: &str) -> Mquery {
    Mquery {
        code_id: code_id.to_string(),
        mql: format!("filter-{code_id}"),
        ..Mquery::default()
    }
}

fn policy_mrn(idx: usize) -> String {
    format!("{DOMAIN}/policies/p{idx}")
}

fn asset_mrn(idx: usize) -> String {
    format!("{DOMAIN}/assets/a{idx}")
}

fn store_policy(lake: &Datalake, mrn: &str, filters: &[String], deps: &[String]) {
    let mut group = PolicyGroup::default();
    for code_id in filters {
        group.filters.insert(filter(code_id));
    }
    for dep in deps {
        group.policies.push(PolicyRef {
            mrn: dep.clone(),
            ..PolicyRef::default()
        });
    }
    group.checks.push(Mquery {
        mrn: format!("{mrn}/queries/check"),
        mql: "true".to_string(),
        code_id: format!("code-{mrn}"),
        ..Mquery::default()
    });

    lake.set_policy(Policy {
        mrn: mrn.to_string(),
        name: mrn.to_string(),
        version: "1.0.0".to_string(),
        groups: vec![group],
        ..Policy::default()
    })
    .expect("failed to store policy");
}

/// One assignment operation: which asset, which policy, assign or unassign.
#[derive(Debug, Clone)]
struct AssignOp {
    asset: usize,
    policy: usize,
    assign: bool,
}

fn assign_ops() -> impl Strategy<Value = Vec<AssignOp>> {
    prop::collection::vec(
        (0usize..2, 0usize..3, any::<bool>()).prop_map(|(asset, policy, assign)| AssignOp {
            asset,
            policy,
            assign,
        }),
        1..24,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Edge symmetry: after any assign/unassign sequence, `b` is a child of
    /// `a` exactly when `a` is a parent of `b`.
    #[test]
    fn edge_symmetry_holds_under_assignment(ops in assign_ops()) {
        let lake = Datalake::new();
        for i in 0..3 {
            store_policy(&lake, &policy_mrn(i), &[format!("f{i}")], &[]);
        }

        for op in &ops {
            let mutation = PolicyMutationDelta {
                policy_mrn: asset_mrn(op.asset),
                policy_deltas: BTreeMap::from([(
                    policy_mrn(op.policy),
                    if op.assign {
                        PolicyDeltaAction::Add
                    } else {
                        PolicyDeltaAction::Delete
                    },
                )]),
            };
            // Unassigning something never assigned fails on the missing
            // wrapper; that is fine, the store must stay consistent.
            let _ = lake.mutate_policy(&mutation, op.assign);
        }

        let mut mrns: Vec<String> = (0..3).map(policy_mrn).collect();
        mrns.extend((0..2).map(asset_mrn));

        for a in &mrns {
            let Ok(wrapper_a) = lake.get_policy_wrapper(a) else { continue };
            for b in &mrns {
                let Ok(wrapper_b) = lake.get_policy_wrapper(b) else { continue };
                prop_assert_eq!(
                    wrapper_a.children.contains(b),
                    wrapper_b.parents.contains(a),
                    "edge between '{}' and '{}' is asymmetric",
                    a,
                    b
                );
            }
        }
    }

    /// Checksum stability: recomputing all four checksums on an untouched
    /// policy yields identical values.
    #[test]
    fn checksum_recomputation_is_stable(filters in prop::collection::vec("[a-z][a-z0-9]{0,6}", 0..4)) {
        let lake = Datalake::new();
        store_policy(&lake, &policy_mrn(0), &filters, &[]);

        let stored = lake.get_validated_policy(&policy_mrn(0)).unwrap();
        let mut copy = stored.clone();
        copy.invalidate_local_checksums();

        struct NoDeps;
        impl rampart_core::policy::DependencyResolver for NoDeps {
            fn policy(&self, mrn: &str) -> Result<Policy, rampart_core::Error> {
                Err(rampart_core::Error::not_found(mrn.to_string()))
            }
            fn query(&self, mrn: &str) -> Result<Mquery, rampart_core::Error> {
                Err(rampart_core::Error::not_found(mrn.to_string()))
            }
        }
        copy.update_checksums(&NoDeps).unwrap();

        prop_assert_eq!(stored.local_content_checksum, copy.local_content_checksum);
        prop_assert_eq!(stored.local_execution_checksum, copy.local_execution_checksum);
        prop_assert_eq!(stored.graph_content_checksum, copy.graph_content_checksum);
        prop_assert_eq!(stored.graph_execution_checksum, copy.graph_execution_checksum);
    }

    /// Filter closure: a parent's filters are exactly its own plus the
    /// union of its children's.
    #[test]
    fn filter_closure_is_a_union(
        own in prop::collection::btree_set("[a-g]", 0..3),
        child_a in prop::collection::btree_set("[h-n]", 0..3),
        child_b in prop::collection::btree_set("[o-u]", 0..3),
    ) {
        let lake = Datalake::new();
        let a_filters: Vec<String> = child_a.iter().cloned().collect();
        let b_filters: Vec<String> = child_b.iter().cloned().collect();
        let own_filters: Vec<String> = own.iter().cloned().collect();

        store_policy(&lake, &policy_mrn(1), &a_filters, &[]);
        store_policy(&lake, &policy_mrn(2), &b_filters, &[]);
        store_policy(
            &lake,
            &policy_mrn(0),
            &own_filters,
            &[policy_mrn(1), policy_mrn(2)],
        );

        let parent = lake.get_raw_policy(&policy_mrn(0)).unwrap();
        let mut expected: Vec<String> = own
            .iter()
            .chain(child_a.iter())
            .chain(child_b.iter())
            .cloned()
            .collect();
        expected.sort();
        expected.dedup();

        prop_assert_eq!(parent.filters.code_ids(), expected);
    }

    /// Failure-time bookkeeping: after any sequence of determined results,
    /// `failure_time` is 0 when passing and otherwise pins the first
    /// failing update since the most recent passing state.
    #[test]
    fn failure_time_tracks_first_failure(values in prop::collection::vec(prop::sample::select(vec![0u32, 50, 100]), 1..12)) {
        let clock = Arc::new(AtomicI64::new(0));
        let handle = clock.clone();
        let lake = Datalake::new().with_now_provider(move || handle.load(Ordering::SeqCst));
        let asset = asset_mrn(0);

        let mut expected_failure = 0i64;
        let mut last_value: Option<u32> = None;

        for (i, value) in values.iter().enumerate() {
            let now = (i as i64 + 1) * 10;
            clock.store(now, Ordering::SeqCst);

            lake.update_scores(
                &asset,
                &[Score {
                    qr_id: "check".to_string(),
                    score_type: ScoreType::Result,
                    value: *value,
                    weight: 1,
                    score_completion: 100,
                    data_completion: 100,
                    ..Score::default()
                }],
            )
            .unwrap();

            // Model: on a value change (or first write), a failing value
            // starts the clock unless it was already running.
            let changed = last_value != Some(*value);
            if changed {
                if *value == 100 {
                    expected_failure = 0;
                } else if last_value.is_none() || last_value == Some(100) {
                    expected_failure = now;
                }
            }
            last_value = Some(*value);

            let stored = lake.get_score(&asset, "check").unwrap();
            prop_assert_eq!(stored.failure_time, expected_failure);
            if *value == 100 {
                prop_assert_eq!(stored.failure_time, 0);
            }
        }
    }
}
