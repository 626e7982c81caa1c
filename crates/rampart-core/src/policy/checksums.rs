//! Dual-axis policy checksums.
//!
//! Each policy carries four checksums spanning two orthogonal axes:
//!
//! | | Content (documentation) | Execution (what runs) |
//! |---|---|---|
//! | **Local** | own names, authors, tags, timestamps | own groups' checks, queries, refs, filters |
//! | **Graph** | local content + dependencies' graph content | local execution + dependencies' graph execution + filters |
//!
//! Invalidation follows the dependency direction: clearing local clears
//! graph too, clearing graph leaves local intact. [`Policy::update_checksums`]
//! recomputes only cleared fields and is idempotent, so callers can invoke
//! it after every mutation without paying for untouched axes.

use crate::checksum::Checksum;
use crate::error::Error;
use crate::policy::model::{Impact, MemberAction, Mquery, Policy, ScoringSystem};

/// Generation tag folded into every derived checksum.
pub const CHECKSUM_VERSION: &str = "v2";

/// Capability for looking up the policies and queries a checksum or filter
/// computation depends on.
pub trait DependencyResolver {
    /// Returns the policy stored under `mrn`.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such policy exists.
    fn policy(&self, mrn: &str) -> Result<Policy, Error>;

    /// Returns the query stored under `mrn`.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such query exists.
    fn query(&self, mrn: &str) -> Result<Mquery, Error>;
}

impl Policy {
    /// Clears all four checksums.
    ///
    /// Use after mutating any local field; graph checksums depend on local
    /// ones, so they are cleared together.
    pub fn invalidate_local_checksums(&mut self) {
        self.local_content_checksum.clear();
        self.local_execution_checksum.clear();
        self.graph_content_checksum.clear();
        self.graph_execution_checksum.clear();
    }

    /// Clears the graph checksums only.
    ///
    /// Use when a dependency (not this policy itself) changed.
    pub fn invalidate_graph_checksums(&mut self) {
        self.graph_content_checksum.clear();
        self.graph_execution_checksum.clear();
    }

    /// Clears the execution checksums on both axes.
    ///
    /// Use when execution-relevant members changed (e.g. assignment deltas)
    /// but documentation fields did not.
    pub fn invalidate_execution_checksums(&mut self) {
        self.local_execution_checksum.clear();
        self.graph_execution_checksum.clear();
    }

    /// Recomputes any cleared checksum.
    ///
    /// Dependencies are walked lazily through `resolver`; a dependency whose
    /// own graph checksums are cleared is recomputed on a local copy first.
    /// Calling this on a policy with all four checksums present is a no-op.
    ///
    /// # Errors
    ///
    /// Fails when a referenced policy or query cannot be resolved.
    pub fn update_checksums(&mut self, resolver: &dyn DependencyResolver) -> Result<(), Error> {
        if self.local_execution_checksum.is_empty() {
            self.local_execution_checksum = self.compute_local_execution(resolver)?;
            self.graph_execution_checksum.clear();
        }
        if self.local_content_checksum.is_empty() {
            self.local_content_checksum = self.compute_local_content();
            self.graph_content_checksum.clear();
        }

        if self.graph_execution_checksum.is_empty() || self.graph_content_checksum.is_empty() {
            let mut dep_execution = Vec::new();
            let mut dep_content = Vec::new();

            for dep_mrn in self.dependent_policy_mrns() {
                let mut dep = resolver.policy(&dep_mrn)?;
                if dep.graph_execution_checksum.is_empty()
                    || dep.graph_content_checksum.is_empty()
                {
                    dep.update_checksums(resolver)?;
                }
                dep_execution.push(dep.graph_execution_checksum);
                dep_content.push(dep.graph_content_checksum);
            }

            if self.graph_execution_checksum.is_empty() {
                let mut checksum = Checksum::new()
                    .add(CHECKSUM_VERSION)
                    .add(&self.local_execution_checksum)
                    .add_sorted(dep_execution.iter());
                checksum = checksum.add_sorted(self.filters.code_ids());
                self.graph_execution_checksum = checksum.encode();
            }
            if self.graph_content_checksum.is_empty() {
                self.graph_content_checksum = Checksum::new()
                    .add(CHECKSUM_VERSION)
                    .add(&self.local_content_checksum)
                    .add_sorted(dep_content.iter())
                    .encode();
            }
        }

        Ok(())
    }

    fn compute_local_execution(&self, resolver: &dyn DependencyResolver) -> Result<String, Error> {
        let mut checksum = Checksum::new().add(CHECKSUM_VERSION).add(&self.mrn);

        for group in &self.groups {
            checksum = checksum.add("group");

            for check in &group.checks {
                checksum = checksum.add("check").add(&check.mrn);
                checksum = checksum.add(&query_code_id(check, resolver)?);
                checksum = fold_impact(checksum, check.impact.as_ref());
                checksum = fold_action(checksum, check.action);
            }
            for query in &group.queries {
                checksum = checksum.add("query").add(&query.mrn);
                checksum = checksum.add(&query_code_id(query, resolver)?);
                checksum = fold_action(checksum, query.action);
            }
            for policy_ref in &group.policies {
                checksum = checksum.add("policy").add(&policy_ref.mrn);
                checksum = fold_action(checksum, policy_ref.action);
                checksum = fold_impact(checksum, policy_ref.impact.as_ref());
                checksum = fold_scoring(checksum, policy_ref.scoring_system);
            }

            checksum = checksum.add_sorted(group.filters.code_ids());
        }

        let mut prop_ids: Vec<String> = self
            .props
            .iter()
            .map(|p| format!("{}\x00{}", p.identifier(), p.mql))
            .collect();
        prop_ids.sort();
        for id in &prop_ids {
            checksum = checksum.add(id);
        }

        checksum = checksum.add(self.scoring_system.label());

        Ok(checksum.encode())
    }

    fn compute_local_content(&self) -> String {
        let mut checksum = Checksum::new()
            .add(CHECKSUM_VERSION)
            .add(&self.local_execution_checksum)
            .add(&self.owner_mrn)
            .add(&self.name)
            .add(&self.version);

        for author in &self.authors {
            checksum = checksum.add(&author.name).add(&author.email);
        }

        let tags: Vec<String> = self
            .tags
            .iter()
            .map(|(k, v)| format!("{k}\x00{v}"))
            .collect();
        checksum = checksum.add_sorted(tags.iter());

        for group in &self.groups {
            checksum = checksum
                .add(&group.title)
                .add(&group.created.to_string())
                .add(&group.modified.to_string());
        }

        checksum.encode()
    }
}

fn query_code_id(query: &Mquery, resolver: &dyn DependencyResolver) -> Result<String, Error> {
    if !query.code_id.is_empty() {
        return Ok(query.code_id.clone());
    }
    if query.mrn.is_empty() {
        return Ok(String::new());
    }
    Ok(resolver.query(&query.mrn)?.code_id)
}

fn fold_impact(checksum: Checksum, impact: Option<&Impact>) -> Checksum {
    match impact {
        None => checksum.add("no-impact"),
        Some(impact) => checksum
            .add(&impact.severity.to_string())
            .add(impact.scoring.label())
            .add(&impact.weight.to_string()),
    }
}

fn fold_action(checksum: Checksum, action: Option<MemberAction>) -> Checksum {
    match action {
        None => checksum.add("no-action"),
        Some(MemberAction::Add) => checksum.add("add"),
        Some(MemberAction::Modify) => checksum.add("modify"),
        Some(MemberAction::Remove) => checksum.add("remove"),
    }
}

fn fold_scoring(checksum: Checksum, scoring: Option<ScoringSystem>) -> Checksum {
    match scoring {
        None => checksum.add("no-scoring"),
        Some(s) => checksum.add(s.label()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::policy::model::{Author, PolicyGroup, PolicyRef};

    /// Resolver over in-memory maps, for checksum tests.
    struct MapResolver {
        policies: BTreeMap<String, Policy>,
        queries: BTreeMap<String, Mquery>,
    }

    impl DependencyResolver for MapResolver {
        fn policy(&self, mrn: &str) -> Result<Policy, Error> {
            self.policies
                .get(mrn)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("policy '{mrn}'")))
        }

        fn query(&self, mrn: &str) -> Result<Mquery, Error> {
            self.queries
                .get(mrn)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("query '{mrn}'")))
        }
    }

    fn empty_resolver() -> MapResolver {
        MapResolver {
            policies: BTreeMap::new(),
            queries: BTreeMap::new(),
        }
    }

    fn sample_policy() -> Policy {
        Policy {
            mrn: "//captain.example.com/policies/ssh".to_string(),
            name: "SSH Hardening".to_string(),
            version: "1.0.0".to_string(),
            owner_mrn: "//captain.example.com".to_string(),
            groups: vec![PolicyGroup {
                checks: vec![Mquery {
                    mrn: "//captain.example.com/queries/sshd-01".to_string(),
                    mql: "sshd.config.params[\"Port\"] == 22".to_string(),
                    code_id: "code-sshd-01".to_string(),
                    impact: Some(Impact {
                        severity: 30,
                        ..Impact::default()
                    }),
                    ..Mquery::default()
                }],
                ..PolicyGroup::default()
            }],
            ..Policy::default()
        }
    }

    fn checksums(p: &Policy) -> [String; 4] {
        [
            p.local_content_checksum.clone(),
            p.local_execution_checksum.clone(),
            p.graph_content_checksum.clone(),
            p.graph_execution_checksum.clone(),
        ]
    }

    #[test]
    fn update_fills_all_four() {
        let mut p = sample_policy();
        p.update_checksums(&empty_resolver()).unwrap();
        for sum in checksums(&p) {
            assert!(!sum.is_empty());
        }
    }

    #[test]
    fn recompute_is_stable() {
        let mut p = sample_policy();
        p.update_checksums(&empty_resolver()).unwrap();
        let before = checksums(&p);

        p.invalidate_local_checksums();
        p.update_checksums(&empty_resolver()).unwrap();
        assert_eq!(before, checksums(&p));
    }

    #[test]
    fn update_is_idempotent_without_invalidation() {
        let mut p = sample_policy();
        p.update_checksums(&empty_resolver()).unwrap();
        let before = checksums(&p);
        p.update_checksums(&empty_resolver()).unwrap();
        assert_eq!(before, checksums(&p));
    }

    #[test]
    fn content_mutation_leaves_execution_checksums() {
        let cases: Vec<(&str, fn(&mut Policy))> = vec![
            ("author changed", |p| {
                p.authors = vec![Author {
                    name: "Bob".to_string(),
                    email: String::new(),
                }];
            }),
            ("tags changed", |p| {
                p.tags.insert("key".to_string(), "val".to_string());
            }),
            ("name changed", |p| p.name = "nu name".to_string()),
            ("version changed", |p| p.version = "1.2.3".to_string()),
            ("group date changed", |p| p.groups[0].created = 12345),
        ];

        for (msg, mutate) in cases {
            let mut p = sample_policy();
            p.update_checksums(&empty_resolver()).unwrap();
            let before = checksums(&p);

            mutate(&mut p);
            p.invalidate_local_checksums();
            p.update_checksums(&empty_resolver()).unwrap();
            let after = checksums(&p);

            assert_ne!(before[0], after[0], "{msg}: local content must change");
            assert_eq!(before[1], after[1], "{msg}: local execution must hold");
            assert_ne!(before[2], after[2], "{msg}: graph content must change");
            assert_eq!(before[3], after[3], "{msg}: graph execution must hold");
        }
    }

    #[test]
    fn execution_mutation_changes_all_four() {
        let cases: Vec<(&str, fn(&mut Policy))> = vec![
            ("mrn changed", |p| {
                p.mrn = "//captain.example.com/policies/other".to_string();
            }),
            ("code id changed", |p| {
                p.groups[0].checks[0].code_id = "code-other".to_string();
            }),
            ("scoring spec changed", |p| {
                p.groups[0].checks[0].impact = Some(Impact {
                    severity: 30,
                    scoring: ScoringSystem::Worst,
                    weight: 1,
                });
            }),
        ];

        for (msg, mutate) in cases {
            let mut p = sample_policy();
            p.update_checksums(&empty_resolver()).unwrap();
            let before = checksums(&p);

            mutate(&mut p);
            p.invalidate_local_checksums();
            p.update_checksums(&empty_resolver()).unwrap();
            let after = checksums(&p);

            for i in 0..4 {
                assert_ne!(before[i], after[i], "{msg}: checksum {i} must change");
            }
        }
    }

    #[test]
    fn dependency_graph_checksum_feeds_parent() {
        let mut dep = Policy {
            mrn: "//captain.example.com/policies/dep".to_string(),
            version: "1.0.0".to_string(),
            ..Policy::default()
        };
        dep.update_checksums(&empty_resolver()).unwrap();

        let mut parent = sample_policy();
        parent.groups[0].policies.push(PolicyRef {
            mrn: dep.mrn.clone(),
            ..PolicyRef::default()
        });

        let mut resolver = empty_resolver();
        resolver.policies.insert(dep.mrn.clone(), dep.clone());

        parent.update_checksums(&resolver).unwrap();
        let before = parent.graph_execution_checksum.clone();

        // Mutate the dependency's execution surface and recompute.
        let mut dep2 = dep.clone();
        dep2.groups.push(PolicyGroup {
            checks: vec![Mquery {
                mrn: "//captain.example.com/queries/new".to_string(),
                code_id: "code-new".to_string(),
                ..Mquery::default()
            }],
            ..PolicyGroup::default()
        });
        dep2.invalidate_local_checksums();
        dep2.update_checksums(&empty_resolver()).unwrap();
        resolver.policies.insert(dep2.mrn.clone(), dep2);

        parent.invalidate_graph_checksums();
        parent.update_checksums(&resolver).unwrap();
        assert_ne!(before, parent.graph_execution_checksum);
    }

    #[test]
    fn filter_change_moves_graph_execution_only() {
        let mut p = sample_policy();
        p.update_checksums(&empty_resolver()).unwrap();
        let before = checksums(&p);

        p.filters.insert(Mquery {
            code_id: "filter-1".to_string(),
            mql: "asset.family.contains('unix')".to_string(),
            ..Mquery::default()
        });
        p.invalidate_graph_checksums();
        p.update_checksums(&empty_resolver()).unwrap();
        let after = checksums(&p);

        assert_eq!(before[0], after[0]);
        assert_eq!(before[1], after[1]);
        assert_eq!(before[2], after[2]);
        assert_ne!(before[3], after[3]);
    }
}
