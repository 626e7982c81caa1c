//! Policy bundles: the YAML file format and the in-memory bundle map.
//!
//! A [`Bundle`] is the list form read from YAML documents. Compiling a
//! bundle realizes bundle-local UIDs into full MRNs, runs every query
//! through the external compiler, computes asset filters and checksums in
//! dependency order, and validates the result — yielding a [`BundleMap`]
//! with policies, queries, properties, and compiled code indexed for
//! lookup.
//!
//! # Example
//!
//! ```yaml
//! policies:
//!   - uid: ssh-policy
//!     name: SSH Hardening
//!     version: "1.0.0"
//!     groups:
//!       - filters:
//!           - mql: asset.family.contains('unix')
//!         checks:
//!           - uid: sshd-01
//! queries:
//!   - uid: sshd-01
//!     title: Ensure default SSH port
//!     mql: sshd.config.params["Port"] == 22
//!     impact: 30
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::compiler::{CodeBundle, QueryCompiler};
use crate::error::Error;
use crate::mrn;
use crate::policy::checksums::DependencyResolver;
use crate::policy::model::{
    Author, Filters, Impact, MemberAction, Mquery, Policy, PolicyGroup, PolicyRef, Property,
    ScoringSystem,
};

/// Lookup capability for queries and policies not present in a bundle.
///
/// Consulted by validation when a referenced MRN is not found locally, e.g.
/// content served by an upstream registry.
pub trait Library: Send + Sync {
    /// Whether a query with the given MRN exists.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures from the backing store.
    fn query_exists(&self, mrn: &str) -> Result<bool, Error>;

    /// Whether a policy with the given MRN exists.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures from the backing store.
    fn policy_exists(&self, mrn: &str) -> Result<bool, Error>;
}

// ============================================================================
// YAML document schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct BundleDoc {
    #[serde(default)]
    owner_mrn: Option<String>,
    #[serde(default)]
    policies: Vec<PolicyDoc>,
    #[serde(default)]
    queries: Vec<MqueryDoc>,
    #[serde(default)]
    props: Vec<PropertyDoc>,
}

#[derive(Debug, Deserialize)]
struct PolicyDoc {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    mrn: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    scoring_system: Option<ScoringSystem>,
    #[serde(default)]
    authors: Vec<Author>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    groups: Vec<GroupDoc>,
    #[serde(default)]
    props: Vec<PropertyDoc>,
}

#[derive(Debug, Deserialize)]
struct GroupDoc {
    #[serde(default)]
    title: String,
    #[serde(default)]
    filters: Vec<MqueryDoc>,
    #[serde(default)]
    checks: Vec<MqueryDoc>,
    #[serde(default)]
    queries: Vec<MqueryDoc>,
    #[serde(default)]
    policies: Vec<PolicyRefDoc>,
}

#[derive(Debug, Deserialize)]
struct MqueryDoc {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    mrn: String,
    #[serde(default)]
    title: String,
    /// Query source; `query` and `mql` are interchangeable spellings.
    #[serde(default, alias = "query")]
    mql: String,
    #[serde(default)]
    impact: Option<u32>,
    #[serde(default)]
    action: Option<MemberAction>,
    #[serde(default)]
    props: Vec<PropertyDoc>,
}

#[derive(Debug, Deserialize)]
struct PolicyRefDoc {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    mrn: String,
    #[serde(default)]
    action: Option<MemberAction>,
    #[serde(default)]
    impact: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PropertyDoc {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    mrn: String,
    #[serde(default)]
    mql: String,
}

// ============================================================================
// Bundle (list form)
// ============================================================================

/// A policy bundle in list form, as read from a YAML document.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    /// Owner MRN for realizing bundle-local UIDs.
    pub owner_mrn: Option<String>,
    /// Policies in document order.
    pub policies: Vec<Policy>,
    /// Shared queries in document order.
    pub queries: Vec<Mquery>,
    /// Shared properties in document order.
    pub props: Vec<Property>,
}

/// Owner used when a bundle declares none.
pub const DEFAULT_OWNER_MRN: &str = "//policy.rampart.dev";

impl Bundle {
    /// Parses a bundle from YAML.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the document does not match the schema.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let doc: BundleDoc = serde_yaml::from_str(yaml)
            .map_err(|e| Error::invalid_argument(format!("failed to parse bundle: {e}")))?;

        let mut bundle = Self {
            owner_mrn: doc.owner_mrn,
            policies: Vec::new(),
            queries: Vec::new(),
            props: Vec::new(),
        };

        for q in doc.queries {
            bundle.queries.push(convert_query(q));
        }
        for p in doc.props {
            bundle.props.push(convert_property(p));
        }
        for p in doc.policies {
            bundle.policies.push(convert_policy(p));
        }

        Ok(bundle)
    }

    /// Compiles the bundle into a validated, checksummed [`BundleMap`].
    ///
    /// Realizes UIDs into MRNs, compiles every query and filter, computes
    /// asset filters and all four checksums in dependency order, then
    /// validates each policy.
    ///
    /// # Errors
    ///
    /// Fails on compilation errors, unresolvable references, dependency
    /// cycles, or validation failures.
    pub fn compile(&self, compiler: &dyn QueryCompiler) -> Result<BundleMap, Error> {
        let owner = self
            .owner_mrn
            .clone()
            .unwrap_or_else(|| DEFAULT_OWNER_MRN.to_string());

        let mut map = BundleMap::new(&owner);

        // Shared queries first: realize MRNs and compile.
        for query in &self.queries {
            let mut query = query.clone();
            realize_query_mrn(&mut query, &owner)?;
            compile_query(&mut query, compiler, &mut map.code)?;
            map.queries.insert(query.mrn.clone(), query);
        }

        for prop in &self.props {
            let mut prop = prop.clone();
            if prop.mrn.is_empty() {
                prop.mrn = mrn::child_mrn(&owner, mrn::RESOURCE_QUERY, &prop.uid)?;
            }
            map.props.insert(prop.mrn.clone(), prop);
        }

        // Policies: realize MRNs so references can be resolved by UID.
        let mut policies: Vec<Policy> = Vec::with_capacity(self.policies.len());
        let mut uid_to_mrn = BTreeMap::new();
        for policy in &self.policies {
            let mut policy = policy.clone();
            if policy.mrn.is_empty() {
                policy.mrn = mrn::child_mrn(&owner, mrn::RESOURCE_POLICY, &policy.uid)?;
            }
            uid_to_mrn.insert(policy.uid.clone(), policy.mrn.clone());
            policies.push(policy);
        }

        for policy in &mut policies {
            self.realize_policy_members(policy, &owner, &uid_to_mrn, compiler, &mut map)?;
            map.policies.insert(policy.mrn.clone(), policy.clone());
        }

        // Filters and checksums flow deps-first.
        let sorted = map.policies_sorted_by_dependency()?;
        for policy in sorted {
            let mut policy = policy;
            policy.refresh_asset_filters(&map)?;
            policy.update_checksums(&map)?;
            map.policies.insert(policy.mrn.clone(), policy);
        }

        let policy_mrns: Vec<String> = map.policies.keys().cloned().collect();
        for policy_mrn in policy_mrns {
            let policy = map.policies[&policy_mrn].clone();
            map.validate_policy(&policy)?;
        }

        debug!(
            policies = map.policies.len(),
            queries = map.queries.len(),
            "bundle compiled"
        );
        Ok(map)
    }

    fn realize_policy_members(
        &self,
        policy: &mut Policy,
        owner: &str,
        uid_to_mrn: &BTreeMap<String, String>,
        compiler: &dyn QueryCompiler,
        map: &mut BundleMap,
    ) -> Result<(), Error> {
        let policy_mrn = policy.mrn.clone();

        for group in &mut policy.groups {
            for check in group.checks.iter_mut().chain(group.queries.iter_mut()) {
                realize_member_query(check, owner, compiler, map)?;
            }

            for policy_ref in &mut group.policies {
                if policy_ref.mrn.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "policy '{policy_mrn}' references a sub-policy without an MRN"
                    )));
                }
                if let Some(mrn) = uid_to_mrn.get(&policy_ref.mrn) {
                    policy_ref.mrn = mrn.clone();
                }
            }

            // Filters are compiled in place and re-keyed by CodeID.
            let raw: Vec<Mquery> = group.filters.items.values().cloned().collect();
            group.filters = Filters::default();
            for mut filter in raw {
                let code = compiler.compile(&filter.mql)?;
                filter.code_id = code.code_id.clone();
                if filter.mrn.is_empty() {
                    filter.mrn = format!("{policy_mrn}/assetfilter/{}", code.code_id);
                }
                map.code.insert(code.code_id.clone(), code);
                group.filters.insert(filter);
            }
        }

        Ok(())
    }
}

fn convert_query(doc: MqueryDoc) -> Mquery {
    Mquery {
        mrn: doc.mrn,
        uid: doc.uid,
        title: doc.title,
        mql: doc.mql,
        impact: doc.impact.map(|severity| Impact {
            severity,
            ..Impact::default()
        }),
        action: doc.action,
        code_id: String::new(),
        props: doc.props.into_iter().map(convert_property).collect(),
    }
}

fn convert_property(doc: PropertyDoc) -> Property {
    Property {
        mrn: doc.mrn,
        uid: doc.uid,
        mql: doc.mql,
    }
}

fn convert_policy(doc: PolicyDoc) -> Policy {
    Policy {
        mrn: doc.mrn,
        uid: doc.uid,
        name: doc.name,
        version: doc.version,
        scoring_system: doc.scoring_system.unwrap_or_default(),
        authors: doc.authors,
        tags: doc.tags,
        groups: doc.groups.into_iter().map(convert_group).collect(),
        props: doc.props.into_iter().map(convert_property).collect(),
        ..Policy::default()
    }
}

fn convert_group(doc: GroupDoc) -> PolicyGroup {
    let mut filters = Filters::default();
    for f in doc.filters {
        filters.insert(convert_query(f));
    }

    PolicyGroup {
        title: doc.title,
        filters,
        checks: doc.checks.into_iter().map(convert_query).collect(),
        queries: doc.queries.into_iter().map(convert_query).collect(),
        policies: doc
            .policies
            .into_iter()
            .map(|r| PolicyRef {
                mrn: if r.mrn.is_empty() { r.uid } else { r.mrn },
                action: r.action,
                impact: r.impact.map(|severity| Impact {
                    severity,
                    ..Impact::default()
                }),
                scoring_system: None,
            })
            .collect(),
        created: 0,
        modified: 0,
    }
}

fn realize_query_mrn(query: &mut Mquery, owner: &str) -> Result<(), Error> {
    if query.mrn.is_empty() {
        if query.uid.is_empty() {
            return Err(Error::invalid_argument(
                "query has neither an MRN nor a UID",
            ));
        }
        query.mrn = mrn::child_mrn(owner, mrn::RESOURCE_QUERY, &query.uid)?;
    }
    Ok(())
}

fn compile_query(
    query: &mut Mquery,
    compiler: &dyn QueryCompiler,
    code: &mut BTreeMap<String, CodeBundle>,
) -> Result<(), Error> {
    let bundle = compiler.compile(&query.mql)?;
    query.code_id = bundle.code_id.clone();
    code.insert(bundle.code_id.clone(), bundle);
    Ok(())
}

/// Realizes a group member query: resolve a UID reference against the shared
/// queries, or compile an inline definition and register it.
fn realize_member_query(
    member: &mut Mquery,
    owner: &str,
    compiler: &dyn QueryCompiler,
    map: &mut BundleMap,
) -> Result<(), Error> {
    realize_query_mrn(member, owner)?;

    if let Some(shared) = map.queries.get(&member.mrn) {
        member.code_id = shared.code_id.clone();
        if member.mql.is_empty() {
            member.mql = shared.mql.clone();
        }
        if member.impact.is_none() {
            member.impact = shared.impact;
        }
        return Ok(());
    }

    if member.mql.is_empty() {
        // Reference to a query this bundle does not define; validation will
        // consult the library.
        return Ok(());
    }

    compile_query(member, compiler, &mut map.code)?;
    map.queries.insert(member.mrn.clone(), member.clone());
    Ok(())
}

// ============================================================================
// BundleMap
// ============================================================================

/// A policy bundle with policies and queries indexed by MRN.
pub struct BundleMap {
    /// Owner MRN used when realizing UIDs.
    pub owner_mrn: String,
    /// Policies by MRN.
    pub policies: BTreeMap<String, Policy>,
    /// Queries by MRN.
    pub queries: BTreeMap<String, Mquery>,
    /// Properties by MRN.
    pub props: BTreeMap<String, Property>,
    /// Compiled code by CodeID.
    pub code: BTreeMap<String, CodeBundle>,
    /// Optional lookup for content not present locally.
    pub library: Option<Arc<dyn Library>>,
    remote_queries: BTreeSet<String>,
    remote_policies: BTreeSet<String>,
}

impl std::fmt::Debug for BundleMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleMap")
            .field("owner_mrn", &self.owner_mrn)
            .field("policies", &self.policies)
            .field("queries", &self.queries)
            .field("props", &self.props)
            .field("code", &self.code)
            .field("library", &self.library.as_ref().map(|_| "<library>"))
            .field("remote_queries", &self.remote_queries)
            .field("remote_policies", &self.remote_policies)
            .finish()
    }
}

impl BundleMap {
    /// Creates an empty map for the given owner.
    #[must_use]
    pub fn new(owner_mrn: &str) -> Self {
        Self {
            owner_mrn: owner_mrn.to_string(),
            policies: BTreeMap::new(),
            queries: BTreeMap::new(),
            props: BTreeMap::new(),
            code: BTreeMap::new(),
            library: None,
            remote_queries: BTreeSet::new(),
            remote_policies: BTreeSet::new(),
        }
    }

    /// Attaches a library for lookups of content not present locally.
    #[must_use]
    pub fn with_library(mut self, library: Arc<dyn Library>) -> Self {
        self.library = Some(library);
        self
    }

    /// Adds a policy and its queries to the map.
    pub fn add(&mut self, policy: Policy, queries: impl IntoIterator<Item = Mquery>) {
        let id = if policy.mrn.is_empty() {
            policy.uid.clone()
        } else {
            policy.mrn.clone()
        };
        self.policies.insert(id, policy);
        for query in queries {
            self.queries.insert(query.identifier().to_string(), query);
        }
    }

    /// Retains only the named policies.
    ///
    /// Queries are not trimmed. An empty list keeps everything.
    ///
    /// # Errors
    ///
    /// `NotFound` listing every missing name.
    pub fn select_policies(&mut self, names: &[String]) -> Result<(), Error> {
        if names.is_empty() {
            return Ok(());
        }

        let missing: Vec<&String> = names
            .iter()
            .filter(|n| !self.policies.contains_key(n.as_str()))
            .collect();
        if !missing.is_empty() {
            let list: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            return Err(Error::not_found(format!(
                "failed to find the following policies: {}",
                list.join(", ")
            )));
        }

        let keep: BTreeSet<&String> = names.iter().collect();
        self.policies.retain(|mrn, _| keep.contains(mrn));
        Ok(())
    }

    /// Returns the policies sorted dependencies-before-dependents.
    ///
    /// References to policies not present in the map are skipped; they are
    /// the library's concern.
    ///
    /// # Errors
    ///
    /// `Internal` when the local policy graph contains a cycle,
    /// `InvalidArgument` when a dependency MRN is empty.
    pub fn policies_sorted_by_dependency(&self) -> Result<Vec<Policy>, Error> {
        let mut visited = BTreeSet::new();
        let mut res = Vec::new();

        for mrn in self.policies.keys() {
            if visited.contains(mrn.as_str()) {
                continue;
            }
            let mut path = Vec::new();
            self.sort_visit(mrn, &mut visited, &mut path, &mut res)?;
        }

        Ok(res)
    }

    fn sort_visit(
        &self,
        mrn: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
        res: &mut Vec<Policy>,
    ) -> Result<(), Error> {
        visited.insert(mrn.to_string());
        path.push(mrn.to_string());

        let policy = &self.policies[mrn];
        for dep in policy.dependent_policy_mrns() {
            if dep.is_empty() {
                return Err(Error::invalid_argument(
                    "failed to sort policies: dependency MRN is empty",
                ));
            }
            if path.iter().any(|p| p == &dep) {
                return Err(Error::internal(format!(
                    "dependency cycle detected: {} -> {dep}",
                    path.join(" -> ")
                )));
            }
            if visited.contains(dep.as_str()) || !self.policies.contains_key(&dep) {
                continue;
            }
            self.sort_visit(&dep, visited, path, res)?;
        }

        path.pop();
        res.push(policy.clone());
        Ok(())
    }

    /// Validates a policy against this map.
    ///
    /// Checks the MRN grammar, the semver version (when present), and every
    /// group member reference, consulting the library on local misses.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for grammar and version failures,
    /// `FailedPrecondition` for add-of-existing / modify-of-missing members.
    pub fn validate_policy(&mut self, policy: &Policy) -> Result<(), Error> {
        if !mrn::is_valid(&policy.mrn) {
            return Err(Error::invalid_argument(format!(
                "policy MRN is not valid: {}",
                policy.mrn
            )));
        }

        if !policy.version.is_empty() {
            semver::Version::parse(&policy.version).map_err(|_| {
                Error::invalid_argument(format!(
                    "policy '{}' version '{}' is not a valid semver version",
                    policy.mrn, policy.version
                ))
            })?;
        }

        for group in policy.groups.clone() {
            self.validate_group(&group, &policy.mrn)?;
        }

        Ok(())
    }

    fn validate_group(&mut self, group: &PolicyGroup, policy_mrn: &str) -> Result<(), Error> {
        for filter in group.filters.items.values() {
            if filter.code_id.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "policy '{policy_mrn}' carries an uncompiled filter: {}",
                    filter.mql
                )));
            }
        }

        for check in group.checks.iter().chain(group.queries.iter()) {
            let exists = self.query_exists(&check.mrn)?;
            match check.action {
                Some(MemberAction::Add) if exists => {
                    return Err(Error::failed_precondition(format!(
                        "query already exists, but policy is trying to add it: {}",
                        check.mrn
                    )));
                }
                Some(MemberAction::Modify) if !exists => {
                    return Err(Error::failed_precondition(format!(
                        "query does not exist, but policy is trying to modify it: {}",
                        check.mrn
                    )));
                }
                _ => {}
            }
        }

        for policy_ref in &group.policies {
            if !self.policy_exists(&policy_ref.mrn)? {
                return Err(Error::failed_precondition(format!(
                    "policy does not exist, but policy is trying to use it: {}",
                    policy_ref.mrn
                )));
            }
        }

        Ok(())
    }

    /// Whether a query exists locally or in the library.
    ///
    /// Library hits are cached so repeated validation does not re-query.
    ///
    /// # Errors
    ///
    /// Propagates library lookup failures.
    pub fn query_exists(&mut self, mrn: &str) -> Result<bool, Error> {
        if self.queries.contains_key(mrn) || self.remote_queries.contains(mrn) {
            return Ok(true);
        }
        if let Some(library) = &self.library {
            if library.query_exists(mrn)? {
                self.remote_queries.insert(mrn.to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether a policy exists locally or in the library.
    ///
    /// # Errors
    ///
    /// Propagates library lookup failures.
    pub fn policy_exists(&mut self, mrn: &str) -> Result<bool, Error> {
        if self.policies.contains_key(mrn) || self.remote_policies.contains(mrn) {
            return Ok(true);
        }
        if let Some(library) = &self.library {
            if library.policy_exists(mrn)? {
                self.remote_policies.insert(mrn.to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Indexes all queries by their CodeID.
    #[must_use]
    pub fn queries_by_code_id(&self) -> BTreeMap<String, Mquery> {
        let mut res = BTreeMap::new();
        for query in self.queries.values() {
            if !query.code_id.is_empty() {
                res.insert(query.code_id.clone(), query.clone());
            }
        }
        res
    }

    /// Converts the map back to list form, sorted by MRN.
    #[must_use]
    pub fn to_bundle(&self) -> Bundle {
        Bundle {
            owner_mrn: Some(self.owner_mrn.clone()),
            policies: self.policies.values().cloned().collect(),
            queries: self.queries.values().cloned().collect(),
            props: self.props.values().cloned().collect(),
        }
    }
}

impl DependencyResolver for BundleMap {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    /// Deterministic compiler used across bundle tests: CodeID is a hash of
    /// the source, with one string datapoint derived from it.
    struct HashCompiler;

    impl QueryCompiler for HashCompiler {
        fn compile(&self, source: &str) -> Result<CodeBundle, Error> {
            if source.is_empty() {
                return Err(Error::invalid_argument("empty query source"));
            }
            let code_id = Checksum::new().add(source).encode();
            Ok(CodeBundle {
                code_id: code_id.clone(),
                source: source.to_string(),
                datapoints: vec![crate::compiler::Datapoint {
                    checksum: Checksum::new().add("dp").add(source).encode(),
                    data_type: crate::policy::model::DataType::Bool,
                }],
            })
        }
    }

    const SAMPLE: &str = r#"
policies:
  - uid: ssh-policy
    name: SSH Hardening
    version: "1.0.0"
    groups:
      - filters:
          - mql: asset.family.contains('unix')
        checks:
          - uid: sshd-01
queries:
  - uid: sshd-01
    title: Ensure default SSH port
    mql: sshd.config.params["Port"] == 22
    impact: 30
"#;

    #[test]
    fn parses_and_compiles_sample() {
        let bundle = Bundle::from_yaml(SAMPLE).unwrap();
        assert_eq!(bundle.policies.len(), 1);
        assert_eq!(bundle.queries.len(), 1);

        let map = bundle.compile(&HashCompiler).unwrap();
        assert_eq!(map.policies.len(), 1);

        let policy = map.policies.values().next().unwrap();
        assert_eq!(policy.mrn, "//policy.rampart.dev/policies/ssh-policy");
        assert!(!policy.graph_execution_checksum.is_empty());
        assert_eq!(policy.filters.items.len(), 1);

        let check = &policy.groups[0].checks[0];
        assert!(!check.code_id.is_empty());
        assert_eq!(check.impact.map(|i| i.severity), Some(30));
    }

    #[test]
    fn owner_mrn_prefixes_realized_mrns() {
        let yaml = format!("owner_mrn: //captain.example.com/spaces/dev\n{SAMPLE}");
        let map = Bundle::from_yaml(&yaml).unwrap().compile(&HashCompiler).unwrap();
        assert!(map
            .policies
            .contains_key("//captain.example.com/spaces/dev/policies/ssh-policy"));
    }

    #[test]
    fn invalid_semver_fails_validation() {
        let yaml = SAMPLE.replace("\"1.0.0\"", "\"not-a-version\"");
        let bundle = Bundle::from_yaml(&yaml).unwrap();
        let err = bundle.compile(&HashCompiler).unwrap_err();
        assert!(err.to_string().contains("semver"));
    }

    #[test]
    fn missing_sub_policy_fails_validation() {
        let yaml = r#"
policies:
  - uid: parent
    name: Parent
    version: "1.0.0"
    groups:
      - policies:
          - mrn: //captain.example.com/policies/ghost
"#;
        let bundle = Bundle::from_yaml(yaml).unwrap();
        let err = bundle.compile(&HashCompiler).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn modify_of_missing_query_fails() {
        let yaml = r#"
policies:
  - uid: p
    name: P
    version: "1.0.0"
    groups:
      - checks:
          - mrn: //captain.example.com/queries/ghost
            action: modify
"#;
        let bundle = Bundle::from_yaml(yaml).unwrap();
        let err = bundle.compile(&HashCompiler).unwrap_err();
        assert!(matches!(
            err,
            Error::FailedPrecondition { .. } | Error::NotFound { .. }
        ));
    }

    #[test]
    fn select_policies_drops_unlisted() {
        let yaml = r#"
policies:
  - uid: a
    name: A
    version: "1.0.0"
    groups:
      - checks:
          - uid: q
            mql: a == 1
  - uid: b
    name: B
    version: "1.0.0"
    groups:
      - checks:
          - uid: q
            mql: a == 1
"#;
        let mut map = Bundle::from_yaml(yaml).unwrap().compile(&HashCompiler).unwrap();
        let keep = "//policy.rampart.dev/policies/a".to_string();
        map.select_policies(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(map.policies.len(), 1);
        assert!(map.policies.contains_key(&keep));

        let err = map
            .select_policies(&["//policy.rampart.dev/policies/zzz".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn topological_sort_puts_dependencies_first() {
        let yaml = r#"
policies:
  - uid: parent
    name: Parent
    version: "1.0.0"
    groups:
      - policies:
          - uid: child
  - uid: child
    name: Child
    version: "1.0.0"
    groups:
      - checks:
          - uid: q
            mql: a == 1
"#;
        let map = Bundle::from_yaml(yaml).unwrap().compile(&HashCompiler).unwrap();
        let sorted = map.policies_sorted_by_dependency().unwrap();
        let order: Vec<&str> = sorted.iter().map(|p| p.uid.as_str()).collect();
        let child_pos = order.iter().position(|u| *u == "child").unwrap();
        let parent_pos = order.iter().position(|u| *u == "parent").unwrap();
        assert!(child_pos < parent_pos);
    }

    #[test]
    fn dependency_cycle_is_a_distinct_error() {
        let mut map = BundleMap::new(DEFAULT_OWNER_MRN);
        let a_mrn = "//policy.rampart.dev/policies/a".to_string();
        let b_mrn = "//policy.rampart.dev/policies/b".to_string();

        let mut a = Policy {
            mrn: a_mrn.clone(),
            ..Policy::default()
        };
        a.groups.push(PolicyGroup {
            policies: vec![PolicyRef {
                mrn: b_mrn.clone(),
                ..PolicyRef::default()
            }],
            ..PolicyGroup::default()
        });

        let mut b = Policy {
            mrn: b_mrn.clone(),
            ..Policy::default()
        };
        b.groups.push(PolicyGroup {
            policies: vec![PolicyRef {
                mrn: a_mrn.clone(),
                ..PolicyRef::default()
            }],
            ..PolicyGroup::default()
        });

        map.policies.insert(a_mrn, a);
        map.policies.insert(b_mrn, b);

        let err = map.policies_sorted_by_dependency().unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn library_lookup_is_cached() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingLibrary {
            calls: AtomicUsize,
        }

        impl Library for CountingLibrary {
            fn query_exists(&self, _mrn: &str) -> Result<bool, Error> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            fn policy_exists(&self, _mrn: &str) -> Result<bool, Error> {
                Ok(false)
            }
        }

        let library = Arc::new(CountingLibrary {
            calls: AtomicUsize::new(0),
        });
        let mut map = BundleMap::new(DEFAULT_OWNER_MRN).with_library(library.clone());

        let mrn = "//captain.example.com/queries/remote";
        assert!(map.query_exists(mrn).unwrap());
        assert!(map.query_exists(mrn).unwrap());
        assert_eq!(library.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn to_bundle_is_sorted_by_mrn() {
        let yaml = r#"
policies:
  - uid: zeta
    name: Z
    version: "1.0.0"
    groups:
      - checks:
          - uid: q
            mql: a == 1
  - uid: alpha
    name: A
    version: "1.0.0"
    groups:
      - checks:
          - uid: q
            mql: a == 1
"#;
        let map = Bundle::from_yaml(yaml).unwrap().compile(&HashCompiler).unwrap();
        let bundle = map.to_bundle();
        let mrns: Vec<&str> = bundle.policies.iter().map(|p| p.mrn.as_str()).collect();
        let mut sorted = mrns.clone();
        sorted.sort_unstable();
        assert_eq!(mrns, sorted);
        assert_eq!(bundle.queries.len(), 1);
    }

    #[test]
    fn queries_by_code_id_dedups_identical_source() {
        let yaml = r#"
policies:
  - uid: p1
    name: P1
    version: "1.0.0"
    groups:
      - checks:
          - uid: q1
queries:
  - uid: q1
    mql: file("/etc/ssh") != empty
  - uid: q2
    mql: file("/etc/ssh") != empty
"#;
        let map = Bundle::from_yaml(yaml).unwrap().compile(&HashCompiler).unwrap();
        // Two MRNs, one CodeID.
        assert_eq!(map.queries.len(), 2);
        assert_eq!(map.queries_by_code_id().len(), 1);
    }
}
