//! Asset filter closure.
//!
//! A policy's effective asset filters are the union of the filter queries
//! declared on its own groups and the effective filters of every direct
//! sub-policy. Because each sub-policy maintains the same closure, the
//! union over direct dependencies is transitive without walking the whole
//! graph on every refresh.

use std::collections::BTreeSet;

use crate::error::Error;
use crate::policy::checksums::DependencyResolver;
use crate::policy::model::{Filters, Policy};

impl Policy {
    /// MRNs of all policies referenced by this policy's groups.
    #[must_use]
    pub fn dependent_policy_mrns(&self) -> BTreeSet<String> {
        let mut res = BTreeSet::new();
        for group in &self.groups {
            for policy_ref in &group.policies {
                res.insert(policy_ref.mrn.clone());
            }
        }
        res
    }

    /// Computes the effective asset filters without mutating the policy.
    ///
    /// # Errors
    ///
    /// Fails when a direct sub-policy cannot be resolved.
    pub fn compute_asset_filters(
        &self,
        resolver: &dyn DependencyResolver,
    ) -> Result<Filters, Error> {
        let mut filters = Filters::default();

        for group in &self.groups {
            filters.union(&group.filters);
        }

        for dep_mrn in self.dependent_policy_mrns() {
            let dep = resolver.policy(&dep_mrn)?;
            filters.union(&dep.filters);
        }

        Ok(filters)
    }

    /// Recomputes and stores the effective asset filters.
    ///
    /// # Errors
    ///
    /// Fails when a direct sub-policy cannot be resolved.
    pub fn refresh_asset_filters(
        &mut self,
        resolver: &dyn DependencyResolver,
    ) -> Result<(), Error> {
        self.filters = self.compute_asset_filters(resolver)?;
        Ok(())
    }
}
