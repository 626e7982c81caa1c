//! Policy bundles, checksums, filters, and resolution artifacts.
//!
//! This module holds the engine's data model and the pure logic attached to
//! it:
//!
//! - `model`: policies, groups, queries, scores, data values, reports
//! - `checksums`: the dual-axis (local/graph x content/execution)
//!   checksum derivation and invalidation rules
//! - `filters`: the asset-filter closure over the policy graph
//! - `bundle`: the YAML bundle format and the indexed bundle map
//! - `resolved`: execution jobs, collector jobs, and reporting trees
//!
//! Storage and resolution live in [`crate::datalake`] and
//! [`crate::resolver`].

mod bundle;
mod checksums;
mod filters;
mod model;
mod resolved;

pub use bundle::{Bundle, BundleMap, Library, DEFAULT_OWNER_MRN};
pub use checksums::{DependencyResolver, CHECKSUM_VERSION};
pub use model::{
    Author, DataType, DataValue, Filters, Impact, MemberAction, Mquery, Policy, PolicyGroup,
    PolicyRef, Property, Report, Score, ScoreType, ScoringSystem,
};
pub use resolved::{
    CollectorJob, DatapointInfo, ExecutionJob, ExecutionQuery, ReportingJob, ResolvedPolicy,
    ScoringSpec, QR_ID_ROOT,
};
