//! # rampart-core
//!
//! Core library for rampart - a policy compliance engine.
//!
//! This crate takes declarative security/compliance policies (trees of
//! checks, data-collection queries, and sub-policy references gated by
//! asset filters) and, for a given asset, produces a resolved policy: a
//! flattened, deduplicated execution plan plus a reporting tree that
//! aggregates per-query scores into an overall asset score. The core
//! persists, incrementally refreshes, and invalidates those plans as
//! policies are mutated.
//!
//! ## Features
//!
//! - **Content-addressed checksums**: four checksums per policy across two
//!   orthogonal axes (local/graph x content/execution), so mutations
//!   invalidate exactly the right downstream artifacts
//! - **Filter propagation**: effective asset filters flow through the
//!   policy DAG via mirrored parent/child edges
//! - **Resolution**: policy DAG + asset filters in, execution job and
//!   collector job out, memoized by `(graph checksum, filters checksum)`
//! - **Scoring store**: per-asset scores with first-failure and
//!   value-modified bookkeeping behind a write-through cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rampart_core::datalake::Datalake;
//! use rampart_core::policy::Bundle;
//! use rampart_core::resolver::PolicyResolver;
//!
//! # fn example(compiler: &dyn rampart_core::compiler::QueryCompiler)
//! # -> Result<(), rampart_core::error::Error> {
//! let yaml = std::fs::read_to_string("policy.yaml").expect("bundle file");
//! let bundle = Bundle::from_yaml(&yaml)?;
//! let map = bundle.compile(compiler)?;
//!
//! let resolver = PolicyResolver::new(Arc::new(Datalake::new()));
//! resolver.lake().set_bundle(&map)?;
//!
//! let asset = "//captain.example.com/assets/linux-1";
//! let policies: Vec<String> = map.policies.keys().cloned().collect();
//! resolver.assign(asset, &policies)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod checksum;
pub mod compiler;
pub mod datalake;
pub mod error;
pub mod mrn;
pub mod policy;
pub mod resolver;
pub mod scan;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::compiler::{CodeBundle, QueryCompiler};
    pub use crate::datalake::Datalake;
    pub use crate::error::{Error, ErrorCode};
    pub use crate::policy::{Bundle, BundleMap, Mquery, Policy, Report, ResolvedPolicy, Score};
    pub use crate::resolver::PolicyResolver;
    pub use crate::scan::{CancellationToken, LocalScanner, ScanJob};
}

pub use error::{Error, ErrorCode};
pub use policy::{Bundle, BundleMap, Policy, Report, ResolvedPolicy};
pub use resolver::PolicyResolver;
