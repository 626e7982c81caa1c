//! Local scan service: per-asset fan-out over a policy bundle.
//!
//! A scan takes an inventory of assets and a compiled bundle, stores the
//! bundle, and fans out one worker per asset. Each worker opens a
//! connection through the [`ConnectionProvider`] capability, assigns the
//! bundle's policies to the asset, resolves the asset's wrapper policy
//! against the filters the connection supports, runs the execution job,
//! posts data and scores back, and finishes with the asset's report.
//!
//! Work inside an asset is sequential; assets run in parallel. The scan
//! loop checks for cancellation between assets — in-flight workers drain
//! to completion so connections are released on every exit path (all
//! connections are dropped before a worker returns).

mod collector;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, warn};

use crate::datalake::Datalake;
use crate::error::Error;
use crate::policy::{BundleMap, DataValue, ExecutionQuery, Mquery, Report};
use crate::resolver::PolicyResolver;

/// An asset to scan.
#[derive(Debug, Clone, Default)]
pub struct Asset {
    /// The asset's MRN.
    pub mrn: String,
    /// Human-readable name for logs.
    pub name: String,
}

/// A live connection to one asset.
///
/// Connections are released by dropping them; workers drop theirs before
/// returning, on every exit path.
pub trait AssetConnection: Send {
    /// Evaluates an asset filter on this asset.
    ///
    /// # Errors
    ///
    /// Connection and evaluation failures.
    fn matches_filter(&self, filter: &Mquery) -> Result<bool, Error>;

    /// Runs one compiled query and returns its datapoint values by
    /// checksum.
    ///
    /// # Errors
    ///
    /// Connection and execution failures.
    fn run_query(&self, query: &ExecutionQuery) -> Result<BTreeMap<String, DataValue>, Error>;
}

/// Capability that opens connections to assets.
pub trait ConnectionProvider: Send + Sync {
    /// Opens a connection to the given asset.
    ///
    /// # Errors
    ///
    /// Connection failures; the asset is reported as a scan error.
    fn open(&self, asset: &Asset) -> Result<Box<dyn AssetConnection>, Error>;
}

/// Cooperatively cancels a running scan.
///
/// Cloneable; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A scan request: assets plus the bundle to apply.
pub struct ScanJob {
    /// Assets to scan.
    pub inventory: Vec<Asset>,
    /// The compiled bundle whose policies get assigned to every asset.
    pub bundle: BundleMap,
}

/// The outcome of a scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Reports by asset MRN.
    pub reports: BTreeMap<String, Report>,
    /// Scan errors by asset MRN, rendered as messages.
    pub errors: BTreeMap<String, String>,
    /// Whether the scan stopped early due to cancellation.
    pub cancelled: bool,
}

#[derive(Default)]
struct AggregateReporter {
    reports: BTreeMap<String, Report>,
    errors: BTreeMap<String, String>,
}

impl AggregateReporter {
    fn add_report(&mut self, asset: &Asset, report: Report) {
        self.reports.insert(asset.mrn.clone(), report);
    }

    fn add_scan_error(&mut self, asset: &Asset, err: &Error) {
        self.errors.insert(asset.mrn.clone(), err.to_string());
    }
}

/// The local scan service.
pub struct LocalScanner {
    resolver: PolicyResolver,
}

impl Default for LocalScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScanner {
    /// Creates a scanner over a fresh in-memory datalake.
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolver: PolicyResolver::new(Arc::new(Datalake::new())),
        }
    }

    /// Creates a scanner over an existing resolver.
    #[must_use]
    pub fn with_resolver(resolver: PolicyResolver) -> Self {
        Self { resolver }
    }

    /// The underlying resolution service.
    #[must_use]
    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Runs a scan: one worker per asset, cancellation checked between
    /// assets, in-flight workers drained before returning.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty inventory, `Cancelled` when the scan
    /// was cancelled before any asset completed. Per-asset failures do not
    /// fail the scan; they are collected in [`ScanResult::errors`].
    pub fn run(
        &self,
        job: &ScanJob,
        provider: &dyn ConnectionProvider,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, Error> {
        if job.inventory.is_empty() {
            return Err(Error::invalid_argument("missing inventory"));
        }

        self.resolver.lake().set_bundle(&job.bundle)?;
        let policy_mrns: Vec<String> = job.bundle.policies.keys().cloned().collect();

        debug!(assets = job.inventory.len(), "distributing scan job");

        let reporter = Mutex::new(AggregateReporter::default());
        let mut cancelled = false;

        thread::scope(|s| {
            for asset in &job.inventory {
                if cancel.is_cancelled() {
                    warn!("scan has been cancelled, draining in-flight assets");
                    cancelled = true;
                    break;
                }

                let reporter = &reporter;
                let resolver = &self.resolver;
                let policy_mrns = &policy_mrns;
                s.spawn(move || {
                    debug!(asset = %asset.mrn, name = %asset.name, "connecting to asset");
                    match run_asset_job(resolver, policy_mrns, asset, provider) {
                        Ok(report) => {
                            let mut reporter = reporter.lock().expect("reporter mutex poisoned");
                            reporter.add_report(asset, report);
                        }
                        Err(err) => {
                            error!(asset = %asset.mrn, error = %err, "asset scan failed");
                            let mut reporter = reporter.lock().expect("reporter mutex poisoned");
                            reporter.add_scan_error(asset, &err);
                        }
                    }
                });
            }
        });

        let reporter = reporter.into_inner().expect("reporter mutex poisoned");
        if cancelled && reporter.reports.is_empty() && reporter.errors.is_empty() {
            return Err(Error::cancelled("scan cancelled before any asset completed"));
        }

        Ok(ScanResult {
            reports: reporter.reports,
            errors: reporter.errors,
            cancelled,
        })
    }
}

/// Runs the full per-asset pipeline: assign, resolve, execute, store,
/// report. The connection is dropped before this returns.
fn run_asset_job(
    resolver: &PolicyResolver,
    policy_mrns: &[String],
    asset: &Asset,
    provider: &dyn ConnectionProvider,
) -> Result<Report, Error> {
    let conn = provider.open(asset)?;

    resolver.assign(&asset.mrn, policy_mrns)?;

    // The wrapper policy unions the filters of everything assigned; probe
    // each one against the live connection.
    let wrapper = resolver.lake().get_validated_policy(&asset.mrn)?;
    let mut asset_filters = Vec::new();
    for filter in wrapper.filters.items.values() {
        if conn.matches_filter(filter)? {
            asset_filters.push(filter.clone());
        }
    }

    let resolved = resolver.resolve(&asset.mrn, &asset_filters)?;
    resolver.set_asset_resolved_policy(&asset.mrn, &resolved)?;

    let mut data = BTreeMap::new();
    let mut query_errors = BTreeMap::new();
    for query in resolved.execution_job.queries.values() {
        match conn.run_query(query) {
            Ok(values) => data.extend(values),
            Err(err) => {
                warn!(
                    asset = %asset.mrn,
                    code_id = %query.code_id,
                    error = %err,
                    "query execution failed"
                );
                for datapoint in &query.datapoints {
                    query_errors.insert(datapoint.clone(), err.to_string());
                }
            }
        }
    }

    let scores = collector::rollup_scores(&resolved.collector_job, &data, &query_errors, &asset.mrn);
    resolver.store_results(&asset.mrn, &data, &scores)?;

    resolver.get_report(&asset.mrn, &asset.mrn)
}
