//! External query compiler capability.
//!
//! The engine does not understand query source text. Compilation is an
//! external collaborator reached through [`QueryCompiler`]: given source, it
//! returns a [`CodeBundle`] — the executable artifact — whose `code_id` is a
//! content hash of the compiled form. The CodeID is the deduplication key
//! for execution: two queries with identical source from different policies
//! collapse to one execution.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::DataType;

/// One result cell a compiled query reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Checksum identifying the cell within an asset's namespace.
    pub checksum: String,
    /// Declared type of the cell.
    #[serde(default)]
    pub data_type: DataType,
}

/// A compiled query executable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeBundle {
    /// Content hash of the compiled form.
    pub code_id: String,
    /// The source the bundle was compiled from.
    #[serde(default)]
    pub source: String,
    /// Result cells this query reports when executed.
    #[serde(default)]
    pub datapoints: Vec<Datapoint>,
}

/// Capability that turns query source into executable code.
///
/// Implementations must be deterministic: identical source yields an
/// identical `code_id`.
pub trait QueryCompiler: Send + Sync {
    /// Compiles query source into a [`CodeBundle`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the source does not compile.
    fn compile(&self, source: &str) -> Result<CodeBundle, Error>;
}
