//! Error taxonomy for the engine's service surface.
//!
//! Every error carries a status code modeled after the classic RPC set so a
//! transport layer can map it without inspecting variants:
//!
//! - `InvalidArgument` — malformed MRN, unsupported delta action, semver
//!   parse failure, type mismatch on data upload
//! - `NotFound` — missing asset, policy, query, score, or data slot
//! - `FailedPrecondition` — mutation against a policy with no groups,
//!   add-of-existing / modify-of-missing members
//! - `Unavailable` — the cache refused a write (retryable)
//! - `Internal` — invariant violations (cycles, broken edge symmetry)
//!
//! Variants that callers are expected to render carry structured details,
//! e.g. [`Error::NoMatchingPolicy`] lists both filter sets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mrn::MrnError;
use crate::policy::DataType;

/// Status code attached to every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The request was malformed.
    InvalidArgument,
    /// A required entity does not exist.
    NotFound,
    /// The entity exists but is in a state that rejects the operation.
    FailedPrecondition,
    /// A backing store refused the operation; retrying may succeed.
    Unavailable,
    /// An internal invariant was violated.
    Internal,
}

/// A single rejected datapoint from a data upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMismatch {
    /// The datapoint checksum whose value was rejected.
    pub checksum: String,
    /// The type declared in the collector job's catalog.
    pub expected: DataType,
    /// The type carried by the uploaded value.
    pub received: DataType,
}

/// Errors produced by the engine core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request was malformed.
    #[error("{message}")]
    InvalidArgument {
        /// Human-readable description.
        message: String,
    },

    /// A required entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description.
        message: String,
    },

    /// The entity exists but rejects the operation in its current state.
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Human-readable description.
        message: String,
    },

    /// A backing store refused a write.
    #[error("unavailable: {message}")]
    Unavailable {
        /// Human-readable description.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal: {message}")]
    Internal {
        /// Human-readable description.
        message: String,
    },

    /// The operation was cancelled before completion.
    ///
    /// Distinct from internal failure so callers can tell an aborted scan
    /// from a broken one.
    #[error("cancelled: {message}")]
    Cancelled {
        /// Human-readable description.
        message: String,
    },

    /// The asset's filters do not intersect the policy's supported filters.
    #[error("asset does not match any filters of policy '{policy}'")]
    NoMatchingPolicy {
        /// The policy that was being resolved.
        policy: String,
        /// Filter queries the policy supports.
        supported_filters: Vec<String>,
        /// Filter queries the asset presented.
        asset_filters: Vec<String>,
    },

    /// One or more uploaded datapoints disagreed with the catalog types.
    ///
    /// Mismatches are accumulated per checksum; entries that matched were
    /// still stored.
    #[error("{} datapoint(s) rejected: types don't match", mismatches.len())]
    DataTypeMismatch {
        /// The rejected datapoints.
        mismatches: Vec<TypeMismatch>,
    },
}

impl Error {
    /// Convenience constructor for [`Error::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::FailedPrecondition`].
    #[must_use]
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Unavailable`].
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Cancelled`].
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// The status code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. }
            | Self::NoMatchingPolicy { .. }
            | Self::DataTypeMismatch { .. } => ErrorCode::InvalidArgument,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::FailedPrecondition { .. } => ErrorCode::FailedPrecondition,
            Self::Unavailable { .. } | Self::Cancelled { .. } => ErrorCode::Unavailable,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }
}

impl From<MrnError> for Error {
    fn from(err: MrnError) -> Self {
        Self::InvalidArgument {
            message: err.to_string(),
        }
    }
}
