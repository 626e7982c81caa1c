//! Machine resource names.
//!
//! Every entity in the engine — assets, policies, queries — is identified by
//! an MRN: an opaque hierarchical string of the form
//! `//<domain>/<resource>/<id>[/<sub>...]`. Equality is byte-exact; parsing
//! only checks the grammar, it assigns no meaning to segments beyond the
//! first resource/id pair.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource segment used for assets.
pub const RESOURCE_ASSET: &str = "assets";

/// Resource segment used for policies.
pub const RESOURCE_POLICY: &str = "policies";

/// Resource segment used for queries.
pub const RESOURCE_QUERY: &str = "queries";

/// Errors produced when parsing an MRN.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MrnError {
    /// The string does not start with the `//` scheme marker.
    #[error("invalid MRN '{mrn}': must start with '//'")]
    MissingScheme {
        /// The offending input.
        mrn: String,
    },

    /// The string has no domain or fewer than two path segments.
    #[error("invalid MRN '{mrn}': expected //<domain>/<resource>/<id>")]
    TooShort {
        /// The offending input.
        mrn: String,
    },

    /// A path segment is empty.
    #[error("invalid MRN '{mrn}': empty path segment")]
    EmptySegment {
        /// The offending input.
        mrn: String,
    },
}

/// A parsed machine resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mrn {
    domain: String,
    segments: Vec<String>,
}

impl Mrn {
    /// Parses an MRN string.
    ///
    /// # Errors
    ///
    /// Returns an [`MrnError`] when the grammar is violated.
    pub fn parse(mrn: &str) -> Result<Self, MrnError> {
        let rest = mrn.strip_prefix("//").ok_or_else(|| MrnError::MissingScheme {
            mrn: mrn.to_string(),
        })?;

        let mut parts = rest.split('/');
        let domain = parts.next().unwrap_or_default();
        if domain.is_empty() {
            return Err(MrnError::TooShort {
                mrn: mrn.to_string(),
            });
        }

        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.len() < 2 {
            return Err(MrnError::TooShort {
                mrn: mrn.to_string(),
            });
        }
        if segments.iter().any(String::is_empty) {
            return Err(MrnError::EmptySegment {
                mrn: mrn.to_string(),
            });
        }

        Ok(Self {
            domain: domain.to_string(),
            segments,
        })
    }

    /// Builds an MRN from a domain plus one resource/id pair.
    #[must_use]
    pub fn new(domain: &str, resource: &str, id: &str) -> String {
        format!("//{domain}/{resource}/{id}")
    }

    /// The domain portion (everything between `//` and the first `/`).
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The first resource-type segment.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.segments[0]
    }

    /// The id paired with the first resource segment.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.segments[1]
    }

    /// Renders the MRN back to its canonical string form.
    #[must_use]
    pub fn to_mrn_string(&self) -> String {
        format!("//{}/{}", self.domain, self.segments.join("/"))
    }
}

/// Checks whether a string parses as an MRN.
#[must_use]
pub fn is_valid(mrn: &str) -> bool {
    Mrn::parse(mrn).is_ok()
}

/// Appends a resource/id pair to an owner MRN.
///
/// Used to realize bundle-local UIDs into full MRNs, e.g. a query UID
/// `sshd-01` under owner `//captain.example.com/spaces/dev` becomes
/// `//captain.example.com/spaces/dev/queries/sshd-01`. Owners may be bare
/// domains (`//captain.example.com`); the result always parses as an MRN.
///
/// # Errors
///
/// Fails if the owner does not start with `//` or has an empty domain.
pub fn child_mrn(owner: &str, resource: &str, id: &str) -> Result<String, MrnError> {
    let rest = owner.strip_prefix("//").ok_or_else(|| MrnError::MissingScheme {
        mrn: owner.to_string(),
    })?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(MrnError::TooShort {
            mrn: owner.to_string(),
        });
    }
    Ok(format!("{owner}/{resource}/{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_asset_mrn() {
        let mrn = Mrn::parse("//captain.example.com/assets/linux-1").unwrap();
        assert_eq!(mrn.domain(), "captain.example.com");
        assert_eq!(mrn.resource(), RESOURCE_ASSET);
        assert_eq!(mrn.id(), "linux-1");
        assert_eq!(
            mrn.to_mrn_string(),
            "//captain.example.com/assets/linux-1"
        );
    }

    #[test]
    fn parses_nested_segments() {
        let mrn = Mrn::parse("//captain.example.com/spaces/dev/policies/ssh").unwrap();
        assert_eq!(mrn.resource(), "spaces");
        assert_eq!(mrn.id(), "dev");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(matches!(
            Mrn::parse("captain.example.com/assets/a"),
            Err(MrnError::MissingScheme { .. })
        ));
    }

    #[test]
    fn rejects_short_paths() {
        assert!(!is_valid("//captain.example.com"));
        assert!(!is_valid("//captain.example.com/assets"));
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(matches!(
            Mrn::parse("//captain.example.com/assets//x"),
            Err(MrnError::EmptySegment { .. })
        ));
    }

    #[test]
    fn child_mrn_appends_pair() {
        let child = child_mrn("//captain.example.com/spaces/dev", RESOURCE_QUERY, "q-1").unwrap();
        assert_eq!(child, "//captain.example.com/spaces/dev/queries/q-1");
        assert!(is_valid(&child));
    }

    #[test]
    fn child_mrn_accepts_bare_domain_owner() {
        let child = child_mrn("//captain.example.com", RESOURCE_POLICY, "p-1").unwrap();
        assert_eq!(child, "//captain.example.com/policies/p-1");
        assert!(is_valid(&child));
    }

    #[test]
    fn child_mrn_requires_valid_owner() {
        assert!(child_mrn("not-an-mrn", RESOURCE_QUERY, "q-1").is_err());
    }
}
