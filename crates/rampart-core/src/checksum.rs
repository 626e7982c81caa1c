//! Stable checksum primitives for policy identity.
//!
//! Every derived identity in the engine (policy checksums, reporting job
//! UUIDs, execution job seals) is built from the same primitive: a 64-bit
//! FNV-1a fold over a sequence of strings, encoded as base64. The fold is
//! order-sensitive, so callers hashing maps or sets must sort keys first;
//! [`Checksum::add_sorted`] does this for the common case.
//!
//! # Example
//!
//! ```
//! use rampart_core::checksum::Checksum;
//!
//! let a = Checksum::new().add("v2").add("policy-mrn").encode();
//! let b = Checksum::new().add("v2").add("policy-mrn").encode();
//! assert_eq!(a, b);
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const FNV1A_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A_PRIME: u64 = 0x0000_0100_0000_01b3;

/// An incremental 64-bit FNV-1a checksum.
///
/// The value form is copyable and cheap; the builder-style `add` calls fold
/// more data in and return the updated checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum(u64);

impl Checksum {
    /// Creates a checksum at the FNV-1a offset basis.
    #[must_use]
    pub const fn new() -> Self {
        Self(FNV1A_OFFSET)
    }

    /// Folds a string into the checksum.
    #[must_use]
    pub fn add(self, s: &str) -> Self {
        let mut state = self.0;
        for byte in s.as_bytes() {
            state ^= u64::from(*byte);
            state = state.wrapping_mul(FNV1A_PRIME);
        }
        Self(state)
    }

    /// Folds a sequence of strings into the checksum in sorted order.
    ///
    /// Use this for map keys and sets, where iteration order must not leak
    /// into the checksum.
    #[must_use]
    pub fn add_sorted<I, S>(self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sorted: Vec<String> = items
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        sorted.sort();

        let mut res = self;
        for item in &sorted {
            res = res.add(item);
        }
        res
    }

    /// Encodes the checksum as a fixed-length base64 string.
    ///
    /// The 64-bit value is serialized little-endian before encoding, so the
    /// result is stable across platforms.
    #[must_use]
    pub fn encode(self) -> String {
        STANDARD.encode(self.0.to_le_bytes())
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds the given strings in order and returns the encoded checksum.
#[must_use]
pub fn checksum_strings<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut checksum = Checksum::new();
    for item in items {
        checksum = checksum.add(item);
    }
    checksum.encode()
}
