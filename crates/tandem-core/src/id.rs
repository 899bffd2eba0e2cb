//! Identifiers for lock holders and the fencing tokens they are granted.
//!
//! # Example
//!
//! ```rust
//! use tandem_core::id::{FencingToken, HolderId};
//!
//! let a = HolderId::generate();
//! let b = HolderId::generate();
//! assert_ne!(a, b);
//!
//! assert!(FencingToken::from_sequence(2) > FencingToken::from_sequence(1));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Opaque identifier of a lock holder, unique per process instance.
///
/// Generated holder IDs are ULIDs: globally unique without coordination, so
/// a restarted process never reuses the identity of its previous incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    /// Generates a new unique holder ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the holder ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HolderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::configuration("holder id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Fencing token issued with each successful lock acquisition.
///
/// Tokens increase strictly across successive holders of the same lock, so
/// a consumer of the live role can reject operations carrying an older token
/// than the newest one it has seen. This closes the window in which a holder
/// that lost its lease still believes it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Creates a fencing token from the lock's acquisition sequence.
    ///
    /// Only lock backends should call this; application code obtains tokens
    /// from the node manager once it is live.
    #[must_use]
    pub const fn from_sequence(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Returns the raw sequence number for serialization/logging.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.0
    }

    /// Returns true if an operation tagged with `self` is stale relative to `newest`.
    #[must_use]
    pub fn is_stale_against(&self, newest: Self) -> bool {
        *self < newest
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}
