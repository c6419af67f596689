//! References to versions of a space.
//!
//! A [`VersionRef`] arrives from the outside as a concrete version, the
//! symbolic `HEAD`, a named tag, or a half-open version range. During
//! [`prepare`](crate::step::StepEngine::prepare) symbolic forms are resolved
//! against the hub; after a successful prepare a step's version ref contains
//! only integers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A reference to a version of a space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionRef {
    /// The newest version at preparation time.
    Head,
    /// A named tag, resolved to its version during prepare.
    Tag(String),
    /// A concrete version number.
    Version(u64),
    /// A half-open range `[start, end)` of versions.
    Range {
        /// First version of the range (inclusive).
        start: u64,
        /// End of the range (exclusive).
        end: u64,
    },
}

impl VersionRef {
    /// Returns true once the ref contains only concrete integers.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Version(_) | Self::Range { .. })
    }

    /// Returns true if this ref is a range.
    #[must_use]
    pub const fn is_range(&self) -> bool {
        matches!(self, Self::Range { .. })
    }

    /// Returns the single concrete version.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the ref is not a concrete version.
    pub fn version(&self) -> Result<u64> {
        match self {
            Self::Version(v) => Ok(*v),
            other => Err(Error::validation(format!(
                "expected a concrete version, got \"{other}\""
            ))),
        }
    }

    /// Returns the start version of a range.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the ref is not a range.
    pub fn start_version(&self) -> Result<u64> {
        match self {
            Self::Range { start, .. } => Ok(*start),
            other => Err(Error::validation(format!(
                "expected a version range, got \"{other}\""
            ))),
        }
    }

    /// Returns the end version of a range, or the version itself for a
    /// concrete ref.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the ref is symbolic.
    pub fn end_version(&self) -> Result<u64> {
        match self {
            Self::Range { end, .. } => Ok(*end),
            Self::Version(v) => Ok(*v),
            other => Err(Error::validation(format!(
                "expected a resolved version ref, got \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => write!(f, "HEAD"),
            Self::Tag(tag) => f.write_str(tag),
            Self::Version(v) => write!(f, "{v}"),
            Self::Range { start, end } => write!(f, "{start}..{end}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_state() {
        assert!(!VersionRef::Head.is_resolved());
        assert!(!VersionRef::Tag("release".into()).is_resolved());
        assert!(VersionRef::Version(7).is_resolved());
        assert!(VersionRef::Range { start: 3, end: 9 }.is_resolved());
    }

    #[test]
    fn range_accessors() {
        let range = VersionRef::Range { start: 10, end: 11 };
        assert_eq!(range.start_version().expect("range"), 10);
        assert_eq!(range.end_version().expect("range"), 11);
        assert!(range.version().is_err());
    }

    #[test]
    fn concrete_end_version() {
        assert_eq!(VersionRef::Version(42).end_version().expect("concrete"), 42);
        assert!(VersionRef::Head.end_version().is_err());
    }

    #[test]
    fn display_forms() {
        assert_eq!(VersionRef::Head.to_string(), "HEAD");
        assert_eq!(VersionRef::Tag("v1".into()).to_string(), "v1");
        assert_eq!(VersionRef::Version(5).to_string(), "5");
        assert_eq!(VersionRef::Range { start: 1, end: 4 }.to_string(), "1..4");
    }
}
