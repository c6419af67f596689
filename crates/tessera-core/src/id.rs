//! Strongly-typed identifiers for Tessera entities.
//!
//! All identifiers are:
//! - **Strongly typed**: prevents mixing up different ID types at compile time
//! - **Opaque**: callers never inspect their internal structure
//!
//! `StepId` is ULID-backed and therefore lexicographically sortable by
//! creation time. `SpaceId` wraps the externally-assigned name of a space.
//!
//! # Example
//!
//! ```rust
//! use tessera_core::{SpaceId, StepId};
//!
//! let step = StepId::generate();
//! let space = SpaceId::new("my-space").expect("non-empty");
//!
//! // IDs are different types - this won't compile:
//! // let wrong: SpaceId = step;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a step within a job.
///
/// The outer job manager guarantees that two concurrent runs of the same
/// `StepId` never exist; everything a step owns (including its task table)
/// is keyed off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(Ulid);

impl StepId {
    /// Generates a new unique step ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a step ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StepId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid step ID '{s}': {e}"),
        })
    }
}

/// The name of a space: a versioned collection of geographic features.
///
/// Space names are assigned externally; the only local constraint is that
/// they are non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    /// Creates a space ID from a name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidId {
                message: "space ID must not be empty".into(),
            });
        }
        Ok(Self(name))
    }

    /// Returns the space name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SpaceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_ids_are_unique() {
        let a = StepId::generate();
        let b = StepId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn step_id_round_trips_through_string() {
        let id = StepId::generate();
        let parsed: StepId = id.to_string().parse().expect("valid ULID string");
        assert_eq!(id, parsed);
    }

    #[test]
    fn step_id_rejects_garbage() {
        let result = "not-a-ulid!".parse::<StepId>();
        assert!(result.is_err());
    }

    #[test]
    fn space_id_rejects_empty() {
        assert!(SpaceId::new("").is_err());
        assert!(SpaceId::new("some-space").is_ok());
    }

    #[test]
    fn step_id_serde_is_transparent() {
        let id = StepId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
    }
}
