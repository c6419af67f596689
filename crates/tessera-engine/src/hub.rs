//! Hub client seam: space metadata, statistics and tag resolution.
//!
//! The hub is the service that owns space definitions, dataset statistics
//! and named version tags. The engine consults it during `prepare` and for
//! resource estimation; everything else about the hub (HTTP transport,
//! authorization, caching) lives outside this crate.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use tessera_core::SpaceId;

use crate::config::SpaceContext;
use crate::error::Error;

/// The result type for hub operations.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// Errors returned by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The space does not exist.
    #[error("space not found: {space_id}")]
    SpaceNotFound {
        /// The unknown space.
        space_id: SpaceId,
    },

    /// The space exists but is deactivated (precondition-required analog).
    #[error("{space_id} is deactivated!")]
    Deactivated {
        /// The deactivated space.
        space_id: SpaceId,
    },

    /// The tag does not exist on the space.
    #[error("tag \"{tag}\" not found on {space_id}")]
    TagNotFound {
        /// The space the tag was looked up on.
        space_id: SpaceId,
        /// The unknown tag.
        tag: String,
    },

    /// The hub could not be reached.
    #[error("hub unreachable: {message}")]
    Unreachable {
        /// Description of the failure.
        message: String,
    },
}

impl From<HubError> for Error {
    /// Hub failures during preparation surface as validation errors; a
    /// deactivated space keeps its dedicated message.
    fn from(err: HubError) -> Self {
        match &err {
            HubError::Deactivated { .. } => Error::validation_with_source(err.to_string(), err),
            _ => Error::validation_with_source(format!("unable to consult hub: {err}"), err),
        }
    }
}

/// Static description of a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceMeta {
    /// The space this metadata describes.
    pub space_id: SpaceId,
    /// How many versions the space retains; `> 1` means history is kept.
    pub versions_to_keep: u32,
    /// The base space this one extends, if any.
    pub extends: Option<SpaceId>,
    /// Name of the space's root table in the database.
    pub root_table: String,
    /// Root table of the base space, if this space extends one.
    pub super_table: Option<String>,
}

impl SpaceMeta {
    /// Returns true if the space overlays a base space.
    #[must_use]
    pub const fn has_extension(&self) -> bool {
        self.extends.is_some()
    }
}

/// A statistics snapshot of a space layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceStatistics {
    /// Stored byte size of the layer.
    pub byte_size: i64,
    /// Estimated feature count of the layer.
    pub estimated_feature_count: u64,
    /// Newest version of the layer.
    pub max_version: u64,
}

/// Client for the hub service.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Loads the static metadata of a space.
    async fn space_meta(&self, space_id: &SpaceId) -> HubResult<SpaceMeta>;

    /// Loads a statistics snapshot for a space layer.
    async fn statistics(
        &self,
        space_id: &SpaceId,
        context: Option<SpaceContext>,
    ) -> HubResult<SpaceStatistics>;

    /// Resolves a named tag to its version.
    async fn resolve_tag(&self, space_id: &SpaceId, tag: &str) -> HubResult<u64>;
}

/// In-memory hub for testing.
///
/// Not a real hub: no transport, no auth, everything is configured up
/// front with [`InMemoryHub::with_space`].
#[derive(Debug, Default)]
pub struct InMemoryHub {
    spaces: Mutex<HashMap<SpaceId, SpaceEntry>>,
}

#[derive(Debug, Clone)]
struct SpaceEntry {
    meta: SpaceMeta,
    statistics: SpaceStatistics,
    tags: HashMap<String, u64>,
    deactivated: bool,
}

fn poison_err<T>(_: PoisonError<T>) -> HubError {
    HubError::Unreachable {
        message: "hub state lock poisoned".into(),
    }
}

impl InMemoryHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a space with its metadata and statistics.
    #[must_use]
    pub fn with_space(self, meta: SpaceMeta, statistics: SpaceStatistics) -> Self {
        let space_id = meta.space_id.clone();
        self.spaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                space_id,
                SpaceEntry {
                    meta,
                    statistics,
                    tags: HashMap::new(),
                    deactivated: false,
                },
            );
        self
    }

    /// Registers a tag on an already-registered space.
    #[must_use]
    pub fn with_tag(self, space_id: &SpaceId, tag: impl Into<String>, version: u64) -> Self {
        if let Some(entry) = self
            .spaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(space_id)
        {
            entry.tags.insert(tag.into(), version);
        }
        self
    }

    /// Marks a space as deactivated.
    #[must_use]
    pub fn deactivated(self, space_id: &SpaceId) -> Self {
        if let Some(entry) = self
            .spaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(space_id)
        {
            entry.deactivated = true;
        }
        self
    }

    fn entry(&self, space_id: &SpaceId) -> HubResult<SpaceEntry> {
        let spaces = self.spaces.lock().map_err(poison_err)?;
        let entry = spaces.get(space_id).ok_or_else(|| HubError::SpaceNotFound {
            space_id: space_id.clone(),
        })?;
        if entry.deactivated {
            return Err(HubError::Deactivated {
                space_id: space_id.clone(),
            });
        }
        Ok(entry.clone())
    }
}

#[async_trait]
impl HubClient for InMemoryHub {
    async fn space_meta(&self, space_id: &SpaceId) -> HubResult<SpaceMeta> {
        Ok(self.entry(space_id)?.meta)
    }

    async fn statistics(
        &self,
        space_id: &SpaceId,
        _context: Option<SpaceContext>,
    ) -> HubResult<SpaceStatistics> {
        Ok(self.entry(space_id)?.statistics)
    }

    async fn resolve_tag(&self, space_id: &SpaceId, tag: &str) -> HubResult<u64> {
        let entry = self.entry(space_id)?;
        entry
            .tags
            .get(tag)
            .copied()
            .ok_or_else(|| HubError::TagNotFound {
                space_id: space_id.clone(),
                tag: tag.into(),
            })
    }
}
