//! Step configuration: created once, read-only after `prepare`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_core::SpaceId;

use crate::version_ref::VersionRef;

/// Feature count below which a source layer is exported single-threaded.
pub const PARALLELIZATION_MIN_THRESHOLD: u64 = 200_000;

/// Upper bound on the export fan-out.
pub const PARALLELIZATION_THREAD_COUNT: u32 = 8;

/// Default target tile level for changed-tile exports.
pub const DEFAULT_TARGET_LEVEL: u8 = 11;

/// Which layer of a composite space is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpaceContext {
    /// The merged view of base and overlay.
    Default,
    /// The overlay layer only.
    Extension,
    /// The base layer only.
    Super,
}

impl std::fmt::Display for SpaceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "DEFAULT"),
            Self::Extension => write!(f, "EXTENSION"),
            Self::Super => write!(f, "SUPER"),
        }
    }
}

/// Encoding scheme for tile identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuadType {
    /// Decimal-encoded quadkey over the equirectangular grid.
    HereQuad,
    /// Base-4 quadkey over the Web Mercator grid.
    MercatorQuad,
}

impl QuadType {
    /// Name of the database-side tile-id function for this scheme.
    #[must_use]
    pub const fn sql_function_name(&self) -> &'static str {
        match self {
            Self::HereQuad => "here_quad",
            Self::MercatorQuad => "mercator_quad",
        }
    }
}

impl std::fmt::Display for QuadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HereQuad => write!(f, "HERE_QUAD"),
            Self::MercatorQuad => write!(f, "MERCATOR_QUAD"),
        }
    }
}

/// Output row format for exported files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CsvFormat {
    /// One feature per row: JSON columns plus WKB geometry.
    JsonWkb,
    /// One partition per row: base64-encoded feature collection.
    PartitionidFcB64,
}

/// A spatial restriction on the exported features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialFilter {
    /// GeoJSON geometry the export is restricted to.
    pub geometry: Value,
    /// Buffer radius in meters around the geometry (0 = none).
    #[serde(default)]
    pub radius: f64,
    /// Whether exported geometries are clipped to the filter.
    #[serde(default)]
    pub clipped: bool,
}

/// Fan-out tuning knobs recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelismConfig {
    /// Feature count below which single-threaded export is forced.
    pub min_threshold: u64,
    /// Upper bound on the fan-out.
    pub thread_count: u32,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            min_threshold: PARALLELIZATION_MIN_THRESHOLD,
            thread_count: PARALLELIZATION_THREAD_COUNT,
        }
    }
}

/// Configuration of a single step.
///
/// Created once by the outer job manager; the engine mutates only
/// `version_ref` (during `prepare`, to its resolved form) and treats the
/// rest as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// The space operated on.
    pub space_id: SpaceId,
    /// The version (or version range) operated on. Required.
    pub version_ref: VersionRef,
    /// Composite-layer selection; `None` behaves like the merged view.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SpaceContext>,
    /// Optional spatial restriction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spatial_filter: Option<SpatialFilter>,
    /// Optional property-query expression, compiled database-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_filter: Option<String>,
    /// Tile-id scheme for tile-grained exports.
    pub quad_type: QuadType,
    /// Target tile level for tile-grained exports (`0..=12`).
    pub target_level: u8,
    /// Output row format.
    pub csv_format: CsvFormat,
    /// Export partitioning key; `None` partitions by feature id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    /// Whether exported geometries are clipped to the requested region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipped: Option<bool>,
    /// Fan-out tuning.
    #[serde(default)]
    pub parallelism: ParallelismConfig,
}

impl StepConfig {
    /// Creates a config with defaults for everything but space and version.
    #[must_use]
    pub fn new(space_id: SpaceId, version_ref: VersionRef) -> Self {
        Self {
            space_id,
            version_ref,
            context: None,
            spatial_filter: None,
            property_filter: None,
            quad_type: QuadType::HereQuad,
            target_level: DEFAULT_TARGET_LEVEL,
            csv_format: CsvFormat::JsonWkb,
            partition_key: None,
            clipped: None,
            parallelism: ParallelismConfig::default(),
        }
    }

    /// Sets the composite-layer context.
    #[must_use]
    pub const fn with_context(mut self, context: SpaceContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the spatial filter.
    #[must_use]
    pub fn with_spatial_filter(mut self, filter: SpatialFilter) -> Self {
        self.spatial_filter = Some(filter);
        self
    }

    /// Sets the property filter expression.
    #[must_use]
    pub fn with_property_filter(mut self, filter: impl Into<String>) -> Self {
        self.property_filter = Some(filter.into());
        self
    }

    /// Sets the tile-id scheme.
    #[must_use]
    pub const fn with_quad_type(mut self, quad_type: QuadType) -> Self {
        self.quad_type = quad_type;
        self
    }

    /// Sets the target tile level.
    #[must_use]
    pub const fn with_target_level(mut self, target_level: u8) -> Self {
        self.target_level = target_level;
        self
    }

    /// Sets the export partitioning key.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Returns true if any content filter is configured.
    #[must_use]
    pub const fn has_filters(&self) -> bool {
        self.spatial_filter.is_some() || self.property_filter.is_some()
    }

    /// Returns true if the export partitions by feature id.
    ///
    /// This is the case when no partition key is set, or the key is the
    /// literal `id`.
    #[must_use]
    pub fn partitions_by_id(&self) -> bool {
        match &self.partition_key {
            None => true,
            Some(key) => key.eq_ignore_ascii_case("id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::SpaceId;

    fn space() -> SpaceId {
        SpaceId::new("test-space").expect("valid")
    }

    #[test]
    fn defaults_match_contract() {
        let config = StepConfig::new(space(), VersionRef::Head);
        assert_eq!(config.target_level, 11);
        assert_eq!(config.quad_type, QuadType::HereQuad);
        assert_eq!(config.parallelism.min_threshold, 200_000);
        assert_eq!(config.parallelism.thread_count, 8);
    }

    #[test]
    fn partitioning_by_id() {
        let config = StepConfig::new(space(), VersionRef::Head);
        assert!(config.partitions_by_id());
        assert!(config.clone().with_partition_key("ID").partitions_by_id());
        assert!(!config.with_partition_key("tileid").partitions_by_id());
    }

    #[test]
    fn filter_presence() {
        let config = StepConfig::new(space(), VersionRef::Head);
        assert!(!config.has_filters());
        assert!(config.with_property_filter("p.class = 'road'").has_filters());
    }

    #[test]
    fn quad_type_sql_function_names() {
        assert_eq!(QuadType::HereQuad.sql_function_name(), "here_quad");
        assert_eq!(QuadType::MercatorQuad.sql_function_name(), "mercator_quad");
    }

    #[test]
    fn space_context_serde_is_screaming() {
        let json = serde_json::to_string(&SpaceContext::Extension).expect("serialize");
        assert_eq!(json, "\"EXTENSION\"");
    }
}
