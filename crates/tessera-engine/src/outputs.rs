//! Outputs registered by a step at completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tessera_core::StepId;

use crate::config::QuadType;
use crate::error::Result;

/// Name of the user-visible statistics output set.
pub const STATISTICS: &str = "statistics";
/// Name of the system-visible statistics output set.
pub const INTERNAL_STATISTICS: &str = "internalStatistics";
/// Name of the exported-files output set.
pub const EXPORTED_DATA: &str = "exportedData";
/// Name of the tile-invalidation output set.
pub const TILE_INVALIDATIONS: &str = "tileInvalidations";

/// Who may read an output set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    /// Visible to the job owner.
    User,
    /// Visible to the system only.
    System,
}

/// Declaration of one output set a step kind produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSet {
    /// Stable name of the set.
    pub name: &'static str,
    /// Who may read it.
    pub visibility: Visibility,
    /// Whether the set holds exactly one artifact.
    pub singleton: bool,
}

impl OutputSet {
    /// Creates an output-set declaration.
    #[must_use]
    pub const fn new(name: &'static str, visibility: Visibility, singleton: bool) -> Self {
        Self {
            name,
            visibility,
            singleton,
        }
    }
}

/// Aggregated upload statistics of a completed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatistics {
    /// Total rows uploaded across all tasks.
    pub rows_uploaded: i64,
    /// Total bytes uploaded across all tasks.
    pub bytes_uploaded: i64,
    /// Total files produced across all tasks.
    pub files_uploaded: i64,
}

impl FileStatistics {
    /// Sets the uploaded row count.
    #[must_use]
    pub const fn with_rows_uploaded(mut self, rows: i64) -> Self {
        self.rows_uploaded = rows;
        self
    }

    /// Sets the uploaded byte count.
    #[must_use]
    pub const fn with_bytes_uploaded(mut self, bytes: i64) -> Self {
        self.bytes_uploaded = bytes;
        self
    }

    /// Sets the produced file count.
    #[must_use]
    pub const fn with_files_uploaded(mut self, files: i64) -> Self {
        self.files_uploaded = files;
        self
    }
}

/// Tiles that became empty and must be invalidated downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileInvalidations {
    /// Subdivision level of the listed tiles.
    pub tile_level: u8,
    /// Encoding scheme of the listed tile ids.
    pub quad_type: QuadType,
    /// The invalidated tile ids.
    pub tile_ids: Vec<String>,
}

impl TileInvalidations {
    /// Creates an empty invalidation list.
    #[must_use]
    pub const fn new(tile_level: u8, quad_type: QuadType) -> Self {
        Self {
            tile_level,
            quad_type,
            tile_ids: Vec::new(),
        }
    }

    /// Sets the invalidated tile ids.
    #[must_use]
    pub fn with_tile_ids(mut self, tile_ids: Vec<String>) -> Self {
        self.tile_ids = tile_ids;
        self
    }
}

/// Payload of one registered output artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "payload")]
pub enum OutputPayload {
    /// Aggregate upload statistics.
    Statistics(FileStatistics),
    /// Tile invalidation list.
    TileInvalidations(TileInvalidations),
    /// Download URLs of the exported files.
    ExportedData(Vec<String>),
}

/// An artifact registered under an output set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredOutput {
    /// The output set the artifact belongs to.
    pub set: String,
    /// Visibility of the artifact.
    pub visibility: Visibility,
    /// The artifact itself.
    pub payload: OutputPayload,
}

/// Source of the download URLs produced by the database-side export.
///
/// File and blob handling is owned by an external collaborator; the engine
/// only relays the final URL list into the `exportedData` output set.
#[async_trait]
pub trait ExportedFilesProvider: Send + Sync {
    /// Returns the download URLs of all files the step exported.
    async fn exported_files(&self, step_id: StepId) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_statistics_builder() {
        let stats = FileStatistics::default()
            .with_rows_uploaded(5)
            .with_bytes_uploaded(1234)
            .with_files_uploaded(1);
        assert_eq!(stats.rows_uploaded, 5);
        assert_eq!(stats.bytes_uploaded, 1234);
        assert_eq!(stats.files_uploaded, 1);
    }

    #[test]
    fn tile_invalidations_serde_shape() {
        let output = TileInvalidations::new(8, QuadType::HereQuad)
            .with_tile_ids(vec!["341".into(), "342".into()]);
        let json = serde_json::to_value(&output).expect("serialize");
        assert_eq!(json["tileLevel"], 8);
        assert_eq!(json["quadType"], "HERE_QUAD");
        assert_eq!(json["tileIds"][0], "341");
    }

    #[test]
    fn output_set_declaration() {
        let set = OutputSet::new(STATISTICS, Visibility::User, true);
        assert_eq!(set.name, "statistics");
        assert!(set.singleton);
    }
}
