//! Incremental export of changed tiles.
//!
//! The task set is computed by diffing two versions of a space and mapping
//! the changes onto the tile grid, in two passes:
//!
//! 1. **Delta pass** — every feature changed in `(start, end]` contributes
//!    the tiles its *current* geometry covers. Deleted features appear
//!    without geometry; their ids are retained but cover nothing.
//! 2. **Base pass** — the same feature ids are resolved at the *start*
//!    version and contribute their *old* coverage, so tiles emptied by
//!    deletions or geometry moves are re-exported (and, if now empty,
//!    invalidated).
//!
//! Each affected tile becomes one task row; the per-task query exports the
//! tile's features at the end version with the tile id stamped into the
//! feature's partition-key property.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::config::{QuadType, SpatialFilter, StepConfig};
use crate::error::{Error, Result};
use crate::outputs::{
    OutputSet, OutputPayload, RegisteredOutput, TileInvalidations, Visibility, EXPORTED_DATA,
    INTERNAL_STATISTICS, STATISTICS, TILE_INVALIDATIONS,
};
use crate::quad::{Bbox, HereQuad, MercatorQuad, QuadError};
use crate::query::SqlQuery;
use crate::step::{StepContext, TaskedStepSpec};
use crate::task_table::TaskData;

/// Fixed fan-out of a changed-tiles export.
pub const CHANGED_TILES_THREAD_COUNT: u32 = 8;

/// Highest supported target tile level.
pub const MAX_TARGET_LEVEL: u8 = 12;

/// JSON path of the partition-key property stamped into exported features.
pub const PARTITION_KEY_PATH: &str = "{properties,@ns:com:here:xyz,partitionKey}";

/// The changed-tiles step kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangedTilesStep;

impl ChangedTilesStep {
    /// Creates the step kind.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns true if two changed-tiles configurations describe the same
    /// export and may be deduplicated.
    ///
    /// When the space has no extension, the base layer is the merged view,
    /// so an unset context and `SUPER` compare equal.
    #[must_use]
    pub fn is_equivalent(a: &StepConfig, b: &StepConfig, space_has_extension: bool) -> bool {
        a.space_id == b.space_id
            && a.version_ref == b.version_ref
            && effective_context(a, space_has_extension) == effective_context(b, space_has_extension)
            && a.spatial_filter == b.spatial_filter
            && a.property_filter == b.property_filter
            && a.target_level == b.target_level
            && a.quad_type == b.quad_type
    }

    /// Latest state of every feature changed in `(start, end]`, as
    /// `(tile, id)` pairs. Deletions surface with a null tile.
    fn affected_tiles_from_delta(
        schema: &str,
        root_table: &str,
        config: &StepConfig,
        start: u64,
        end: u64,
    ) -> SqlQuery {
        let quad_fn = config.quad_type.sql_function_name();
        let outer = format!(
            "\
SELECT {quad_fn}(f.colX, f.rowY, f.level) as tile, id
FROM (
     ${{{{squashedDeltaChangesQuery}}}}
 ) a
LEFT JOIN LATERAL for_geometry(a.geo, #{{targetLevel}}, #{{quadType}}) f ON TRUE;"
        );
        SqlQuery::new(outer)
            .with_named_parameter("targetLevel", u32::from(config.target_level))
            .with_named_parameter("quadType", config.quad_type.to_string())
            .with_fragment(
                "squashedDeltaChangesQuery",
                changed_features_query(schema, root_table, config, start, end),
            )
    }

    /// Old coverage of the changed feature ids at the start version.
    fn affected_tiles_from_base(
        schema: &str,
        root_table: &str,
        config: &StepConfig,
        changed_ids: &[String],
        start: u64,
    ) -> SqlQuery {
        let quad_fn = config.quad_type.sql_function_name();
        let outer = format!(
            "\
SELECT {quad_fn}(f.colX, f.rowY, f.level) as tile
   FROM (
        ${{{{baseFeaturesQuery}}}}
    ) a
CROSS JOIN LATERAL for_geometry(a.geo, #{{targetLevel}}, #{{quadType}}) f"
        );
        SqlQuery::new(outer)
            .with_named_parameter("targetLevel", u32::from(config.target_level))
            .with_named_parameter("quadType", config.quad_type.to_string())
            .with_fragment(
                "baseFeaturesQuery",
                features_by_id_query(schema, root_table, changed_ids, start),
            )
    }

    async fn space_root_table(&self, ctx: &StepContext) -> Result<String> {
        let meta = ctx
            .hub
            .space_meta(&ctx.config.space_id)
            .await
            .map_err(Error::from)?;
        Ok(meta.root_table)
    }
}

#[async_trait]
impl TaskedStepSpec for ChangedTilesStep {
    fn kind(&self) -> &'static str {
        "changed_tiles"
    }

    fn description(&self, config: &StepConfig) -> String {
        format!("Export changed tiles of space {}", config.space_id)
    }

    fn output_sets(&self) -> Vec<OutputSet> {
        vec![
            OutputSet::new(STATISTICS, Visibility::User, true),
            OutputSet::new(INTERNAL_STATISTICS, Visibility::System, true),
            OutputSet::new(EXPORTED_DATA, Visibility::User, false),
            OutputSet::new(TILE_INVALIDATIONS, Visibility::User, true),
        ]
    }

    async fn validate(&self, ctx: &StepContext) -> Result<()> {
        let config = &ctx.config;
        if config.target_level > MAX_TARGET_LEVEL {
            return Err(Error::validation("TargetLevel must be between 0 and 12!"));
        }
        if !config.version_ref.is_range() {
            return Err(Error::validation(
                "changed-tiles export requires a version range",
            ));
        }

        let meta = ctx
            .hub
            .space_meta(&config.space_id)
            .await
            .map_err(Error::from)?;
        if meta.versions_to_keep <= 1 {
            return Err(Error::validation(
                "Versions to keep must be greater than 1!",
            ));
        }
        Ok(())
    }

    async fn initial_thread_count(&self, _ctx: &StepContext) -> Result<u32> {
        Ok(CHANGED_TILES_THREAD_COUNT)
    }

    async fn create_task_items(&self, ctx: &StepContext) -> Result<u32> {
        let config = &ctx.config;
        let start = config.version_ref.start_version()?;
        let end = config.version_ref.end_version()?;
        let root_table = self.space_root_table(ctx).await?;

        let mut affected_tiles = BTreeSet::new();
        let mut changed_ids = Vec::new();

        let delta =
            Self::affected_tiles_from_delta(&ctx.schema, &root_table, config, start, end);
        for row in ctx.executor.read_rows(&delta).await? {
            if let Some(tile) = row.get_str("tile") {
                affected_tiles.insert(tile.to_string());
            }
            if let Some(id) = row.get_str("id") {
                changed_ids.push(id.to_string());
            }
        }
        tracing::info!(
            step_id = %ctx.step_id,
            version_range = %config.version_ref,
            tiles = affected_tiles.len(),
            "added affected tiles from delta"
        );

        if !changed_ids.is_empty() {
            let base = Self::affected_tiles_from_base(
                &ctx.schema,
                &root_table,
                config,
                &changed_ids,
                start,
            );
            for row in ctx.executor.read_rows(&base).await? {
                if let Some(tile) = row.get_str("tile") {
                    affected_tiles.insert(tile.to_string());
                }
            }
        }
        tracing::info!(
            step_id = %ctx.step_id,
            base_version = start,
            tiles = affected_tiles.len(),
            "added affected tiles from base version"
        );

        for tile_id in &affected_tiles {
            ctx.table.insert(&TaskData::Tile(tile_id.clone())).await?;
        }

        #[allow(clippy::cast_possible_truncation)]
        let created = affected_tiles.len() as u32;
        Ok(created)
    }

    async fn build_task_query(
        &self,
        ctx: &StepContext,
        task_id: i64,
        data: &TaskData,
    ) -> Result<SqlQuery> {
        let tile_id = data.as_tile_id().ok_or_else(|| Error::TaskQueryBuild {
            task_id,
            message: "changed-tiles export expects tile task data".into(),
        })?;
        let bbox = tile_bbox(ctx.config.quad_type, tile_id).map_err(|e| Error::TaskQueryBuild {
            task_id,
            message: e.to_string(),
        })?;

        let version = ctx.config.version_ref.end_version()?;
        let root_table = self.space_root_table(ctx).await?;
        Ok(tile_export_query(
            &ctx.schema,
            &root_table,
            &ctx.config,
            tile_id,
            bbox,
            version,
        ))
    }

    async fn on_complete(&self, ctx: &StepContext) -> Result<Vec<RegisteredOutput>> {
        let empty = ctx.table.empty_task_data().await?;
        let tile_ids: Vec<String> = empty
            .iter()
            .filter_map(|data| data.as_tile_id().map(str::to_string))
            .collect();

        tracing::info!(
            step_id = %ctx.step_id,
            invalidated = tile_ids.len(),
            "writing tile invalidation output"
        );
        let invalidations =
            TileInvalidations::new(ctx.config.target_level, ctx.config.quad_type)
                .with_tile_ids(tile_ids);
        Ok(vec![RegisteredOutput {
            set: TILE_INVALIDATIONS.to_string(),
            visibility: Visibility::User,
            payload: OutputPayload::TileInvalidations(invalidations),
        }])
    }
}

fn effective_context(
    config: &StepConfig,
    space_has_extension: bool,
) -> Option<crate::config::SpaceContext> {
    match config.context {
        Some(crate::config::SpaceContext::Super) if !space_has_extension => None,
        other => other,
    }
}

/// Resolves a tile id to its WGS84 bounding box under the given scheme.
fn tile_bbox(quad_type: QuadType, tile_id: &str) -> std::result::Result<Bbox, QuadError> {
    match quad_type {
        QuadType::HereQuad => Ok(HereQuad::from_quad_id(tile_id)?.bounding_box()),
        QuadType::MercatorQuad => Ok(MercatorQuad::from_quadkey(tile_id)?.bounding_box()),
    }
}

/// Latest revision (at or below `end`) of every feature changed in
/// `(start, end]`, including deletion markers without geometry.
fn changed_features_query(
    schema: &str,
    root_table: &str,
    config: &StepConfig,
    start: u64,
    end: u64,
) -> SqlQuery {
    let mut text = String::from(
        "\
SELECT id, geo FROM ${schema}.${table}
    WHERE version > #{startVersion} AND version <= #{endVersion}
    AND next_version > #{endVersion}",
    );
    if config.spatial_filter.is_some() {
        text.push_str("\n    AND ST_Intersects(geo, ${{filterGeometry}})");
    }
    if config.property_filter.is_some() {
        text.push_str("\n    AND property_filter_matches(jsondata, #{propertyFilter})");
    }

    let mut query = SqlQuery::new(text)
        .with_variable("schema", schema)
        .with_variable("table", root_table)
        .with_named_parameter("startVersion", start)
        .with_named_parameter("endVersion", end);
    if let Some(filter) = &config.spatial_filter {
        query = query.with_fragment("filterGeometry", spatial_filter_geometry(filter));
    }
    if let Some(filter) = &config.property_filter {
        query = query.with_named_parameter("propertyFilter", filter.clone());
    }
    query
}

/// State of the given feature ids as of `version`.
fn features_by_id_query(
    schema: &str,
    root_table: &str,
    ids: &[String],
    version: u64,
) -> SqlQuery {
    let ids: Vec<serde_json::Value> = ids.iter().map(|id| id.as_str().into()).collect();
    SqlQuery::new(
        "\
SELECT geo FROM ${schema}.${table}
    WHERE id = ANY(#{changedIds})
    AND version <= #{version} AND next_version > #{version}",
    )
    .with_variable("schema", schema)
    .with_variable("table", root_table)
    .with_named_parameter("changedIds", ids)
    .with_named_parameter("version", version)
}

/// The spatial-filter geometry expression, buffered when a radius is set.
fn spatial_filter_geometry(filter: &SpatialFilter) -> SqlQuery {
    let geometry = filter.geometry.to_string();
    if filter.radius > 0.0 {
        SqlQuery::new(
            "ST_Buffer(ST_GeomFromGeoJSON(#{filterGeometry})::geography, #{filterRadius})::geometry",
        )
        .with_named_parameter("filterGeometry", geometry)
        .with_named_parameter("filterRadius", filter.radius)
    } else {
        SqlQuery::new("ST_GeomFromGeoJSON(#{filterGeometry})")
            .with_named_parameter("filterGeometry", geometry)
    }
}

/// Per-task export: the tile's features at `version` with the tile id
/// stamped into the partition-key property.
fn tile_export_query(
    schema: &str,
    root_table: &str,
    config: &StepConfig,
    tile_id: &str,
    bbox: Bbox,
    version: u64,
) -> SqlQuery {
    let mut content_text = String::from(
        "\
SELECT id, version, geo, jsondata FROM ${schema}.${table}
    WHERE version <= #{version} AND next_version > #{version}
    AND ST_Intersects(geo, ST_MakeEnvelope(#{west}, #{south}, #{east}, #{north}, 4326))",
    );
    if config.property_filter.is_some() {
        content_text.push_str("\n    AND property_filter_matches(jsondata, #{propertyFilter})");
    }

    let mut content = SqlQuery::new(content_text)
        .with_variable("schema", schema)
        .with_variable("table", root_table)
        .with_named_parameter("version", version)
        .with_named_parameter("west", bbox.west)
        .with_named_parameter("south", bbox.south)
        .with_named_parameter("east", bbox.east)
        .with_named_parameter("north", bbox.north);
    if let Some(filter) = &config.property_filter {
        content = content.with_named_parameter("propertyFilter", filter.clone());
    }

    SqlQuery::new(format!(
        "\
SELECT geo, jsonb_set(
          jsondata,
          '{PARTITION_KEY_PATH}',
          to_jsonb(#{{tileId}}::text)
      ) AS jsondata
   FROM (${{{{contentQuery}}}}) A"
    ))
    .with_named_parameter("tileId", tile_id)
    .with_fragment("contentQuery", content)
}
