//! Plain SQL download exports and their fan-out sizing.
//!
//! Sizing policy for a download export:
//!
//! 1. Below [`ParallelismConfig::min_threshold`] features the export runs
//!    single-threaded.
//! 2. A partition-by-id export with no content filters fans out to
//!    `max(precalc, estimated_features / 500_000)` so no partition file
//!    grows unbounded.
//! 3. Every other export uses the database-side precalculation value
//!    unchanged.

use async_trait::async_trait;

use crate::config::{ParallelismConfig, StepConfig};
use crate::error::{Error, Result};
use crate::outputs::{OutputSet, Visibility, EXPORTED_DATA, INTERNAL_STATISTICS, STATISTICS};
use crate::query::SqlQuery;
use crate::step::{StepContext, TaskedStepSpec};
use crate::task_table::TaskData;
use crate::version_ref::VersionRef;

/// Maximum partitions written into one export file.
pub const MAX_PARTITIONS_PER_FILE: u64 = 500_000;

/// Applies the fan-out sizing policy to a precalculated thread count.
#[must_use]
pub fn sized_thread_count(
    parallelism: &ParallelismConfig,
    estimated_feature_count: u64,
    partitions_by_id: bool,
    has_filters: bool,
    precalc: u32,
) -> u32 {
    if estimated_feature_count < parallelism.min_threshold {
        return 1;
    }
    if partitions_by_id && !has_filters {
        #[allow(clippy::cast_possible_truncation)]
        let by_partition_volume = (estimated_feature_count / MAX_PARTITIONS_PER_FILE) as u32;
        return precalc.max(by_partition_volume).max(1);
    }
    precalc
}

/// Export of a space to files through a plain SQL download query.
///
/// The content query must expose the export columns plus a numeric `i`
/// column (row number); slices of the result set are selected by modulo
/// over `i`, one task per slice.
pub struct DownloadExportStep {
    content_query: SqlQuery,
    source_table: String,
}

impl DownloadExportStep {
    /// Creates a download export over a content query and its source table.
    #[must_use]
    pub fn new(content_query: SqlQuery, source_table: impl Into<String>) -> Self {
        Self {
            content_query,
            source_table: source_table.into(),
        }
    }

    async fn thread_count(&self, ctx: &StepContext) -> Result<u32> {
        let statistics = ctx
            .hub
            .statistics(&ctx.config.space_id, ctx.config.context)
            .await
            .map_err(Error::from)?;
        let precalc = ctx
            .executor
            .precalc_thread_count(
                statistics.estimated_feature_count,
                &self.content_query,
                &self.source_table,
            )
            .await?;
        Ok(sized_thread_count(
            &ctx.config.parallelism,
            statistics.estimated_feature_count,
            ctx.config.partitions_by_id(),
            ctx.config.has_filters(),
            precalc,
        ))
    }
}

#[async_trait]
impl TaskedStepSpec for DownloadExportStep {
    fn kind(&self) -> &'static str {
        "download_export"
    }

    fn description(&self, config: &StepConfig) -> String {
        format!("Export space {} to files", config.space_id)
    }

    fn output_sets(&self) -> Vec<OutputSet> {
        vec![
            OutputSet::new(STATISTICS, Visibility::User, true),
            OutputSet::new(INTERNAL_STATISTICS, Visibility::System, true),
            OutputSet::new(EXPORTED_DATA, Visibility::User, false),
        ]
    }

    async fn validate(&self, ctx: &StepContext) -> Result<()> {
        if let VersionRef::Range { .. } = ctx.config.version_ref {
            return Err(Error::validation(
                "version ranges are not supported for download exports",
            ));
        }
        Ok(())
    }

    async fn initial_thread_count(&self, ctx: &StepContext) -> Result<u32> {
        self.thread_count(ctx).await
    }

    async fn create_task_items(&self, ctx: &StepContext) -> Result<u32> {
        let slices = self.thread_count(ctx).await?;
        for index in 0..slices {
            ctx.table
                .insert(&TaskData::QuerySlice { index, of: slices })
                .await?;
        }
        Ok(slices)
    }

    async fn build_task_query(
        &self,
        _ctx: &StepContext,
        task_id: i64,
        data: &TaskData,
    ) -> Result<SqlQuery> {
        let TaskData::QuerySlice { index, of } = data else {
            return Err(Error::TaskQueryBuild {
                task_id,
                message: "download export expects query-slice task data".into(),
            });
        };

        if *of <= 1 {
            return Ok(self.content_query.clone());
        }
        Ok(
            SqlQuery::new(
                "SELECT * FROM (${{contentQuery}}) data WHERE data.i % #{sliceCount} = #{sliceIndex}",
            )
            .with_fragment("contentQuery", self.content_query.clone())
            .with_named_parameter("sliceCount", *of)
            .with_named_parameter("sliceIndex", *index),
        )
    }
}
