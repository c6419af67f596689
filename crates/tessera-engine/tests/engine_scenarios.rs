//! End-to-end scenarios for the tasked-step engine, driven against the
//! in-memory collaborators.
//!
//! Each test plays the role of the hosting dispatcher: it calls `prepare`
//! and `execute`, then feeds the progress events the database would emit
//! for every dispatched task.

mod common;

use std::sync::Arc;

use tessera_core::{SpaceId, StepId};

use tessera_engine::changed_tiles::ChangedTilesStep;
use tessera_engine::config::{QuadType, StepConfig};
use tessera_engine::error::Result;
use tessera_engine::events::TaskUpdate;
use tessera_engine::executor::{DispatchRecord, Row, RowBuilder, ScriptedExecutor};
use tessera_engine::hub::{InMemoryHub, SpaceMeta, SpaceStatistics};
use tessera_engine::outputs::{FileStatistics, OutputPayload, TileInvalidations};
use tessera_engine::quad::HereQuad;
use tessera_engine::step::{StepEngine, StepState};
use tessera_engine::task_table::memory::InMemoryTaskTable;
use tessera_engine::version_ref::VersionRef;

fn space_id() -> SpaceId {
    SpaceId::new("scenario-space").expect("valid space id")
}

fn space_meta() -> SpaceMeta {
    SpaceMeta {
        space_id: space_id(),
        versions_to_keep: 10,
        extends: None,
        root_table: "scenario_space_root".into(),
        super_table: None,
    }
}

fn space_statistics() -> SpaceStatistics {
    SpaceStatistics {
        byte_size: 2 * 1024 * 1024 * 1024,
        estimated_feature_count: 500_000,
        max_version: 42,
    }
}

fn changed_tiles_config() -> StepConfig {
    StepConfig::new(space_id(), VersionRef::Range { start: 10, end: 11 })
        .with_quad_type(QuadType::HereQuad)
        .with_target_level(8)
}

/// A valid decimal tile id of the equirectangular scheme.
fn here_tile(x: u32, y: u32, level: u8) -> String {
    HereQuad::new(x, y, level).expect("valid cell").quad_id()
}

fn delta_row(tile: Option<&str>, id: &str) -> Row {
    let builder = RowBuilder::new().column("id", id);
    match tile {
        Some(tile) => builder.column("tile", tile).build(),
        None => builder.column("tile", serde_json::Value::Null).build(),
    }
}

fn tile_row(tile: &str) -> Row {
    RowBuilder::new().column("tile", tile).build()
}

struct Harness {
    engine: StepEngine<ChangedTilesStep>,
    executor: Arc<ScriptedExecutor>,
    table: Arc<InMemoryTaskTable>,
}

fn harness(config: StepConfig) -> Harness {
    common::init_test_logging();

    let executor = Arc::new(ScriptedExecutor::new());
    let table = Arc::new(InMemoryTaskTable::new());
    let hub = Arc::new(InMemoryHub::new().with_space(space_meta(), space_statistics()));

    let engine = StepEngine::new(
        StepId::generate(),
        "export",
        config,
        ChangedTilesStep::new(),
        Arc::clone(&table) as Arc<dyn tessera_engine::task_table::TaskTable>,
        Arc::clone(&executor) as Arc<dyn tessera_engine::executor::QueryExecutor>,
        hub,
    );
    Harness {
        engine,
        executor,
        table,
    }
}

fn update_for(dispatch: &DispatchRecord, bytes: i64, features: i64, files: i32) -> TaskUpdate {
    TaskUpdate {
        task_id: dispatch.task_id,
        byte_count: bytes,
        feature_count: features,
        file_count: files,
    }
}

fn statistics_output(engine: &StepEngine<ChangedTilesStep>) -> FileStatistics {
    engine
        .outputs()
        .iter()
        .find_map(|output| match (&output.set[..], &output.payload) {
            ("statistics", OutputPayload::Statistics(stats)) => Some(*stats),
            _ => None,
        })
        .expect("statistics output registered")
}

fn invalidations_output(engine: &StepEngine<ChangedTilesStep>) -> TileInvalidations {
    engine
        .outputs()
        .iter()
        .find_map(|output| match &output.payload {
            OutputPayload::TileInvalidations(invalidations) => Some(invalidations.clone()),
            _ => None,
        })
        .expect("tile invalidation output registered")
}

#[tokio::test]
async fn empty_diff_completes_on_execute() -> Result<()> {
    let mut harness = harness(changed_tiles_config());
    // No changes between the versions.
    harness.executor.push_read_result(vec![]);

    harness.engine.prepare("job-owner").await?;
    let completed = harness.engine.execute(false).await?;

    assert!(completed);
    assert_eq!(harness.engine.state(), StepState::Completed);
    assert!(harness.executor.dispatches()?.is_empty());

    let stats = statistics_output(&harness.engine);
    assert_eq!(stats, FileStatistics::default());
    assert!(invalidations_output(&harness.engine).tile_ids.is_empty());
    Ok(())
}

#[tokio::test]
async fn single_changed_feature_single_tile() -> Result<()> {
    let tile = here_tile(1, 0, 1);
    let mut harness = harness(changed_tiles_config());
    // The feature moved within one tile: delta and base agree.
    harness
        .executor
        .push_read_result(vec![delta_row(Some(&tile), "feature-a")]);
    harness.executor.push_read_result(vec![tile_row(&tile)]);

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);
    assert_eq!(harness.engine.state(), StepState::Running);

    let dispatches = harness.executor.dispatches()?;
    assert_eq!(dispatches.len(), 1);

    let complete = harness
        .engine
        .on_async_update(update_for(&dispatches[0], 1234, 5, 1))
        .await?;
    assert!(complete);
    assert_eq!(harness.engine.state(), StepState::Completed);
    assert!((harness.engine.estimated_progress() - 1.0).abs() < f32::EPSILON);

    let stats = statistics_output(&harness.engine);
    assert_eq!(stats.bytes_uploaded, 1234);
    assert_eq!(stats.rows_uploaded, 5);
    assert_eq!(stats.files_uploaded, 1);
    assert!(invalidations_output(&harness.engine).tile_ids.is_empty());
    Ok(())
}

#[tokio::test]
async fn deletion_empties_a_tile() -> Result<()> {
    let old_tile = here_tile(1, 1, 1);
    let mut harness = harness(changed_tiles_config());
    // The deletion carries no geometry; only the base pass finds coverage.
    harness
        .executor
        .push_read_result(vec![delta_row(None, "feature-gone")]);
    harness.executor.push_read_result(vec![tile_row(&old_tile)]);

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);

    let dispatches = harness.executor.dispatches()?;
    assert_eq!(dispatches.len(), 1);

    let complete = harness
        .engine
        .on_async_update(update_for(&dispatches[0], 0, 0, 0))
        .await?;
    assert!(complete);

    let stats = statistics_output(&harness.engine);
    assert_eq!(stats, FileStatistics::default());
    assert_eq!(invalidations_output(&harness.engine).tile_ids, vec![old_tile]);
    Ok(())
}

#[tokio::test]
async fn fan_out_is_bounded_by_thread_count() -> Result<()> {
    let tiles: Vec<String> = (0..20).map(|i| here_tile(i % 8, i / 8, 3)).collect();
    let mut harness = harness(changed_tiles_config());
    harness.executor.push_read_result(
        tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| delta_row(Some(tile), &format!("feature-{i}")))
            .collect(),
    );
    harness.executor.push_read_result(vec![]);

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);

    // The initial batch is exactly the fixed fan-out.
    assert_eq!(harness.executor.dispatches()?.len(), 8);

    let mut delivered = 0;
    let mut complete = false;
    while !complete {
        let dispatches = harness.executor.dispatches()?;
        let in_flight = dispatches.len() - delivered;
        assert!(in_flight <= 8, "in-flight {in_flight} exceeds the bound");

        let next = dispatches[delivered].clone();
        complete = harness
            .engine
            .on_async_update(update_for(&next, 10, 1, 1))
            .await?;
        delivered += 1;
    }

    let dispatches = harness.executor.dispatches()?;
    assert_eq!(dispatches.len(), 20);
    assert_eq!(delivered, 20);

    // Every task was dispatched exactly once.
    let mut task_ids: Vec<i64> = dispatches.iter().map(|d| d.task_id).collect();
    task_ids.sort_unstable();
    task_ids.dedup();
    assert_eq!(task_ids.len(), 20);
    Ok(())
}

#[tokio::test]
async fn bad_target_level_fails_validation() {
    let harness = harness(changed_tiles_config().with_target_level(13));
    let err = harness.engine.validate().await.expect_err("level 13");
    assert!(err.to_string().contains("TargetLevel must be between 0 and 12"));
}

#[tokio::test]
async fn head_resolves_to_max_version() -> Result<()> {
    let mut config = changed_tiles_config();
    config.version_ref = VersionRef::Head;
    let mut harness = harness(config);

    harness.engine.prepare("job-owner").await?;
    assert_eq!(harness.engine.state(), StepState::Prepared);
    assert_eq!(harness.engine.config().version_ref, VersionRef::Version(42));
    Ok(())
}

#[tokio::test]
async fn resume_restarts_only_unstarted_rows() -> Result<()> {
    let tiles: Vec<String> = (0..10).map(|i| here_tile(i, 0, 4)).collect();
    let mut harness = harness(changed_tiles_config());
    harness.executor.push_read_result(
        tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| delta_row(Some(tile), &format!("feature-{i}")))
            .collect(),
    );
    harness.executor.push_read_result(vec![]);

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);
    assert_eq!(harness.executor.dispatches()?.len(), 8);

    // Crash: a new engine over the same durable table, restored counters,
    // fresh executor.
    let snapshot = harness.engine.snapshot();
    let resumed_executor = Arc::new(ScriptedExecutor::new());
    let hub = Arc::new(InMemoryHub::new().with_space(space_meta(), space_statistics()));
    let mut resumed = StepEngine::new(
        StepId::generate(),
        "export",
        changed_tiles_config(),
        ChangedTilesStep::new(),
        Arc::clone(&harness.table) as Arc<dyn tessera_engine::task_table::TaskTable>,
        Arc::clone(&resumed_executor) as Arc<dyn tessera_engine::executor::QueryExecutor>,
        hub,
    )
    .with_snapshot(snapshot);
    assert_eq!(resumed.state(), StepState::Running);

    assert!(!resumed.execute(true).await?);

    // No rows were re-inserted, and only the two unstarted rows were
    // dispatched; the eight in-flight rows stay with the database.
    assert_eq!(harness.table.rows()?.len(), 10);
    assert_eq!(resumed_executor.dispatches()?.len(), 2);

    // The database eventually reports all ten completions.
    let mut all: Vec<DispatchRecord> = harness.executor.dispatches()?;
    all.extend(resumed_executor.dispatches()?);
    let mut complete = false;
    for dispatch in &all {
        assert!(!complete);
        complete = resumed.on_async_update(update_for(dispatch, 1, 1, 1)).await?;
    }
    assert!(complete);
    assert_eq!(resumed.state(), StepState::Completed);
    Ok(())
}

#[tokio::test]
async fn duplicate_progress_events_are_dropped() -> Result<()> {
    let tile = here_tile(2, 3, 2);
    let other_tile = here_tile(1, 1, 2);
    let mut harness = harness(changed_tiles_config());
    harness.executor.push_read_result(vec![
        delta_row(Some(&tile), "feature-a"),
        delta_row(Some(&other_tile), "feature-b"),
    ]);
    harness.executor.push_read_result(vec![]);

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);

    let dispatches = harness.executor.dispatches()?;
    assert_eq!(dispatches.len(), 2);

    assert!(!harness
        .engine
        .on_async_update(update_for(&dispatches[0], 100, 2, 1))
        .await?);
    // Same event again: dropped, no replacement dispatch, counters intact.
    assert!(!harness
        .engine
        .on_async_update(update_for(&dispatches[0], 100, 2, 1))
        .await?);
    // An event for a task id that never existed is equally dropped.
    assert!(!harness
        .engine
        .on_async_update(TaskUpdate {
            task_id: 999,
            byte_count: 1,
            feature_count: 1,
            file_count: 1,
        })
        .await?);
    assert_eq!(harness.executor.dispatches()?.len(), 2);

    let complete = harness
        .engine
        .on_async_update(update_for(&dispatches[1], 50, 1, 1))
        .await?;
    assert!(complete);

    let stats = statistics_output(&harness.engine);
    assert_eq!(stats.bytes_uploaded, 150);
    assert_eq!(stats.rows_uploaded, 3);
    Ok(())
}

struct FixedFiles(Vec<String>);

#[async_trait::async_trait]
impl tessera_engine::outputs::ExportedFilesProvider for FixedFiles {
    async fn exported_files(&self, _step_id: StepId) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn completion_registers_exported_files() -> Result<()> {
    let tile = here_tile(0, 0, 2);
    let mut harness = harness(changed_tiles_config());
    harness
        .executor
        .push_read_result(vec![delta_row(Some(&tile), "feature-a")]);
    harness.executor.push_read_result(vec![tile_row(&tile)]);

    let urls = vec!["https://files.example/export/0_part.csv".to_string()];
    harness.engine = harness
        .engine
        .with_files_provider(Arc::new(FixedFiles(urls.clone())));

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);
    let dispatches = harness.executor.dispatches()?;
    assert!(harness
        .engine
        .on_async_update(update_for(&dispatches[0], 9, 1, 1))
        .await?);

    let exported = harness
        .engine
        .outputs()
        .iter()
        .find_map(|output| match &output.payload {
            OutputPayload::ExportedData(urls) => Some(urls.clone()),
            _ => None,
        })
        .expect("exported data registered");
    assert_eq!(exported, urls);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_replacement_dispatches() -> Result<()> {
    let tiles: Vec<String> = (0..4).map(|i| here_tile(i, 1, 3)).collect();
    let mut config = changed_tiles_config();
    config.parallelism.thread_count = 8;
    let mut harness = harness(config);
    harness.executor.push_read_result(
        tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| delta_row(Some(tile), &format!("feature-{i}")))
            .collect(),
    );
    harness.executor.push_read_result(vec![]);

    harness.engine.prepare("job-owner").await?;
    assert!(!harness.engine.execute(false).await?);
    let dispatched_before = harness.executor.dispatches()?.len();
    assert_eq!(dispatched_before, 4);

    harness.engine.cancel();
    let dispatches = harness.executor.dispatches()?;
    assert!(!harness
        .engine
        .on_async_update(update_for(&dispatches[0], 10, 1, 1))
        .await?);

    // Progress was recorded, but nothing new went out.
    assert_eq!(harness.executor.dispatches()?.len(), dispatched_before);
    assert_eq!(harness.engine.state(), StepState::Running);
    Ok(())
}
