//! The durable task table: queue-plus-counters for one step.
//!
//! One row per task item, owned by the step for its lifetime. The table is
//! the single source of truth for progress; the engine never tracks
//! in-flight work in memory beyond the bounded dispatch loop.
//!
//! ## Atomicity
//!
//! [`TaskTable::pick_next_and_report`] is the sole mechanism handing rows
//! to workers. It must be serializable with respect to itself: no two
//! callers may receive the same task id.

pub mod memory;
pub mod sql;
mod sql_table;

pub use sql_table::SqlTaskTable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The typed task input persisted as the row's opaque JSON `task_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum TaskData {
    /// Export one tile, identified by its tile id.
    Tile(String),
    /// Export one modulo slice of a larger result set.
    QuerySlice {
        /// Slice index, `0..of`.
        index: u32,
        /// Total number of slices.
        of: u32,
    },
}

impl TaskData {
    /// Returns the tile id for tile-grained task data.
    #[must_use]
    pub fn as_tile_id(&self) -> Option<&str> {
        match self {
            Self::Tile(id) => Some(id),
            Self::QuerySlice { .. } => None,
        }
    }
}

/// An unstarted task handed out by `pick_next_and_report`.
#[derive(Debug, Clone, PartialEq)]
pub struct NextTask {
    /// The row's task id.
    pub task_id: i64,
    /// The row's task data.
    pub data: TaskData,
}

/// The progress read-model, derived from the table in a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    /// Total task rows.
    pub total: u32,
    /// Rows handed to a worker.
    pub started: u32,
    /// Rows whose completion has been recorded.
    pub finalized: u32,
    /// The next unstarted row, already marked started, if one existed.
    pub next: Option<NextTask>,
}

impl TaskProgress {
    /// Returns true once every row is finalized.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.total == self.finalized
    }

    /// Returns the step's progress fraction in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        self.finalized as f32 / self.total as f32
    }
}

/// Aggregated per-row statistics.
///
/// A row contributes to `files_uploaded` only if it uploaded at least one
/// byte (empty-file suppression).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskAggregate {
    /// Sum of uploaded rows.
    pub rows_uploaded: i64,
    /// Sum of produced files, empty rows suppressed.
    pub files_uploaded: i64,
    /// Sum of uploaded bytes.
    pub bytes_uploaded: i64,
}

/// Outcome of recording a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The deltas were added and the row marked finalized.
    Applied,
    /// The row was already finalized; the event was dropped.
    AlreadyFinalized,
    /// No row exists for the task id; the event was dropped.
    UnknownTask,
}

/// Durable queue-plus-counters for a step.
#[async_trait]
pub trait TaskTable: Send + Sync {
    /// Creates the table if it does not exist. Idempotent.
    async fn create(&self) -> Result<()>;

    /// Appends a new row in `started = false, finalized = false` state.
    async fn insert(&self, data: &TaskData) -> Result<()>;

    /// Atomically returns the counters and, if an unstarted row exists,
    /// hands it out marked `started = true`.
    async fn pick_next_and_report(&self) -> Result<TaskProgress>;

    /// Adds the reported deltas to a row and sets its finalized flag.
    async fn record_progress(
        &self,
        task_id: i64,
        bytes: i64,
        rows: i64,
        files: i32,
        finalized: bool,
    ) -> Result<RecordOutcome>;

    /// Returns the summed statistics across all rows.
    async fn aggregate(&self) -> Result<TaskAggregate>;

    /// Returns the task data of every row that uploaded zero bytes.
    async fn empty_task_data(&self) -> Result<Vec<TaskData>>;
}
