//! Progress events delivered from the database to the engine.
//!
//! A task query finishing inside the database emits exactly one progress
//! event for its task id; the callback transport parses the wire envelope
//! and hands the payload to
//! [`StepEngine::on_async_update`](crate::step::StepEngine::on_async_update).
//! Events for distinct task ids may arrive in any order.

use serde::{Deserialize, Serialize};

/// Per-task completion statistics reported by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    /// The task the statistics belong to.
    pub task_id: i64,
    /// Bytes uploaded by this task.
    pub byte_count: i64,
    /// Features uploaded by this task.
    pub feature_count: i64,
    /// Files produced by this task.
    pub file_count: i32,
}

/// The wire envelope around asynchronous process updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessUpdate {
    /// Completion of one space-based task query.
    SpaceBasedTaskUpdate(TaskUpdate),
}

impl ProcessUpdate {
    /// Unwraps the task update payload.
    #[must_use]
    pub const fn into_task_update(self) -> TaskUpdate {
        match self {
            Self::SpaceBasedTaskUpdate(update) => update,
        }
    }
}
