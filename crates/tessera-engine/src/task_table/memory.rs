//! In-memory task table implementation for testing.
//!
//! Provides the same atomicity guarantees as the database-backed table by
//! serializing every operation through one mutex. NOT suitable for
//! production: no persistence, single-process only.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::task_table::{
    NextTask, RecordOutcome, TaskAggregate, TaskData, TaskProgress, TaskTable,
};

/// One in-memory task row.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    /// Serial task id, unique within the step.
    pub task_id: i64,
    /// The row's task data.
    pub data: TaskData,
    /// Bytes uploaded so far.
    pub bytes_uploaded: i64,
    /// Rows uploaded so far.
    pub rows_uploaded: i64,
    /// Files produced so far.
    pub files_uploaded: i32,
    /// Whether the row was handed to a worker.
    pub started: bool,
    /// Whether the row's completion was recorded.
    pub finalized: bool,
}

/// In-memory task table for testing.
#[derive(Debug, Default)]
pub struct InMemoryTaskTable {
    rows: Mutex<Vec<TaskRow>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient_db("task table lock poisoned")
}

impl InMemoryTaskTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn rows(&self) -> Result<Vec<TaskRow>> {
        Ok(self.rows.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl TaskTable for InMemoryTaskTable {
    async fn create(&self) -> Result<()> {
        // Idempotent; the backing vector exists from construction.
        Ok(())
    }

    async fn insert(&self, data: &TaskData) -> Result<()> {
        let mut rows = self.rows.lock().map_err(poison_err)?;
        let task_id = i64::try_from(rows.len()).unwrap_or(i64::MAX - 1) + 1;
        rows.push(TaskRow {
            task_id,
            data: data.clone(),
            bytes_uploaded: 0,
            rows_uploaded: 0,
            files_uploaded: 0,
            started: false,
            finalized: false,
        });
        Ok(())
    }

    async fn pick_next_and_report(&self) -> Result<TaskProgress> {
        let mut rows = self.rows.lock().map_err(poison_err)?;

        #[allow(clippy::cast_possible_truncation)]
        let total = rows.len() as u32;
        #[allow(clippy::cast_possible_truncation)]
        let started = rows.iter().filter(|r| r.started).count() as u32;
        #[allow(clippy::cast_possible_truncation)]
        let finalized = rows.iter().filter(|r| r.finalized).count() as u32;

        let next = rows.iter_mut().find(|r| !r.started).map(|row| {
            row.started = true;
            NextTask {
                task_id: row.task_id,
                data: row.data.clone(),
            }
        });
        let started = started + u32::from(next.is_some());

        Ok(TaskProgress {
            total,
            started,
            finalized,
            next,
        })
    }

    async fn record_progress(
        &self,
        task_id: i64,
        bytes: i64,
        rows_uploaded: i64,
        files: i32,
        finalized: bool,
    ) -> Result<RecordOutcome> {
        let mut rows = self.rows.lock().map_err(poison_err)?;
        let Some(row) = rows.iter_mut().find(|r| r.task_id == task_id) else {
            return Ok(RecordOutcome::UnknownTask);
        };
        if row.finalized {
            return Ok(RecordOutcome::AlreadyFinalized);
        }

        row.bytes_uploaded += bytes;
        row.rows_uploaded += rows_uploaded;
        row.files_uploaded += files;
        row.finalized = finalized;
        Ok(RecordOutcome::Applied)
    }

    async fn aggregate(&self) -> Result<TaskAggregate> {
        let rows = self.rows.lock().map_err(poison_err)?;
        let mut aggregate = TaskAggregate::default();
        for row in rows.iter() {
            aggregate.rows_uploaded += row.rows_uploaded;
            aggregate.bytes_uploaded += row.bytes_uploaded;
            if row.bytes_uploaded > 0 {
                aggregate.files_uploaded += i64::from(row.files_uploaded);
            }
        }
        Ok(aggregate)
    }

    async fn empty_task_data(&self) -> Result<Vec<TaskData>> {
        let rows = self.rows.lock().map_err(poison_err)?;
        Ok(rows
            .iter()
            .filter(|r| r.bytes_uploaded == 0)
            .map(|r| r.data.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(tiles: &[&str]) -> InMemoryTaskTable {
        let table = InMemoryTaskTable::new();
        for tile in tiles {
            table
                .insert(&TaskData::Tile((*tile).into()))
                .await
                .expect("insert");
        }
        table
    }

    #[tokio::test]
    async fn pick_next_hands_out_each_row_once() -> Result<()> {
        let table = seeded(&["1", "5", "21"]).await;

        let mut seen = Vec::new();
        loop {
            let progress = table.pick_next_and_report().await?;
            match progress.next {
                Some(next) => seen.push(next.task_id),
                None => break,
            }
        }

        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn counters_follow_lifecycle() -> Result<()> {
        let table = seeded(&["1", "5"]).await;

        let progress = table.pick_next_and_report().await?;
        assert_eq!((progress.total, progress.started, progress.finalized), (2, 1, 0));

        let picked = progress.next.expect("first task");
        table.record_progress(picked.task_id, 10, 1, 1, true).await?;

        let progress = table.pick_next_and_report().await?;
        assert_eq!((progress.total, progress.started, progress.finalized), (2, 2, 1));
        assert!(progress.next.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_progress_is_dropped() -> Result<()> {
        let table = seeded(&["1"]).await;
        let picked = table
            .pick_next_and_report()
            .await?
            .next
            .expect("task present");

        assert_eq!(
            table.record_progress(picked.task_id, 10, 1, 1, true).await?,
            RecordOutcome::Applied
        );
        assert_eq!(
            table.record_progress(picked.task_id, 10, 1, 1, true).await?,
            RecordOutcome::AlreadyFinalized
        );

        let aggregate = table.aggregate().await?;
        assert_eq!(aggregate.bytes_uploaded, 10);
        assert_eq!(aggregate.rows_uploaded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn aggregate_suppresses_empty_rows() -> Result<()> {
        let table = seeded(&["1", "5"]).await;
        let first = table.pick_next_and_report().await?.next.expect("task");
        let second = table.pick_next_and_report().await?.next.expect("task");

        table.record_progress(first.task_id, 100, 2, 1, true).await?;
        // Finished but uploaded nothing: its file count must not leak in.
        table.record_progress(second.task_id, 0, 0, 1, true).await?;

        let aggregate = table.aggregate().await?;
        assert_eq!(aggregate.files_uploaded, 1);
        assert_eq!(aggregate.bytes_uploaded, 100);

        let empty = table.empty_task_data().await?;
        assert_eq!(empty, vec![second.data]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_task_is_reported() -> Result<()> {
        let table = seeded(&["1"]).await;
        assert_eq!(
            table.record_progress(99, 1, 1, 1, true).await?,
            RecordOutcome::UnknownTask
        );
        Ok(())
    }
}
