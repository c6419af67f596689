//! Task table backed by the database through a [`QueryExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tessera_core::StepId;

use crate::error::{Error, Result};
use crate::executor::{QueryExecutor, Row};
use crate::task_table::{
    sql, NextTask, RecordOutcome, TaskAggregate, TaskData, TaskProgress, TaskTable,
};

/// The durable task table, stored in the step's schema.
pub struct SqlTaskTable {
    schema: String,
    step_id: StepId,
    executor: Arc<dyn QueryExecutor>,
    query_context: Value,
}

impl SqlTaskTable {
    /// Creates a table handle for a step.
    #[must_use]
    pub fn new(
        schema: impl Into<String>,
        step_id: StepId,
        executor: Arc<dyn QueryExecutor>,
        query_context: Value,
    ) -> Self {
        Self {
            schema: schema.into(),
            step_id,
            executor,
            query_context,
        }
    }

    fn parse_progress(&self, row: &Row) -> Result<TaskProgress> {
        let counter = |name: &str| -> Result<u32> {
            let value = row.get_i64(name).ok_or_else(|| Error::Serialization {
                message: format!("pick-next result misses column {name}"),
            })?;
            u32::try_from(value).map_err(|_| Error::Serialization {
                message: format!("pick-next column {name} out of range: {value}"),
            })
        };

        let total = counter("total")?;
        let started = counter("started")?;
        let finalized = counter("finalized")?;

        let next = match row.get_i64("task_id") {
            None | Some(-1) => None,
            Some(task_id) => {
                let data = row.get_value("task_data").ok_or_else(|| Error::Serialization {
                    message: format!("task {task_id} carries no task_data"),
                })?;
                let data: TaskData =
                    serde_json::from_value(data.clone()).map_err(|e| Error::Serialization {
                        message: format!("task {task_id} task_data: {e}"),
                    })?;
                Some(NextTask { task_id, data })
            }
        };

        Ok(TaskProgress {
            total,
            started,
            finalized,
            next,
        })
    }
}

#[async_trait]
impl TaskTable for SqlTaskTable {
    async fn create(&self) -> Result<()> {
        self.executor
            .execute(&sql::create_table(&self.schema, self.step_id))
            .await?;
        Ok(())
    }

    async fn insert(&self, data: &TaskData) -> Result<()> {
        let query = sql::insert_task_item(&self.schema, self.step_id, data)?;
        self.executor.execute(&query).await?;
        Ok(())
    }

    async fn pick_next_and_report(&self) -> Result<TaskProgress> {
        let query = sql::retrieve_task_item_and_statistics(self.query_context.clone());
        let rows = self.executor.read_rows(&query).await?;
        let row = rows.first().ok_or_else(|| Error::Serialization {
            message: "pick-next returned no row".into(),
        })?;
        self.parse_progress(row)
    }

    async fn record_progress(
        &self,
        task_id: i64,
        bytes: i64,
        rows: i64,
        files: i32,
        finalized: bool,
    ) -> Result<RecordOutcome> {
        let existing = self
            .executor
            .read_rows(&sql::select_task_item(&self.schema, self.step_id, task_id))
            .await?;
        let Some(row) = existing.first() else {
            return Ok(RecordOutcome::UnknownTask);
        };
        if row.get_value("finalized").and_then(Value::as_bool) == Some(true) {
            return Ok(RecordOutcome::AlreadyFinalized);
        }

        self.executor
            .execute(&sql::update_task_item(
                &self.schema,
                self.step_id,
                task_id,
                bytes,
                rows,
                files,
                finalized,
            ))
            .await?;
        Ok(RecordOutcome::Applied)
    }

    async fn aggregate(&self) -> Result<TaskAggregate> {
        let rows = self
            .executor
            .read_rows(&sql::aggregate_statistics(&self.schema, self.step_id))
            .await?;
        let row = rows.first().ok_or_else(|| Error::Serialization {
            message: "aggregate returned no row".into(),
        })?;

        // Sums over an empty table come back null.
        Ok(TaskAggregate {
            rows_uploaded: row.get_i64("rows_uploaded").unwrap_or(0),
            files_uploaded: row.get_i64("files_uploaded").unwrap_or(0),
            bytes_uploaded: row.get_i64("bytes_uploaded").unwrap_or(0),
        })
    }

    async fn empty_task_data(&self) -> Result<Vec<TaskData>> {
        let rows = self
            .executor
            .read_rows(&sql::empty_task_data(&self.schema, self.step_id))
            .await?;
        rows.iter()
            .map(|row| {
                let value = row.get_value("task_data").ok_or_else(|| Error::Serialization {
                    message: "empty-task row carries no task_data".into(),
                })?;
                serde_json::from_value(value.clone()).map_err(|e| Error::Serialization {
                    message: format!("empty-task task_data: {e}"),
                })
            })
            .collect()
    }
}
