//! Query executor seam: the engine's only path to the database.
//!
//! The executor owns connections, retries of transient statement failures
//! and session timeouts. The engine distinguishes three interaction shapes:
//!
//! - **awaited reads/writes** — planner passes, task-table maintenance
//! - **one-way async dispatch** — the per-task export query; its completion
//!   comes back later as a [`TaskUpdate`](crate::events::TaskUpdate)
//! - **precalculation** — the database-side fan-out sizing function

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::query::SqlQuery;

/// One result row, addressed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Creates a row from column/value pairs.
    #[must_use]
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    /// Returns an integer column.
    #[must_use]
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.0.get(column).and_then(Value::as_i64)
    }

    /// Returns a string column.
    #[must_use]
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(Value::as_str)
    }

    /// Returns a raw JSON column.
    #[must_use]
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.0.get(column).filter(|v| !v.is_null())
    }
}

/// A builder for rows in tests and adapters.
#[derive(Debug, Default)]
pub struct RowBuilder(Map<String, Value>);

impl RowBuilder {
    /// Creates an empty row builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Finishes the row.
    #[must_use]
    pub fn build(self) -> Row {
        Row(self.0)
    }
}

/// Executor for queries against the backing database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a read query and awaits its rows.
    async fn read_rows(&self, query: &SqlQuery) -> Result<Vec<Row>>;

    /// Runs a write statement and awaits the affected row count.
    async fn execute(&self, query: &SqlQuery) -> Result<u64>;

    /// Dispatches a task query for asynchronous execution.
    ///
    /// This is a one-way send: the call returns once the database accepted
    /// the query; completion arrives later as a progress event.
    /// `acu_share` is the portion of the step's compute-unit claim this
    /// task's session consumes.
    async fn dispatch_async(&self, task_id: i64, query: &SqlQuery, acu_share: f64) -> Result<()>;

    /// Consults the database-side fan-out precalculation for an export
    /// query over `source_table` with the given estimated feature count.
    async fn precalc_thread_count(
        &self,
        estimated_feature_count: u64,
        export_query: &SqlQuery,
        source_table: &str,
    ) -> Result<u32>;
}

/// Record of one asynchronous dispatch accepted by the scripted executor.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    /// The dispatched task.
    pub task_id: i64,
    /// Rendered query text.
    pub query_text: String,
    /// The compute-unit share the dispatch claimed.
    pub acu_share: f64,
}

/// Scripted in-memory executor for testing.
///
/// Read results are served from a FIFO script; dispatches are recorded
/// instead of executed. NOT suitable for production use.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    read_script: Mutex<VecDeque<Vec<Row>>>,
    dispatches: Mutex<Vec<DispatchRecord>>,
    writes: Mutex<Vec<String>>,
    thread_count: Mutex<u32>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient_db("scripted executor lock poisoned")
}

impl ScriptedExecutor {
    /// Creates an executor with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_count: Mutex::new(1),
            ..Self::default()
        }
    }

    /// Appends one read result to the script.
    pub fn push_read_result(&self, rows: Vec<Row>) {
        self.read_script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(rows);
    }

    /// Sets the value returned by the precalculation function.
    pub fn set_thread_count(&self, count: u32) {
        *self
            .thread_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = count;
    }

    /// Returns all recorded dispatches.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dispatches(&self) -> Result<Vec<DispatchRecord>> {
        Ok(self.dispatches.lock().map_err(poison_err)?.clone())
    }

    /// Returns the rendered text of all executed write statements.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn writes(&self) -> Result<Vec<String>> {
        Ok(self.writes.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn read_rows(&self, _query: &SqlQuery) -> Result<Vec<Row>> {
        self.read_script
            .lock()
            .map_err(poison_err)?
            .pop_front()
            .ok_or_else(|| Error::transient_db("read script exhausted"))
    }

    async fn execute(&self, query: &SqlQuery) -> Result<u64> {
        let rendered = query.render().map_err(|e| Error::Serialization {
            message: e.to_string(),
        })?;
        self.writes.lock().map_err(poison_err)?.push(rendered.text);
        Ok(1)
    }

    async fn dispatch_async(&self, task_id: i64, query: &SqlQuery, acu_share: f64) -> Result<()> {
        let rendered = query.render().map_err(|e| Error::TaskQueryBuild {
            task_id,
            message: e.to_string(),
        })?;
        self.dispatches.lock().map_err(poison_err)?.push(DispatchRecord {
            task_id,
            query_text: rendered.text,
            acu_share,
        });
        Ok(())
    }

    async fn precalc_thread_count(
        &self,
        _estimated_feature_count: u64,
        _export_query: &SqlQuery,
        _source_table: &str,
    ) -> Result<u32> {
        Ok(*self.thread_count.lock().map_err(poison_err)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_reads_are_fifo() -> Result<()> {
        let executor = ScriptedExecutor::new();
        executor.push_read_result(vec![RowBuilder::new().column("n", 1).build()]);
        executor.push_read_result(vec![RowBuilder::new().column("n", 2).build()]);

        let query = SqlQuery::new("SELECT 1");
        assert_eq!(executor.read_rows(&query).await?[0].get_i64("n"), Some(1));
        assert_eq!(executor.read_rows(&query).await?[0].get_i64("n"), Some(2));
        assert!(executor.read_rows(&query).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn dispatches_are_recorded() -> Result<()> {
        let executor = ScriptedExecutor::new();
        executor
            .dispatch_async(7, &SqlQuery::new("SELECT geo FROM t"), 0.25)
            .await?;

        let dispatches = executor.dispatches()?;
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].task_id, 7);
        assert!((dispatches[0].acu_share - 0.25).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn row_accessors() {
        let row = RowBuilder::new()
            .column("total", 5)
            .column("task_data", Value::Null)
            .column("tile", "341")
            .build();
        assert_eq!(row.get_i64("total"), Some(5));
        assert_eq!(row.get_str("tile"), Some("341"));
        assert!(row.get_value("task_data").is_none());
        assert!(row.get_i64("missing").is_none());
    }
}
