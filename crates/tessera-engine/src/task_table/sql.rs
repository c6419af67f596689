//! SQL templates for the task table.
//!
//! The table layout and the `get_task_item_and_statistics()` result shape
//! are stable contracts: a resumed step must find the table exactly as an
//! earlier process left it.

use serde_json::{json, Value};

use tessera_core::StepId;

use crate::error::{Error, Result};
use crate::query::SqlQuery;
use crate::task_table::TaskData;

/// Returns the name of a step's temporary task table.
#[must_use]
pub fn temp_table_name(step_id: StepId) -> String {
    format!("job_data_{}", step_id.to_string().to_lowercase())
}

/// Returns the name of the task table's primary-key constraint.
#[must_use]
pub fn primary_key_name(step_id: StepId) -> String {
    format!("{}_primKey", temp_table_name(step_id))
}

/// DDL creating the task table if it does not exist.
#[must_use]
pub fn create_table(schema: &str, step_id: StepId) -> SqlQuery {
    SqlQuery::new(
        "\
CREATE TABLE IF NOT EXISTS ${schema}.${table}
(
    task_id SERIAL,
    task_data JSONB,
    bytes_uploaded BIGINT DEFAULT 0,
    rows_uploaded BIGINT DEFAULT 0,
    files_uploaded INT DEFAULT 0,
    started BOOLEAN DEFAULT false,
    finalized BOOLEAN DEFAULT false,
    CONSTRAINT ${primaryKey} PRIMARY KEY (task_id)
);",
    )
    .with_variable("schema", schema)
    .with_variable("table", temp_table_name(step_id))
    .with_variable("primaryKey", primary_key_name(step_id))
}

/// Appends a task row in unstarted state.
///
/// # Errors
///
/// Returns an error if the task data cannot be serialized.
pub fn insert_task_item(schema: &str, step_id: StepId, data: &TaskData) -> Result<SqlQuery> {
    let serialized = serde_json::to_string(data).map_err(|e| Error::Serialization {
        message: format!("task data: {e}"),
    })?;
    Ok(
        SqlQuery::new("INSERT INTO ${schema}.${table} AS t (task_data) VALUES (#{taskData}::JSONB);")
            .with_variable("schema", schema)
            .with_variable("table", temp_table_name(step_id))
            .with_named_parameter("taskData", serialized),
    )
}

/// Reads the started/finalized flags of one row.
#[must_use]
pub fn select_task_item(schema: &str, step_id: StepId, task_id: i64) -> SqlQuery {
    SqlQuery::new(
        "SELECT started, finalized FROM ${schema}.${table} WHERE task_id = #{taskId};",
    )
    .with_variable("schema", schema)
    .with_variable("table", temp_table_name(step_id))
    .with_named_parameter("taskId", task_id)
}

/// Adds reported deltas to a row and sets its finalized flag.
#[must_use]
pub fn update_task_item(
    schema: &str,
    step_id: StepId,
    task_id: i64,
    bytes_uploaded: i64,
    rows_uploaded: i64,
    files_uploaded: i32,
    finalized: bool,
) -> SqlQuery {
    SqlQuery::new(
        "\
UPDATE ${schema}.${table} t
    SET bytes_uploaded = t.bytes_uploaded + #{bytesUploaded},
        rows_uploaded = t.rows_uploaded + #{rowsUploaded},
        files_uploaded = t.files_uploaded + #{filesUploaded},
        finalized = #{finalized}
    WHERE task_id = #{taskId};",
    )
    .with_variable("schema", schema)
    .with_variable("table", temp_table_name(step_id))
    .with_named_parameter("bytesUploaded", bytes_uploaded)
    .with_named_parameter("rowsUploaded", rows_uploaded)
    .with_named_parameter("filesUploaded", files_uploaded)
    .with_named_parameter("finalized", finalized)
    .with_named_parameter("taskId", task_id)
}

/// Atomic pick-next-and-report through the database-side function.
///
/// The function resolves the step's table from the query context and
/// returns one row `total, started, finalized, task_id, task_data`;
/// `task_id = -1` (or null) means no unstarted row was available.
#[must_use]
pub fn retrieve_task_item_and_statistics(context: Value) -> SqlQuery {
    SqlQuery::new(
        "SELECT total, started, finalized, task_id, task_data FROM get_task_item_and_statistics();",
    )
    .with_context(context)
}

/// Sums the per-row statistics; rows that uploaded nothing contribute no
/// files.
#[must_use]
pub fn aggregate_statistics(schema: &str, step_id: StepId) -> SqlQuery {
    SqlQuery::new(
        "\
SELECT sum(rows_uploaded) as rows_uploaded,
       sum(CASE
           WHEN (bytes_uploaded)::bigint > 0
           THEN (files_uploaded)::bigint
           ELSE 0
       END) as files_uploaded,
       sum(bytes_uploaded)::bigint as bytes_uploaded
        FROM ${schema}.${tmpTable};",
    )
    .with_variable("schema", schema)
    .with_variable("tmpTable", temp_table_name(step_id))
}

/// Lists the task data of every row that uploaded zero bytes.
#[must_use]
pub fn empty_task_data(schema: &str, step_id: StepId) -> SqlQuery {
    SqlQuery::new("SELECT task_data FROM ${schema}.${table} WHERE bytes_uploaded = 0;")
        .with_variable("schema", schema)
        .with_variable("table", temp_table_name(step_id))
}

/// Builds the session context consumed by the database-side functions.
#[must_use]
pub fn query_context(
    step_id: StepId,
    schema: &str,
    root_table: &str,
    history_enabled: bool,
    super_table: Option<&str>,
) -> Value {
    json!({
        "stepId": step_id.to_string(),
        "schema": schema,
        "table": root_table,
        "historyEnabled": history_enabled,
        "extendedTable": super_table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_id() -> StepId {
        "01J8ZQ4Q2M0000000000000000"
            .parse()
            .expect("fixed ULID parses")
    }

    #[test]
    fn table_names_derive_from_step_id() {
        let table = temp_table_name(step_id());
        assert_eq!(table, "job_data_01j8zq4q2m0000000000000000");
        assert_eq!(primary_key_name(step_id()), format!("{table}_primKey"));
    }

    #[test]
    fn create_table_renders_schema_contract() {
        let rendered = create_table("export", step_id()).render().expect("render");
        assert!(rendered.text.contains("CREATE TABLE IF NOT EXISTS export.job_data_"));
        assert!(rendered.text.contains("task_id SERIAL"));
        assert!(rendered.text.contains("task_data JSONB"));
        assert!(rendered.text.contains("bytes_uploaded BIGINT DEFAULT 0"));
        assert!(rendered.text.contains("finalized BOOLEAN DEFAULT false"));
        assert!(rendered.text.contains("_primKey PRIMARY KEY (task_id)"));
        assert!(rendered.parameters.is_empty());
    }

    #[test]
    fn insert_parameterizes_task_data() {
        let query = insert_task_item("export", step_id(), &TaskData::Tile("341".into()))
            .expect("serializable");
        let rendered = query.render().expect("render");
        assert!(rendered.text.contains("VALUES ($1::JSONB)"));
        assert_eq!(rendered.parameters.len(), 1);
        let payload = rendered.parameters[0].as_str().expect("string param");
        assert!(payload.contains("\"tile\""));
    }

    #[test]
    fn update_adds_deltas() {
        let rendered = update_task_item("export", step_id(), 7, 100, 5, 1, true)
            .render()
            .expect("render");
        assert!(rendered.text.contains("bytes_uploaded = t.bytes_uploaded + $1"));
        assert!(rendered.text.contains("finalized = $4"));
        assert!(rendered.text.contains("WHERE task_id = $5"));
        assert_eq!(rendered.parameters.len(), 5);
    }

    #[test]
    fn aggregate_suppresses_empty_rows() {
        let rendered = aggregate_statistics("export", step_id())
            .render()
            .expect("render");
        assert!(rendered.text.contains("WHEN (bytes_uploaded)::bigint > 0"));
        assert!(rendered.text.contains("ELSE 0"));
    }

    #[test]
    fn pick_next_carries_context() {
        let query = retrieve_task_item_and_statistics(query_context(
            step_id(),
            "export",
            "space_root",
            true,
            None,
        ));
        assert!(query.template_text().contains("get_task_item_and_statistics()"));
        let context = query.context().expect("context attached");
        assert_eq!(context["schema"], "export");
        assert_eq!(context["historyEnabled"], true);
    }
}
