//! The tasked-step execution engine.
//!
//! This module provides:
//! - `StepState`: the state machine for step execution
//! - `TaskedStepSpec`: the capability set a concrete step kind implements
//! - `StepEngine`: the control loop driving preparation, fan-out, progress
//!   and completion
//!
//! ## Scheduling contract
//!
//! The engine is single-threaded-cooperative: the hosting dispatcher must
//! deliver `execute` and `on_async_update` serially per step instance.
//! Both take `&mut self`, which encodes that contract in the type system.
//! Parallelism lives below the engine, inside the database, where the
//! dispatched task queries run concurrently.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::StepId;

use crate::config::StepConfig;
use crate::error::{Error, Result};
use crate::events::TaskUpdate;
use crate::executor::QueryExecutor;
use crate::hub::{HubClient, HubError};
use crate::metrics::EngineMetrics;
use crate::outputs::{
    ExportedFilesProvider, FileStatistics, OutputPayload, OutputSet, RegisteredOutput, Visibility,
    EXPORTED_DATA, INTERNAL_STATISTICS, STATISTICS,
};
use crate::query::SqlQuery;
use crate::resources::{Load, ResourceEstimator};
use crate::task_table::{NextTask, RecordOutcome, TaskData, TaskTable};
use crate::version_ref::VersionRef;

/// Step execution state machine.
///
/// ```text
/// ┌─────┐ prepare ┌──────────┐ execute ┌─────────┐ last task ┌───────────┐
/// │ NEW │────────►│ PREPARED │────────►│ RUNNING │──────────►│ COMPLETED │
/// └─────┘         └──────────┘         └─────────┘ finalized └───────────┘
///    │                  │                   │
///    └──────────────────┴───────────────────┴──── unrecoverable error ───► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Created, not yet prepared.
    New,
    /// Version ref resolved, ready to execute.
    Prepared,
    /// Task rows created, dispatches in flight.
    Running,
    /// Every task row finalized, outputs registered.
    Completed,
    /// Terminated by an unrecoverable error.
    Failed,
}

impl StepState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::New => matches!(target, Self::Prepared | Self::Failed),
            Self::Prepared => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::New
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Prepared => write!(f, "PREPARED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Collaborators and configuration handed to a step spec.
#[derive(Clone)]
pub struct StepContext {
    /// The executing step.
    pub step_id: StepId,
    /// Database schema the step's table lives in.
    pub schema: String,
    /// The step's configuration, version ref resolved.
    pub config: StepConfig,
    /// Hub client for metadata and statistics.
    pub hub: Arc<dyn HubClient>,
    /// Executor for database queries.
    pub executor: Arc<dyn QueryExecutor>,
    /// The step's task table.
    pub table: Arc<dyn TaskTable>,
}

/// Capability set implemented by each concrete tasked step kind.
///
/// The engine loop operates only against this interface; a step kind never
/// touches the control flow, the counters or the state machine.
#[async_trait]
pub trait TaskedStepSpec: Send + Sync {
    /// Stable kind label used for metrics and logs.
    fn kind(&self) -> &'static str;

    /// Human-readable description of the step.
    fn description(&self, config: &StepConfig) -> String;

    /// The output sets this step kind produces.
    fn output_sets(&self) -> Vec<OutputSet>;

    /// Validates step-kind-specific preconditions.
    async fn validate(&self, ctx: &StepContext) -> Result<()>;

    /// Determines the fan-out used for the initial dispatch.
    async fn initial_thread_count(&self, ctx: &StepContext) -> Result<u32>;

    /// Materializes every task row of the step and returns the count.
    async fn create_task_items(&self, ctx: &StepContext) -> Result<u32>;

    /// Builds the query executed asynchronously for one task.
    async fn build_task_query(
        &self,
        ctx: &StepContext,
        task_id: i64,
        data: &TaskData,
    ) -> Result<SqlQuery>;

    /// Registers step-kind-specific outputs once every task is finalized.
    async fn on_complete(&self, _ctx: &StepContext) -> Result<Vec<RegisteredOutput>> {
        Ok(Vec::new())
    }
}

/// Durable mirror of the engine's transient counters.
///
/// Persisted by the job manager with the step's static state and restored
/// on crash-resume so resumed runs never recompute (and never overwrite)
/// the fan-out or the compute-unit claim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    /// Execution state at snapshot time.
    pub state: StepState,
    /// The fan-out determined on first execute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_thread_count: Option<u32>,
    /// The number of task rows created on first execute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_item_count: Option<u32>,
    /// The memoized compute-unit claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_needed_acus: Option<f64>,
    /// Last reported progress fraction.
    pub estimated_progress: f32,
}

/// The control loop for one tasked step.
pub struct StepEngine<S> {
    step_id: StepId,
    schema: String,
    config: StepConfig,
    spec: S,
    state: StepState,
    last_transition_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
    calculated_thread_count: Option<u32>,
    task_item_count: Option<u32>,
    estimated_progress: f32,
    estimator: ResourceEstimator,
    table: Arc<dyn TaskTable>,
    executor: Arc<dyn QueryExecutor>,
    hub: Arc<dyn HubClient>,
    files: Option<Arc<dyn ExportedFilesProvider>>,
    outputs: Vec<RegisteredOutput>,
    metrics: EngineMetrics,
}

impl<S: TaskedStepSpec> StepEngine<S> {
    /// Creates an engine for a step in `NEW` state.
    #[must_use]
    pub fn new(
        step_id: StepId,
        schema: impl Into<String>,
        config: StepConfig,
        spec: S,
        table: Arc<dyn TaskTable>,
        executor: Arc<dyn QueryExecutor>,
        hub: Arc<dyn HubClient>,
    ) -> Self {
        let metrics = EngineMetrics::new(spec.kind());
        Self {
            step_id,
            schema: schema.into(),
            config,
            spec,
            state: StepState::New,
            last_transition_at: None,
            cancel_requested: false,
            calculated_thread_count: None,
            task_item_count: None,
            estimated_progress: 0.0,
            estimator: ResourceEstimator::new(),
            table,
            executor,
            hub,
            files: None,
            outputs: Vec::new(),
            metrics,
        }
    }

    /// Attaches the provider of exported-file download URLs.
    #[must_use]
    pub fn with_files_provider(mut self, files: Arc<dyn ExportedFilesProvider>) -> Self {
        self.files = Some(files);
        self
    }

    /// Restores the engine from a persisted snapshot (crash-resume path).
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: StepSnapshot) -> Self {
        self.state = snapshot.state;
        self.calculated_thread_count = snapshot.calculated_thread_count;
        self.task_item_count = snapshot.task_item_count;
        self.estimated_progress = snapshot.estimated_progress;
        if let Some(acus) = snapshot.overall_needed_acus {
            self.estimator = ResourceEstimator::restore(acus);
        }
        self
    }

    /// Returns a persistable snapshot of the engine's counters.
    #[must_use]
    pub fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            state: self.state,
            calculated_thread_count: self.calculated_thread_count,
            task_item_count: self.task_item_count,
            overall_needed_acus: self.estimator.overall_needed_acus(),
            estimated_progress: self.estimated_progress,
        }
    }

    /// Current execution state.
    #[must_use]
    pub const fn state(&self) -> StepState {
        self.state
    }

    /// When the step last changed state.
    #[must_use]
    pub const fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        self.last_transition_at
    }

    /// The step's configuration.
    #[must_use]
    pub const fn config(&self) -> &StepConfig {
        &self.config
    }

    /// Last reported progress fraction in `[0, 1]`.
    #[must_use]
    pub const fn estimated_progress(&self) -> f32 {
        self.estimated_progress
    }

    /// The fan-out determined on first execute.
    #[must_use]
    pub const fn calculated_thread_count(&self) -> Option<u32> {
        self.calculated_thread_count
    }

    /// Outputs registered at completion.
    #[must_use]
    pub fn outputs(&self) -> &[RegisteredOutput] {
        &self.outputs
    }

    /// Human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        self.spec.description(&self.config)
    }

    /// Requests cooperative cancellation.
    ///
    /// The engine stops dispatching new tasks; in-flight queries are not
    /// aborted, their progress events are recorded and discarded.
    pub fn cancel(&mut self) {
        tracing::info!(step_id = %self.step_id, "cancellation requested");
        self.cancel_requested = true;
    }

    fn context(&self) -> StepContext {
        StepContext {
            step_id: self.step_id,
            schema: self.schema.clone(),
            config: self.config.clone(),
            hub: Arc::clone(&self.hub),
            executor: Arc::clone(&self.executor),
            table: Arc::clone(&self.table),
        }
    }

    fn transition_to(&mut self, target: StepState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "step lifecycle violation".to_string(),
            });
        }
        tracing::info!(step_id = %self.step_id, from = %self.state, to = %target, "step state transition");
        self.state = target;
        self.last_transition_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the step failed unless the error is retryable by the outer
    /// scheduler.
    fn fail_on(&mut self, err: Error) -> Error {
        if !err.is_retryable() && !self.state.is_terminal() {
            tracing::error!(step_id = %self.step_id, error = %err, "step failed");
            self.state = StepState::Failed;
            self.last_transition_at = Some(Utc::now());
        }
        err
    }

    /// Validates the step's inputs.
    ///
    /// # Errors
    ///
    /// Returns a validation error if any precondition is violated. The
    /// step's state is not changed.
    pub async fn validate(&self) -> Result<()> {
        self.spec.validate(&self.context()).await
    }

    /// Resolves the version ref and moves the step to `PREPARED`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the version ref cannot be resolved;
    /// the step moves to `FAILED`.
    #[tracing::instrument(skip(self), fields(step_id = %self.step_id))]
    pub async fn prepare(&mut self, owner: &str) -> Result<()> {
        match self.prepare_inner().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_on(err)),
        }
    }

    async fn prepare_inner(&mut self) -> Result<()> {
        if self.state != StepState::New {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: StepState::Prepared.to_string(),
                reason: "prepare is only valid on a new step".to_string(),
            });
        }

        let resolved = match &self.config.version_ref {
            VersionRef::Tag(tag) => {
                let version = self
                    .hub
                    .resolve_tag(&self.config.space_id, tag)
                    .await
                    .map_err(|e| resolve_failure(&self.config.version_ref, e))?;
                Some(VersionRef::Version(version))
            }
            VersionRef::Head => {
                let statistics = self
                    .hub
                    .statistics(&self.config.space_id, self.config.context)
                    .await
                    .map_err(|e| resolve_failure(&self.config.version_ref, e))?;
                Some(VersionRef::Version(statistics.max_version))
            }
            VersionRef::Version(_) | VersionRef::Range { .. } => None,
        };

        if let Some(resolved) = resolved {
            tracing::info!(step_id = %self.step_id, from = %self.config.version_ref, to = %resolved, "resolved version ref");
            self.config.version_ref = resolved;
        }

        self.transition_to(StepState::Prepared)
    }

    /// Returns the step's shared-resource claims, computing and caching the
    /// compute-unit figure on first call.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the statistics service is unreachable.
    pub async fn needed_resources(&mut self) -> Result<Vec<Load>> {
        let statistics = self
            .hub
            .statistics(&self.config.space_id, self.config.context)
            .await
            .map_err(Error::from)?;
        Ok(self.estimator.loads(&statistics))
    }

    /// Executes the step.
    ///
    /// With `resume = false` the fan-out is determined, the task table
    /// created and every task row inserted before the initial batch is
    /// dispatched. With `resume = true` (crash recovery from `RUNNING`)
    /// the table is left untouched and only unstarted rows are dispatched:
    /// rows already started but not finalized stay with the database,
    /// which owes exactly one completion event per started task.
    ///
    /// Returns true if the step completed without dispatching anything
    /// (empty task set).
    ///
    /// # Errors
    ///
    /// Returns an error if planning or dispatch fails; unless retryable,
    /// the step moves to `FAILED`.
    #[tracing::instrument(skip(self), fields(step_id = %self.step_id, resume))]
    pub async fn execute(&mut self, resume: bool) -> Result<bool> {
        match self.execute_inner(resume).await {
            Ok(completed) => Ok(completed),
            Err(err) => Err(self.fail_on(err)),
        }
    }

    async fn execute_inner(&mut self, resume: bool) -> Result<bool> {
        if resume {
            if self.state != StepState::Running {
                return Err(Error::InvalidStateTransition {
                    from: self.state.to_string(),
                    to: StepState::Running.to_string(),
                    reason: "resume is only valid on a running step".to_string(),
                });
            }
        } else {
            let ctx = self.context();
            let thread_count = self.spec.initial_thread_count(&ctx).await?;
            self.calculated_thread_count = Some(thread_count);

            self.table.create().await?;
            let created = self.spec.create_task_items(&ctx).await?;
            self.task_item_count = Some(created);
            tracing::info!(step_id = %self.step_id, thread_count, task_items = created, "created task table");

            self.transition_to(StepState::Running)?;
        }

        self.ensure_acus().await?;
        if let Some(progress) = self.start_initial_tasks().await? {
            if progress.is_complete() {
                self.complete().await?;
                return Ok(true);
            }
            self.record_progress_metrics(&progress);
        }
        Ok(false)
    }

    /// Handles one asynchronous progress event from the database.
    ///
    /// Records the reported statistics, starts at most one replacement
    /// task, and returns true once every task row is finalized.
    ///
    /// # Errors
    ///
    /// Returns an error if recording or dispatch fails; unless retryable,
    /// the step moves to `FAILED`. Anomalous deliveries (unknown or
    /// already-finalized task ids, events outside `RUNNING`) are logged
    /// and dropped, never an error.
    #[tracing::instrument(skip(self, update), fields(step_id = %self.step_id, task_id = update.task_id))]
    pub async fn on_async_update(&mut self, update: TaskUpdate) -> Result<bool> {
        match self.on_async_update_inner(update).await {
            Ok(complete) => Ok(complete),
            Err(err) => Err(self.fail_on(err)),
        }
    }

    async fn on_async_update_inner(&mut self, update: TaskUpdate) -> Result<bool> {
        if self.state != StepState::Running {
            tracing::warn!(
                step_id = %self.step_id,
                task_id = update.task_id,
                state = %self.state,
                "dropping progress event outside RUNNING"
            );
            self.metrics.record_delivery_anomaly();
            return Ok(false);
        }

        let outcome = self
            .table
            .record_progress(
                update.task_id,
                update.byte_count,
                update.feature_count,
                update.file_count,
                true,
            )
            .await?;
        match outcome {
            RecordOutcome::Applied => self.metrics.record_completion(),
            RecordOutcome::AlreadyFinalized | RecordOutcome::UnknownTask => {
                tracing::warn!(
                    step_id = %self.step_id,
                    task_id = update.task_id,
                    ?outcome,
                    "dropping anomalous progress event"
                );
                self.metrics.record_delivery_anomaly();
                return Ok(false);
            }
        }
        tracing::info!(step_id = %self.step_id, task_id = update.task_id, features = update.feature_count, "received progress update");

        if self.cancel_requested {
            // The pick would hand out a row nothing will ever run.
            tracing::info!(step_id = %self.step_id, "cancelled; discarding progress without replacement dispatch");
            return Ok(false);
        }

        let progress = self.pick_next().await?;
        if progress.is_complete() {
            self.complete().await?;
            return Ok(true);
        }

        if let Some(next) = &progress.next {
            self.start_task(next).await?;
        }
        self.record_progress_metrics(&progress);
        Ok(false)
    }

    /// Dispatches up to `calculated_thread_count` initial tasks and returns
    /// the last observed progress.
    ///
    /// Every picked row is dispatched before the next pick, so no row is
    /// ever marked started without a query in flight.
    async fn start_initial_tasks(&mut self) -> Result<Option<crate::task_table::TaskProgress>> {
        let thread_count = self.calculated_thread_count.unwrap_or(0);
        let mut progress = None;
        for _ in 0..thread_count {
            if self.cancel_requested {
                break;
            }
            let picked = self.pick_next().await?;
            let next = picked.next.clone();
            progress = Some(picked);
            match next {
                Some(next) => self.start_task(&next).await?,
                None => break,
            }
        }
        Ok(progress)
    }

    async fn pick_next(&mut self) -> Result<crate::task_table::TaskProgress> {
        let started_at = Instant::now();
        let progress = self.table.pick_next_and_report().await?;
        self.metrics.observe_pick_next(started_at);
        // A resumed engine learns the task count from the table.
        if self.task_item_count.is_none() {
            self.task_item_count = Some(progress.total);
        }
        Ok(progress)
    }

    async fn start_task(&mut self, next: &NextTask) -> Result<()> {
        let ctx = self.context();
        let query = self.spec.build_task_query(&ctx, next.task_id, &next.data).await?;

        let total = self.task_item_count.unwrap_or(1).max(1);
        let acus = self.estimator.overall_needed_acus().unwrap_or(0.0);
        let acu_share = acus / f64::from(total);

        tracing::info!(step_id = %self.step_id, task_id = next.task_id, acu_share, "starting export task");
        self.executor
            .dispatch_async(next.task_id, &query, acu_share)
            .await?;
        self.metrics.record_dispatch();
        Ok(())
    }

    async fn ensure_acus(&mut self) -> Result<()> {
        if self.estimator.overall_needed_acus().is_none() {
            self.needed_resources().await?;
        }
        Ok(())
    }

    fn record_progress_metrics(&mut self, progress: &crate::task_table::TaskProgress) {
        self.estimated_progress = progress.fraction();
        self.metrics.set_step_progress(self.estimated_progress);
        self.metrics
            .set_tasks_in_flight(progress.started.saturating_sub(progress.finalized));
    }

    async fn complete(&mut self) -> Result<()> {
        let aggregate = self.table.aggregate().await?;
        let statistics = FileStatistics::default()
            .with_rows_uploaded(aggregate.rows_uploaded)
            .with_bytes_uploaded(aggregate.bytes_uploaded)
            .with_files_uploaded(aggregate.files_uploaded);

        self.outputs.push(RegisteredOutput {
            set: STATISTICS.to_string(),
            visibility: Visibility::User,
            payload: OutputPayload::Statistics(statistics),
        });
        self.outputs.push(RegisteredOutput {
            set: INTERNAL_STATISTICS.to_string(),
            visibility: Visibility::System,
            payload: OutputPayload::Statistics(statistics),
        });

        if let Some(files) = &self.files {
            let urls = files.exported_files(self.step_id).await?;
            self.outputs.push(RegisteredOutput {
                set: EXPORTED_DATA.to_string(),
                visibility: Visibility::User,
                payload: OutputPayload::ExportedData(urls),
            });
        }

        let ctx = self.context();
        let extra = self.spec.on_complete(&ctx).await?;
        self.outputs.extend(extra);

        self.estimated_progress = 1.0;
        self.metrics.set_step_progress(1.0);
        self.metrics.set_tasks_in_flight(0);
        self.transition_to(StepState::Completed)?;
        tracing::info!(step_id = %self.step_id, ?aggregate, "step completed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test-support constructors shared by the crate's unit tests.

    use super::StepContext;
    use std::sync::Arc;

    use tessera_core::{SpaceId, StepId};

    use crate::config::StepConfig;
    use crate::executor::ScriptedExecutor;
    use crate::hub::InMemoryHub;
    use crate::task_table::memory::InMemoryTaskTable;
    use crate::version_ref::VersionRef;

    /// A context over empty in-memory collaborators.
    pub(crate) fn context() -> StepContext {
        StepContext {
            step_id: StepId::generate(),
            schema: "export".into(),
            config: StepConfig::new(
                SpaceId::new("test-space").expect("valid"),
                VersionRef::Version(1),
            ),
            hub: Arc::new(InMemoryHub::new()),
            executor: Arc::new(ScriptedExecutor::new()),
            table: Arc::new(InMemoryTaskTable::new()),
        }
    }
}

fn resolve_failure(version_ref: &VersionRef, err: HubError) -> Error {
    match err {
        HubError::Deactivated { .. } => err.into(),
        other => Error::validation_with_source(
            format!("unable to resolve the provided version \"{version_ref}\""),
            other,
        ),
    }
}
