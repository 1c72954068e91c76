//! Job store boundary.
//!
//! The store is the single source of truth for queued work. It owns every
//! job row and performs all state transitions; the dispatcher only ever
//! changes a job through `claim`, `update_status`, `rearm_due_retries` and
//! `cancel`.
//!
//! Retry schedules live in `next_retry_at`, so failed jobs are re-armed after
//! a restart. Jobs that were `in_progress` when the process stopped are not
//! recovered automatically.

pub mod in_memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use workflowq_core::{LogEntryId, WorkflowId};

use crate::error::StoreError;
use crate::types::{
    ExecutionLogEntry, NewLogEntry, NewWorkflow, QueueStats, StatusUpdate, WorkflowJob,
    WorkflowStatus,
};

pub use in_memory::InMemoryWorkflowStore;
pub use sqlite::SqliteWorkflowStore;

/// Typed repository over workflow jobs and their execution logs.
///
/// Implementations must make `claim`, `update_status`, `rearm_due_retries`
/// and `cancel` atomic with respect to concurrent readers and writers.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new `pending` job.
    async fn enqueue(&self, request: NewWorkflow) -> Result<WorkflowId, StoreError>;

    /// Load a job by ID.
    async fn get(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError>;

    /// Jobs eligible for dispatch, ordered by priority rank then FIFO.
    ///
    /// Read-only: two calls without intervening writes return the same list.
    async fn get_pending(&self, limit: usize) -> Result<Vec<WorkflowJob>, StoreError>;

    /// Atomically move a job from `pending` to `in_progress`.
    ///
    /// Returns `None` when the job is no longer pending (another claimant won,
    /// or it was cancelled).
    async fn claim(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError>;

    /// Apply a full state transition and return the updated job.
    async fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        update: StatusUpdate,
    ) -> Result<WorkflowJob, StoreError>;

    /// Move every retryable failed job whose back-off has elapsed back to `pending`.
    async fn rearm_due_retries(&self) -> Result<Vec<WorkflowId>, StoreError>;

    /// Jobs with `status`, newest first.
    async fn get_by_status(
        &self,
        status: WorkflowStatus,
        limit: usize,
    ) -> Result<Vec<WorkflowJob>, StoreError>;

    /// Jobs flagged for a human that have not completed, newest first.
    async fn get_intervention_required(&self) -> Result<Vec<WorkflowJob>, StoreError>;

    /// Append one immutable execution-log row.
    async fn log_execution_step(
        &self,
        id: WorkflowId,
        entry: NewLogEntry,
    ) -> Result<LogEntryId, StoreError>;

    /// Execution log of a job, ordered by `step_order` then insertion.
    async fn get_execution_history(
        &self,
        id: WorkflowId,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError>;

    /// Counts grouped by (status, workflow_type).
    async fn get_queue_stats(&self) -> Result<QueueStats, StoreError>;

    /// Cancel a `pending` or `in_progress` job. Does not interrupt a running handler.
    async fn cancel(
        &self,
        id: WorkflowId,
        reason: Option<String>,
    ) -> Result<WorkflowJob, StoreError>;
}

#[async_trait]
impl<S> WorkflowStore for Arc<S>
where
    S: WorkflowStore + ?Sized,
{
    async fn enqueue(&self, request: NewWorkflow) -> Result<WorkflowId, StoreError> {
        (**self).enqueue(request).await
    }

    async fn get(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError> {
        (**self).get(id).await
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<WorkflowJob>, StoreError> {
        (**self).get_pending(limit).await
    }

    async fn claim(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError> {
        (**self).claim(id).await
    }

    async fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        update: StatusUpdate,
    ) -> Result<WorkflowJob, StoreError> {
        (**self).update_status(id, status, update).await
    }

    async fn rearm_due_retries(&self) -> Result<Vec<WorkflowId>, StoreError> {
        (**self).rearm_due_retries().await
    }

    async fn get_by_status(
        &self,
        status: WorkflowStatus,
        limit: usize,
    ) -> Result<Vec<WorkflowJob>, StoreError> {
        (**self).get_by_status(status, limit).await
    }

    async fn get_intervention_required(&self) -> Result<Vec<WorkflowJob>, StoreError> {
        (**self).get_intervention_required().await
    }

    async fn log_execution_step(
        &self,
        id: WorkflowId,
        entry: NewLogEntry,
    ) -> Result<LogEntryId, StoreError> {
        (**self).log_execution_step(id, entry).await
    }

    async fn get_execution_history(
        &self,
        id: WorkflowId,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        (**self).get_execution_history(id).await
    }

    async fn get_queue_stats(&self) -> Result<QueueStats, StoreError> {
        (**self).get_queue_stats().await
    }

    async fn cancel(
        &self,
        id: WorkflowId,
        reason: Option<String>,
    ) -> Result<WorkflowJob, StoreError> {
        (**self).cancel(id, reason).await
    }
}
