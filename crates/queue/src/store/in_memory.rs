//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use workflowq_core::{Clock, LogEntryId, SystemClock, WorkflowId};

use super::WorkflowStore;
use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::types::{
    ExecutionLogEntry, NewLogEntry, NewWorkflow, QueueStats, StatusTypeCount, StatusUpdate,
    WorkflowJob, WorkflowStatus,
};

#[derive(Debug, Clone)]
struct StoredJob {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    job: WorkflowJob,
}

#[derive(Debug, Clone)]
struct StoredLog {
    seq: u64,
    entry: ExecutionLogEntry,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<WorkflowId, StoredJob>,
    logs: HashMap<WorkflowId, Vec<StoredLog>>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// In-memory job store.
///
/// A single `RwLock` guards all jobs and logs, so every transition is atomic
/// with respect to concurrent readers.
#[derive(Debug)]
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::storage("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::storage("in-memory store lock poisoned"))
    }

    fn transition(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        update: StatusUpdate,
    ) -> Result<WorkflowJob, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let stored = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the row untouched.
        let mut job = stored.job.clone();
        job.apply_transition(status, update, now, &self.retry_policy)?;
        stored.job = job.clone();
        Ok(job)
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Newest first, ties broken by most recent insertion.
fn newest_first(jobs: &mut [&StoredJob]) {
    jobs.sort_by(|a, b| {
        b.job
            .created_at
            .cmp(&a.job.created_at)
            .then_with(|| b.seq.cmp(&a.seq))
    });
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn enqueue(&self, request: NewWorkflow) -> Result<WorkflowId, StoreError> {
        let now = self.clock.now();
        let id = WorkflowId::new();
        let job = WorkflowJob::from_request(id, request, self.retry_policy.max_retries, now);

        let mut state = self.write()?;
        let seq = state.bump();
        state.jobs.insert(id, StoredJob { seq, job });

        tracing::debug!(workflow_id = %id, "workflow enqueued");
        Ok(id)
    }

    async fn get(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError> {
        let state = self.read()?;
        Ok(state.jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<WorkflowJob>, StoreError> {
        let now = self.clock.now();
        let state = self.read()?;

        let mut candidates: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| s.job.is_eligible(now))
            .collect();

        candidates.sort_by(|a, b| {
            a.job
                .priority
                .rank()
                .cmp(&b.job.priority.rank())
                .then_with(|| a.job.created_at.cmp(&b.job.created_at))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn claim(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let stored = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if stored.job.status != WorkflowStatus::Pending {
            return Ok(None);
        }

        stored.job.apply_transition(
            WorkflowStatus::InProgress,
            StatusUpdate::default(),
            now,
            &self.retry_policy,
        )?;
        Ok(Some(stored.job.clone()))
    }

    async fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        update: StatusUpdate,
    ) -> Result<WorkflowJob, StoreError> {
        self.transition(id, status, update)
    }

    async fn rearm_due_retries(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let mut rearmed = Vec::new();
        for stored in state.jobs.values_mut() {
            if stored.job.is_retry_due(now) {
                stored.job.apply_transition(
                    WorkflowStatus::Pending,
                    StatusUpdate::default(),
                    now,
                    &self.retry_policy,
                )?;
                rearmed.push((stored.seq, stored.job.id));
            }
        }

        rearmed.sort();
        Ok(rearmed.into_iter().map(|(_, id)| id).collect())
    }

    async fn get_by_status(
        &self,
        status: WorkflowStatus,
        limit: usize,
    ) -> Result<Vec<WorkflowJob>, StoreError> {
        let state = self.read()?;
        let mut jobs: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| s.job.status == status)
            .collect();

        newest_first(&mut jobs);
        Ok(jobs.into_iter().take(limit).map(|s| s.job.clone()).collect())
    }

    async fn get_intervention_required(&self) -> Result<Vec<WorkflowJob>, StoreError> {
        let state = self.read()?;
        let mut jobs: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| {
                s.job.requires_human_intervention && s.job.status != WorkflowStatus::Completed
            })
            .collect();

        newest_first(&mut jobs);
        Ok(jobs.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn log_execution_step(
        &self,
        id: WorkflowId,
        entry: NewLogEntry,
    ) -> Result<LogEntryId, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;
        if !state.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }

        let log_id = LogEntryId::new();
        let seq = state.bump();
        state.logs.entry(id).or_default().push(StoredLog {
            seq,
            entry: ExecutionLogEntry::from_request(log_id, id, entry, now),
        });
        Ok(log_id)
    }

    async fn get_execution_history(
        &self,
        id: WorkflowId,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<&StoredLog> = state
            .logs
            .get(&id)
            .map(|logs| logs.iter().collect())
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            a.entry
                .step_order
                .cmp(&b.entry.step_order)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(rows.into_iter().map(|r| r.entry.clone()).collect())
    }

    async fn get_queue_stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.read()?;
        let mut groups: HashMap<(WorkflowStatus, String), u64> = HashMap::new();
        for stored in state.jobs.values() {
            *groups
                .entry((stored.job.status, stored.job.workflow_type.clone()))
                .or_insert(0) += 1;
        }

        Ok(QueueStats::from_counts(
            groups
                .into_iter()
                .map(|((status, workflow_type), count)| StatusTypeCount {
                    status,
                    workflow_type,
                    count,
                })
                .collect(),
        ))
    }

    async fn cancel(
        &self,
        id: WorkflowId,
        reason: Option<String>,
    ) -> Result<WorkflowJob, StoreError> {
        let update = StatusUpdate {
            error_message: reason,
            ..Default::default()
        };
        self.transition(id, WorkflowStatus::Canceled, update)
    }
}
