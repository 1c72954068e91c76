//! Core workflow queue types and the job state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use workflowq_core::{DomainError, LogEntryId, WorkflowId};

use crate::error::StoreError;
use crate::retry::RetryPolicy;

/// Intervention reason recorded when a job runs out of retries.
pub const MAX_RETRIES_EXCEEDED: &str = "Maximum retry attempts exceeded";

/// Dispatch priority. Declaration order is dispatch order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Sort rank: urgent = 1 ... low = 4.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(DomainError::validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Job lifecycle status.
///
/// ```text
/// pending ──► in_progress ──► completed
///    │  ▲          │
///    │  └─ failed ◄┘   (failed → pending only when retryable and due)
///    └──────┴──────────► canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a dispatcher and executing
    InProgress,
    /// Completed successfully
    Completed,
    /// Failed; re-armed later unless flagged for intervention
    Failed,
    /// Cancelled by an operator
    Canceled,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 5] = [
        WorkflowStatus::Pending,
        WorkflowStatus::InProgress,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Canceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Canceled => "canceled",
        }
    }

    /// Absorbing states: nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Canceled)
    }

    /// Structural edges of the state machine. Job-level guards (back-off,
    /// intervention flag) are checked in [`WorkflowJob::apply_transition`].
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Canceled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Canceled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown workflow status: {s}")))
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub workflow_type: String,
    pub company_id: Option<String>,
    pub deal_id: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub input_data: JsonValue,
    pub priority: Priority,
    pub assigned_agent: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Overrides the store's default `max_retries`.
    pub max_retries: Option<u32>,
}

impl NewWorkflow {
    pub fn new(workflow_type: impl Into<String>, input_data: JsonValue) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            company_id: None,
            deal_id: None,
            payment_transaction_id: None,
            input_data,
            priority: Priority::default(),
            assigned_agent: None,
            scheduled_for: None,
            max_retries: None,
        }
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_deal(mut self, deal_id: impl Into<String>) -> Self {
        self.deal_id = Some(deal_id.into());
        self
    }

    pub fn with_payment_transaction(mut self, id: impl Into<String>) -> Self {
        self.payment_transaction_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_assigned_agent(mut self, agent: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent.into());
        self
    }

    /// Keep the job ineligible until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Optional data carried by a status update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub requires_intervention: bool,
    pub intervention_reason: Option<String>,
}

impl StatusUpdate {
    pub fn completed(output: JsonValue) -> Self {
        Self {
            output_data: Some(output),
            ..Default::default()
        }
    }

    /// Transient failure: retried with back-off while retries remain.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    /// Terminal failure waiting for an operator.
    pub fn intervention(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            requires_intervention: true,
            intervention_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

/// A queued unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: WorkflowId,
    pub workflow_type: String,
    pub priority: Priority,
    pub status: WorkflowStatus,
    pub company_id: Option<String>,
    pub deal_id: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub input_data: JsonValue,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub assigned_agent: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub requires_human_intervention: bool,
    pub intervention_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowJob {
    /// Materialize an enqueue request as a fresh `pending` job.
    pub fn from_request(
        id: WorkflowId,
        request: NewWorkflow,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_type: request.workflow_type,
            priority: request.priority,
            status: WorkflowStatus::Pending,
            company_id: request.company_id,
            deal_id: request.deal_id,
            payment_transaction_id: request.payment_transaction_id,
            input_data: request.input_data,
            output_data: None,
            error_message: None,
            assigned_agent: request.assigned_agent,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            requires_human_intervention: false,
            intervention_reason: None,
            created_at: now,
            scheduled_for: request.scheduled_for,
            started_at: None,
            completed_at: None,
            failed_at: None,
            next_retry_at: None,
            updated_at: now,
        }
    }

    /// Pending and not scheduled into the future.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Pending && self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// Failed transiently and its back-off has elapsed.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Failed
            && !self.requires_human_intervention
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Whether another transient failure may still be retried.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Apply a lifecycle transition, stamping timestamps and doing retry
    /// bookkeeping. On error the job is left untouched.
    pub fn apply_transition(
        &mut self,
        to: WorkflowStatus,
        update: StatusUpdate,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<(), StoreError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            let reason = if from.is_terminal() {
                "state is terminal"
            } else {
                "not a lifecycle edge"
            };
            return Err(StoreError::invalid_transition(self.id, from, to, reason));
        }

        match to {
            WorkflowStatus::Pending => {
                if self.requires_human_intervention {
                    return Err(StoreError::invalid_transition(
                        self.id,
                        from,
                        to,
                        "job is waiting for human intervention",
                    ));
                }
                if !self.is_retry_due(now) {
                    return Err(StoreError::invalid_transition(
                        self.id,
                        from,
                        to,
                        "retry back-off has not elapsed",
                    ));
                }
            }
            WorkflowStatus::InProgress => {
                self.started_at = Some(now);
            }
            WorkflowStatus::Completed => {
                self.completed_at = Some(now);
                if let Some(output) = update.output_data {
                    self.output_data = Some(output);
                }
            }
            WorkflowStatus::Failed => {
                self.failed_at = Some(now);
                if let Some(error) = update.error_message {
                    self.error_message = Some(error);
                }

                let exhausted = !self.has_retries_left();
                if update.requires_intervention || exhausted {
                    self.requires_human_intervention = true;
                    self.intervention_reason = update
                        .intervention_reason
                        .or_else(|| exhausted.then(|| MAX_RETRIES_EXCEEDED.to_string()))
                        .or_else(|| self.error_message.clone());
                    self.next_retry_at = None;
                } else {
                    self.next_retry_at = Some(now + policy.backoff(self.retry_count + 1));
                    self.retry_count += 1;
                }
            }
            WorkflowStatus::Canceled => {
                if let Some(reason) = update.error_message {
                    self.error_message = Some(reason);
                }
            }
        }

        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Status of one execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(DomainError::validation(format!("unknown step status: {other}"))),
        }
    }
}

/// A step to append to a job's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub step_name: String,
    pub step_order: u32,
    pub status: StepStatus,
    pub input_data: Option<JsonValue>,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl NewLogEntry {
    pub fn new(step_name: impl Into<String>, step_order: u32, status: StepStatus) -> Self {
        Self {
            step_name: step_name.into(),
            step_order,
            status,
            input_data: None,
            output_data: None,
            error_message: None,
            duration_ms: 0,
        }
    }

    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input_data = Some(input);
        self
    }

    pub fn with_output(mut self, output: JsonValue) -> Self {
        self.output_data = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Immutable audit row describing one execution step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: LogEntryId,
    pub workflow_id: WorkflowId,
    pub step_name: String,
    pub step_order: u32,
    pub status: StepStatus,
    pub input_data: Option<JsonValue>,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set only for `completed` steps.
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl ExecutionLogEntry {
    pub fn from_request(
        id: LogEntryId,
        workflow_id: WorkflowId,
        entry: NewLogEntry,
        now: DateTime<Utc>,
    ) -> Self {
        let completed_at = (entry.status == StepStatus::Completed).then_some(now);
        Self {
            id,
            workflow_id,
            step_name: entry.step_name,
            step_order: entry.step_order,
            status: entry.status,
            input_data: entry.input_data,
            output_data: entry.output_data,
            error_message: entry.error_message,
            started_at: now,
            completed_at,
            duration_ms: entry.duration_ms,
        }
    }
}

/// Job count for one (status, workflow_type) group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTypeCount {
    pub status: WorkflowStatus,
    pub workflow_type: String,
    pub count: u64,
}

/// Queue counts grouped by status and workflow type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub counts: Vec<StatusTypeCount>,
}

impl QueueStats {
    /// Build from unordered group counts; groups are sorted by status then type.
    pub fn from_counts(mut counts: Vec<StatusTypeCount>) -> Self {
        counts.sort_by(|a, b| {
            a.status
                .cmp(&b.status)
                .then_with(|| a.workflow_type.cmp(&b.workflow_type))
        });
        Self { counts }
    }

    pub fn count(&self, status: WorkflowStatus, workflow_type: &str) -> u64 {
        self.counts
            .iter()
            .find(|c| c.status == status && c.workflow_type == workflow_type)
            .map_or(0, |c| c.count)
    }

    pub fn by_status(&self) -> BTreeMap<WorkflowStatus, u64> {
        let mut out = BTreeMap::new();
        for c in &self.counts {
            *out.entry(c.status).or_insert(0) += c.count;
        }
        out
    }

    pub fn by_type(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for c in &self.counts {
            *out.entry(c.workflow_type.clone()).or_insert(0) += c.count;
        }
        out
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.count).sum()
    }
}
