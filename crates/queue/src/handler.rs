//! Task handlers and the registry that routes jobs to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::OnceCell;

use workflowq_core::{LogEntryId, WorkflowId};

use crate::error::StoreError;
use crate::store::WorkflowStore;
use crate::types::{NewLogEntry, StepStatus, WorkflowJob};

/// Error raised by a task handler.
///
/// The message is what the dispatcher inspects for intervention markers and
/// what ends up in the job's `error_message`.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Ordinary failure; retried unless the message carries an intervention marker.
    #[error("{0}")]
    Failed(String),

    /// The handler knows a human has to step in.
    #[error("{0}")]
    Intervention(String),

    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn intervention(msg: impl Into<String>) -> Self {
        Self::Intervention(msg.into())
    }
}

impl From<StoreError> for HandlerError {
    fn from(value: StoreError) -> Self {
        Self::Failed(value.to_string())
    }
}

/// Appends execution-log rows for the job being handled.
///
/// Step orders are assigned in call order, continuing after the highest order
/// already logged for the job, so a retry's steps sort after the earlier
/// attempt's.
#[derive(Clone)]
pub struct StepRecorder {
    workflow_id: WorkflowId,
    store: Arc<dyn WorkflowStore>,
    next_order: Arc<OnceCell<AtomicU32>>,
}

impl std::fmt::Debug for StepRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRecorder")
            .field("workflow_id", &self.workflow_id)
            .field(
                "next_order",
                &self.next_order.get().map(|n| n.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

impl StepRecorder {
    pub fn new(workflow_id: WorkflowId, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            workflow_id,
            store,
            next_order: Arc::new(OnceCell::new()),
        }
    }

    async fn next_order(&self) -> Result<u32, StoreError> {
        let counter = self
            .next_order
            .get_or_try_init(|| async {
                let last = self
                    .store
                    .get_execution_history(self.workflow_id)
                    .await?
                    .iter()
                    .map(|e| e.step_order)
                    .max()
                    .unwrap_or(0);
                Ok::<_, StoreError>(AtomicU32::new(last + 1))
            })
            .await?;
        Ok(counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a raw log row.
    pub async fn record(&self, entry: NewLogEntry) -> Result<LogEntryId, StoreError> {
        self.store.log_execution_step(self.workflow_id, entry).await
    }

    /// Log a `started` row for a new step and return a handle that closes it.
    pub async fn begin(
        &self,
        name: impl Into<String>,
        input: Option<JsonValue>,
    ) -> Result<Step<'_>, StoreError> {
        let name = name.into();
        let order = self.next_order().await?;

        let mut entry = NewLogEntry::new(name.clone(), order, StepStatus::Started);
        entry.input_data = input;
        self.record(entry).await?;

        Ok(Step {
            recorder: self,
            name,
            order,
            started: Instant::now(),
        })
    }

    /// Log a step that was deliberately not run.
    pub async fn skip(&self, name: impl Into<String>) -> Result<LogEntryId, StoreError> {
        let order = self.next_order().await?;
        self.record(NewLogEntry::new(name, order, StepStatus::Skipped))
            .await
    }
}

/// An open step; finish it with [`complete`](Step::complete) or [`fail`](Step::fail).
#[derive(Debug)]
pub struct Step<'a> {
    recorder: &'a StepRecorder,
    name: String,
    order: u32,
    started: Instant,
}

impl Step<'_> {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub async fn complete(self, output: Option<JsonValue>) -> Result<LogEntryId, StoreError> {
        let mut entry = NewLogEntry::new(self.name.clone(), self.order, StepStatus::Completed)
            .with_duration_ms(self.elapsed_ms());
        entry.output_data = output;
        self.recorder.record(entry).await
    }

    pub async fn fail(self, error: impl Into<String>) -> Result<LogEntryId, StoreError> {
        let entry = NewLogEntry::new(self.name.clone(), self.order, StepStatus::Failed)
            .with_error(error)
            .with_duration_ms(self.elapsed_ms());
        self.recorder.record(entry).await
    }
}

/// What a handler sees of the job it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: WorkflowId,
    pub workflow_type: String,
    pub company_id: Option<String>,
    pub deal_id: Option<String>,
    pub input_data: JsonValue,
    /// 1 for the first run, 2 for the first retry, and so on.
    pub attempt: u32,
    steps: StepRecorder,
}

impl TaskContext {
    pub fn for_job(job: &WorkflowJob, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            id: job.id,
            workflow_type: job.workflow_type.clone(),
            company_id: job.company_id.clone(),
            deal_id: job.deal_id.clone(),
            input_data: job.input_data.clone(),
            attempt: job.retry_count + 1,
            steps: StepRecorder::new(job.id, store),
        }
    }

    pub fn steps(&self) -> &StepRecorder {
        &self.steps
    }
}

/// A unit of work for one `workflow_type`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the job, returning the value stored as its `output_data`.
    async fn handle(&self, ctx: TaskContext) -> Result<JsonValue, HandlerError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> Result<JsonValue, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Maps `workflow_type` to the handler that runs it.
///
/// Lookup tries an exact match, then the longest `"prefix.*"` pattern, then `"*"`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register<H>(&mut self, workflow_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers.insert(workflow_type.into(), Arc::new(handler));
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, workflow_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
    {
        self.register(workflow_type, FnHandler(f))
    }

    pub fn resolve(&self, workflow_type: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(h) = self.handlers.get(workflow_type) {
            return Some(h.clone());
        }

        let by_prefix = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = workflow_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = by_prefix {
            return Some(h.clone());
        }

        self.handlers.get("*").cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.resolve(workflow_type).is_some()
    }

    /// Registered types and patterns, sorted.
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
