//! `workflowq-queue` — durable workflow queue and polling dispatcher.
//!
//! - [`store`]: the job store boundary with in-memory and SQLite backends
//! - [`dispatcher`]: bounded-concurrency execution with retry and escalation
//! - [`handler`]: task handlers and the `workflow_type` registry

pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod handler;
pub mod retry;
pub mod store;
pub mod types;

pub use dispatcher::{Dispatcher, DispatcherConfig, ExecutionOutcome, PollOutcome};
pub use error::StoreError;
pub use failure::{FailureClass, InterventionMarkers};
pub use handler::{
    FnHandler, HandlerError, HandlerRegistry, Step, StepRecorder, TaskContext, TaskHandler,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{InMemoryWorkflowStore, SqliteWorkflowStore, WorkflowStore};
pub use types::{
    ExecutionLogEntry, MAX_RETRIES_EXCEEDED, NewLogEntry, NewWorkflow, Priority, QueueStats,
    StatusTypeCount, StatusUpdate, StepStatus, WorkflowJob, WorkflowStatus,
};
