//! Job store errors.

use thiserror::Error;

use workflowq_core::{DomainError, WorkflowId};

use crate::types::WorkflowStatus;

/// Job store operation error.
///
/// `NotFound`, `InvalidTransition` and `Conflict` are integration errors and
/// are always propagated to the caller; `Storage` and `Corrupt` come from the
/// backing store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    #[error("invalid transition for workflow {id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        reason: String,
    },

    /// A conditional update lost a race with another writer.
    #[error("concurrent modification of workflow {0}")]
    Conflict(WorkflowId),

    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn invalid_transition(
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            id,
            from,
            to,
            reason: reason.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Corrupt(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Corrupt(format!("invalid JSON payload: {value}"))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
                Self::Corrupt(value.to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}
