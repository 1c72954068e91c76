//! `workflowq-core` — shared building blocks for the workflow queue.
//!
//! This crate holds **pure** primitives (identifiers, errors, time source) and
//! carries no storage or runtime concerns.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{LogEntryId, WorkflowId};
