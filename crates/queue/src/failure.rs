//! Failure classification for handler errors.

use crate::handler::HandlerError;
use crate::types::{MAX_RETRIES_EXCEEDED, StatusUpdate, WorkflowJob};

/// Substrings that mark a handler error as needing a human.
///
/// Matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterventionMarkers(Vec<String>);

impl Default for InterventionMarkers {
    fn default() -> Self {
        Self::new(["MFA", "manual", "intervention"])
    }
}

impl InterventionMarkers {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        )
    }

    pub fn matches(&self, message: &str) -> bool {
        self.0.iter().any(|m| message.contains(m.as_str()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// How a failed attempt is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Escalate now; never retried automatically.
    Intervention,
    /// Transient; the store schedules the next attempt.
    Retry,
    /// Transient, but the job has used all its retries.
    Exhausted,
}

impl FailureClass {
    /// Classify `error` for `job`. Checked in order: explicit intervention or
    /// unknown type, marker match, remaining retries.
    pub fn classify(error: &HandlerError, job: &WorkflowJob, markers: &InterventionMarkers) -> Self {
        match error {
            HandlerError::Intervention(_) | HandlerError::UnknownWorkflowType(_) => {
                FailureClass::Intervention
            }
            _ if markers.matches(&error.to_string()) => FailureClass::Intervention,
            _ if job.has_retries_left() => FailureClass::Retry,
            _ => FailureClass::Exhausted,
        }
    }

    pub fn requires_intervention(&self) -> bool {
        !matches!(self, FailureClass::Retry)
    }

    /// The status update to write for this class, plus the error message to publish.
    pub fn status_update(&self, error: &HandlerError, job: &WorkflowJob) -> (StatusUpdate, String) {
        let message = error.to_string();
        match self {
            FailureClass::Intervention => {
                (StatusUpdate::intervention(message.clone(), message.clone()), message)
            }
            FailureClass::Retry => (StatusUpdate::failed(message.clone()), message),
            FailureClass::Exhausted => {
                let message = format!("Max retries ({}) exceeded: {message}", job.max_retries);
                (
                    StatusUpdate::intervention(message.clone(), MAX_RETRIES_EXCEEDED),
                    message,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use workflowq_core::WorkflowId;

    use super::*;
    use crate::types::NewWorkflow;

    fn job(retry_count: u32, max_retries: u32) -> WorkflowJob {
        let mut job = WorkflowJob::from_request(
            WorkflowId::new(),
            NewWorkflow::new("usdot_filing", json!({})).with_max_retries(max_retries),
            3,
            Utc::now(),
        );
        job.retry_count = retry_count;
        job
    }

    #[test]
    fn markers_are_case_sensitive_substrings() {
        let markers = InterventionMarkers::default();

        assert!(markers.matches("requires manual MFA entry"));
        assert!(markers.matches("needs intervention from agent"));
        assert!(!markers.matches("Manual review"));
        assert!(!markers.matches("mfa code expired"));
        assert!(!markers.matches("portal timeout"));
    }

    #[test]
    fn marker_beats_remaining_retries() {
        let markers = InterventionMarkers::default();
        let class = FailureClass::classify(
            &HandlerError::new("requires manual MFA entry"),
            &job(0, 3),
            &markers,
        );
        assert_eq!(class, FailureClass::Intervention);
        assert!(class.requires_intervention());
    }

    #[test]
    fn transient_errors_retry_until_exhausted() {
        let markers = InterventionMarkers::default();
        let err = HandlerError::new("portal timeout");

        assert_eq!(FailureClass::classify(&err, &job(2, 3), &markers), FailureClass::Retry);
        assert_eq!(FailureClass::classify(&err, &job(3, 3), &markers), FailureClass::Exhausted);
        assert_eq!(FailureClass::classify(&err, &job(0, 0), &markers), FailureClass::Exhausted);
    }

    #[test]
    fn unknown_type_and_explicit_intervention_escalate() {
        let markers = InterventionMarkers::new(Vec::<String>::new());
        for err in [
            HandlerError::UnknownWorkflowType("fax_filing".into()),
            HandlerError::intervention("awaiting signature"),
        ] {
            assert_eq!(
                FailureClass::classify(&err, &job(0, 3), &markers),
                FailureClass::Intervention
            );
        }
    }

    #[test]
    fn exhausted_update_carries_fixed_reason() {
        let j = job(3, 3);
        let (update, message) =
            FailureClass::Exhausted.status_update(&HandlerError::new("portal timeout"), &j);

        assert_eq!(message, "Max retries (3) exceeded: portal timeout");
        assert!(update.requires_intervention);
        assert_eq!(update.intervention_reason.as_deref(), Some(MAX_RETRIES_EXCEEDED));
        assert_eq!(update.error_message.as_deref(), Some(message.as_str()));
    }
}
