//! Workflow lifecycle events published by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use workflowq_core::WorkflowId;

use crate::event::{DomainEvent, names};

/// A job finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCompleted {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub company_id: Option<String>,
    pub deal_id: Option<String>,
    pub result: JsonValue,
}

impl DomainEvent for WorkflowCompleted {
    const NAME: &'static str = names::WORKFLOW_COMPLETED;
}

/// An execution attempt failed.
///
/// `requires_intervention` is true when the job will not be retried
/// automatically and is waiting for an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowFailed {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub error: String,
    pub requires_intervention: bool,
}

impl DomainEvent for WorkflowFailed {
    const NAME: &'static str = names::WORKFLOW_FAILED;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{EventBus, EventBusExt, InMemoryEventBus};

    #[test]
    fn workflow_failed_uses_camel_case_wire_names() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        let id = WorkflowId::new();

        bus.publish(&WorkflowFailed {
            workflow_id: id,
            workflow_type: "mc_filing".into(),
            error: "requires manual MFA entry".into(),
            requires_intervention: true,
        })
        .unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.name, "workflow.failed");
        assert_eq!(event.payload["workflowId"], json!(id.to_string()));
        assert_eq!(event.payload["workflowType"], "mc_filing");
        assert_eq!(event.payload["requiresIntervention"], true);
        assert!(event.payload.get("timestamp").is_some());
    }

    #[test]
    fn workflow_completed_carries_result() {
        let bus = InMemoryEventBus::new();
        let event = bus
            .publish(&WorkflowCompleted {
                workflow_id: WorkflowId::new(),
                workflow_type: "renewal_reminder".into(),
                company_id: Some("c-1".into()),
                deal_id: None,
                result: json!({"mockSent": true}),
            })
            .unwrap();

        assert_eq!(event.name, "workflow.completed");
        assert_eq!(event.payload["companyId"], "c-1");
        assert_eq!(event.payload["dealId"], JsonValue::Null);
        assert_eq!(event.payload["result"]["mockSent"], true);
    }
}
