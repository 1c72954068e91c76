//! Built-in handlers for the compliance workflow types.
//!
//! None of these talk to a real portal or mail provider. They record their
//! steps and report what a live integration would have to do.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use workflowq_queue::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};

pub const RENEWAL_REMINDER: &str = "renewal_reminder";
pub const USDOT_FILING: &str = "usdot_filing";
pub const MC_FILING: &str = "mc_filing";
pub const DOCUMENT_GENERATION: &str = "document_generation";

/// Registry with every built-in handler.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(RENEWAL_REMINDER, RenewalReminder)
        .register(USDOT_FILING, UsdotFiling)
        .register(MC_FILING, ManualOnly::new("MC filing agent not yet implemented"))
        .register(
            DOCUMENT_GENERATION,
            ManualOnly::new("Document generation not yet implemented"),
        );
    registry
}

fn field<'a>(input: &'a JsonValue, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Sends (mock) renewal reminders.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenewalReminder;

#[async_trait]
impl TaskHandler for RenewalReminder {
    async fn handle(&self, ctx: TaskContext) -> Result<JsonValue, HandlerError> {
        let service = field(&ctx.input_data, "serviceName").unwrap_or("compliance service");
        let step = ctx
            .steps()
            .begin("send_reminder", Some(ctx.input_data.clone()))
            .await?;

        info!(
            workflow_id = %ctx.id,
            company_id = ctx.company_id.as_deref().unwrap_or("-"),
            service,
            "renewal reminder queued for delivery"
        );

        step.complete(Some(json!({ "emailSent": false, "mockSent": true })))
            .await?;

        Ok(json!({
            "status": "reminder_sent",
            "serviceName": service,
            "emailSent": false,
            "mockSent": true,
        }))
    }
}

/// Prepares a USDOT registration from company data.
///
/// Submission is always left to a person; the result carries
/// `requiresManualSubmission`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsdotFiling;

#[async_trait]
impl TaskHandler for UsdotFiling {
    async fn handle(&self, ctx: TaskContext) -> Result<JsonValue, HandlerError> {
        let input = &ctx.input_data;
        let steps = ctx.steps();

        let validate = steps.begin("validate_data", Some(input.clone())).await?;
        let (Some(legal_name), Some(ein)) =
            (field(input, "legal_business_name"), field(input, "ein"))
        else {
            let msg = "Missing required company data for USDOT filing";
            validate.fail(msg).await?;
            return Err(HandlerError::new(msg));
        };
        validate.complete(None).await?;

        let form = json!({
            "legalName": legal_name,
            "ein": ein,
            "dbaName": field(input, "dba_name"),
            "businessAddress": input.get("business_address").cloned(),
        });
        let fill = steps.begin("fill_form", None).await?;
        fill.complete(Some(form.clone())).await?;

        let submit = steps.begin("submit_form", None).await?;
        submit
            .complete(Some(json!({ "requiresManualSubmission": true })))
            .await?;

        steps.skip("send_notification").await?;

        info!(workflow_id = %ctx.id, legal_name, "USDOT form prepared for manual submission");

        Ok(json!({
            "status": "form_filled",
            "form": form,
            "requiresManualSubmission": true,
        }))
    }
}

/// A workflow type with no automation yet; every run escalates.
#[derive(Debug, Clone)]
pub struct ManualOnly {
    what: &'static str,
}

impl ManualOnly {
    pub fn new(what: &'static str) -> Self {
        Self { what }
    }
}

#[async_trait]
impl TaskHandler for ManualOnly {
    async fn handle(&self, _ctx: TaskContext) -> Result<JsonValue, HandlerError> {
        Err(HandlerError::new(format!(
            "{} - requires manual intervention",
            self.what
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use workflowq_queue::{
        InMemoryWorkflowStore, InterventionMarkers, NewWorkflow, StepStatus, WorkflowStore,
    };

    use super::*;

    async fn context(store: &Arc<InMemoryWorkflowStore>, kind: &str, input: JsonValue) -> TaskContext {
        let id = store
            .enqueue(NewWorkflow::new(kind, input).with_company("co-1"))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        TaskContext::for_job(&job, store.clone())
    }

    async fn steps(store: &InMemoryWorkflowStore, ctx: &TaskContext) -> Vec<(String, StepStatus)> {
        store
            .get_execution_history(ctx.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.step_name, e.status))
            .collect()
    }

    #[test]
    fn registry_covers_builtin_types() {
        let registry = registry();
        for kind in [RENEWAL_REMINDER, USDOT_FILING, MC_FILING, DOCUMENT_GENERATION] {
            assert!(registry.contains(kind), "{kind} not registered");
        }
        assert!(!registry.contains("fax_filing"));
    }

    #[tokio::test]
    async fn renewal_reminder_reports_mock_delivery() {
        let store = InMemoryWorkflowStore::arc();
        let ctx = context(&store, RENEWAL_REMINDER, json!({ "serviceName": "BOC-3" })).await;

        let out = RenewalReminder.handle(ctx.clone()).await.unwrap();
        assert_eq!(out["status"], "reminder_sent");
        assert_eq!(out["mockSent"], true);
        assert_eq!(out["emailSent"], false);

        assert_eq!(
            steps(&store, &ctx).await,
            vec![
                ("send_reminder".to_string(), StepStatus::Started),
                ("send_reminder".to_string(), StepStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn usdot_filing_prepares_form() {
        let store = InMemoryWorkflowStore::arc();
        let ctx = context(
            &store,
            USDOT_FILING,
            json!({ "legal_business_name": "Acme Freight LLC", "ein": "12-3456789" }),
        )
        .await;

        let out = UsdotFiling.handle(ctx.clone()).await.unwrap();
        assert_eq!(out["status"], "form_filled");
        assert_eq!(out["requiresManualSubmission"], true);
        assert_eq!(out["form"]["legalName"], "Acme Freight LLC");

        let history = steps(&store, &ctx).await;
        assert_eq!(history.len(), 7);
        assert_eq!(
            history.last(),
            Some(&("send_notification".to_string(), StepStatus::Skipped))
        );
    }

    #[tokio::test]
    async fn usdot_filing_without_company_data_is_retryable() {
        let store = InMemoryWorkflowStore::arc();
        let ctx = context(&store, USDOT_FILING, json!({ "legal_business_name": "Acme" })).await;

        let err = UsdotFiling.handle(ctx.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing required company data for USDOT filing");
        assert!(!InterventionMarkers::default().matches(&err.to_string()));

        assert_eq!(
            steps(&store, &ctx).await,
            vec![
                ("validate_data".to_string(), StepStatus::Started),
                ("validate_data".to_string(), StepStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn unautomated_types_escalate() {
        let store = InMemoryWorkflowStore::arc();
        let registry = registry();

        for kind in [MC_FILING, DOCUMENT_GENERATION] {
            let ctx = context(&store, kind, json!({})).await;
            let handler = registry.resolve(kind).unwrap();
            let err = handler.handle(ctx).await.unwrap_err();
            assert!(err.to_string().ends_with("requires manual intervention"));
            assert!(InterventionMarkers::default().matches(&err.to_string()));
        }
    }
}
