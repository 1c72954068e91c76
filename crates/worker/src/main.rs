use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use workflowq_events::{EmittedEvent, EventBus, InMemoryEventBus, names};
use workflowq_queue::{Dispatcher, SqliteWorkflowStore, WorkflowStore};
use workflowq_worker::{WorkerConfig, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    workflowq_observability::init_with(config.log_format);

    let store = SqliteWorkflowStore::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("failed to open workflow store at {}", config.database_url))?;
    let store = Arc::new(store);

    let stats = store.get_queue_stats().await.context("failed to read queue stats")?;
    let flagged = store
        .get_intervention_required()
        .await
        .context("failed to list flagged workflows")?;
    info!(
        total = stats.total(),
        flagged = flagged.len(),
        "workflow store ready"
    );

    let bus = InMemoryEventBus::arc();
    bus.on(
        names::WORKFLOW_FAILED,
        Box::new(|event: &EmittedEvent| {
            if event.payload["requiresIntervention"].as_bool() == Some(true) {
                warn!(
                    workflow_id = event.payload["workflowId"].as_str().unwrap_or("-"),
                    workflow_type = event.payload["workflowType"].as_str().unwrap_or("-"),
                    error = event.payload["error"].as_str().unwrap_or("-"),
                    "workflow needs human intervention"
                );
            }
        }),
    )
    .context("failed to subscribe to workflow events")?;

    let registry = handlers::registry();
    info!(workflow_types = ?registry.workflow_types(), "handlers registered");

    let dispatcher = Dispatcher::new(store.clone(), registry, bus.clone(), config.dispatcher_config());
    dispatcher.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    dispatcher.stop().await;
    if tokio::time::timeout(config.shutdown_timeout, dispatcher.wait_idle())
        .await
        .is_err()
    {
        warn!(
            in_flight = dispatcher.in_flight_count(),
            "shutdown timeout elapsed with workflows still running"
        );
    }

    bus.shutdown();
    store.close().await;
    info!("worker stopped");
    Ok(())
}
