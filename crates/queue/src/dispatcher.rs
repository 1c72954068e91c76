//! Polling dispatcher: turns pending jobs into handler invocations.
//!
//! A single loop per dispatcher polls the store on a fixed interval. Each
//! poll re-arms failed jobs whose back-off has elapsed, then pulls up to the
//! concurrency cap of eligible jobs and runs each one as its own tokio
//! task. Outcomes are written back through the store and only then published
//! on the event bus.

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use workflowq_core::WorkflowId;
use workflowq_events::{DomainEvent, EventBus, EventBusExt, WorkflowCompleted, WorkflowFailed};

use crate::error::StoreError;
use crate::failure::{FailureClass, InterventionMarkers};
use crate::handler::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};
use crate::store::WorkflowStore;
use crate::types::{StatusUpdate, WorkflowJob, WorkflowStatus};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Maximum jobs executing at once
    pub max_concurrent: usize,
    /// Error substrings that escalate a failure to a human
    pub intervention_markers: InterventionMarkers,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrent: 5,
            intervention_markers: InterventionMarkers::default(),
            name: "workflow-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_intervention_markers(mut self, markers: InterventionMarkers) -> Self {
        self.intervention_markers = markers;
        self
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Failed jobs moved back to pending
    pub rearmed: usize,
    /// Jobs handed to an execution task
    pub dispatched: usize,
    /// Pending jobs skipped because they were already executing here
    pub skipped_in_flight: usize,
    /// The concurrency cap was full at some point during the poll
    pub saturated: bool,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    /// Transient failure; the store scheduled another attempt.
    Retrying {
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// Terminal failure waiting for an operator.
    Intervention { reason: Option<String> },
    /// The job was no longer pending when the dispatcher tried to claim it.
    NotClaimed,
}

struct Runner {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn WorkflowStore>,
    registry: HandlerRegistry,
    bus: Arc<dyn EventBus>,
    config: DispatcherConfig,
    in_flight: Mutex<HashSet<WorkflowId>>,
    idle: Notify,
    polling: tokio::sync::Mutex<()>,
    runner: Mutex<Option<Runner>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds one concurrency slot; releases it on drop.
struct Slot {
    inner: Arc<Inner>,
    id: WorkflowId,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        in_flight.remove(&self.id);
        if in_flight.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

enum Reservation {
    Reserved(Slot),
    AlreadyRunning,
    Full,
}

/// Background workflow dispatcher.
///
/// Cheap to clone; clones control the same loop and share the in-flight set.
///
/// Limitations:
/// - Cancellation is soft. A canceled job that is already executing runs to
///   the end and its outcome is rejected by the store.
/// - A job stays `in_progress` if the process dies while it executes, or if
///   writing its outcome fails. Nothing re-claims such jobs; they show up in
///   `get_by_status(InProgress, ..)` and need an operator.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

impl Dispatcher {
    pub fn new<S, B>(store: S, registry: HandlerRegistry, bus: B, config: DispatcherConfig) -> Self
    where
        S: WorkflowStore + 'static,
        B: EventBus + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(store),
                registry,
                bus: Arc::new(bus),
                config,
                in_flight: Mutex::new(HashSet::new()),
                idle: Notify::new(),
                polling: tokio::sync::Mutex::new(()),
                runner: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Start the polling loop. Polls immediately, then every `poll_interval`.
    ///
    /// Calling `start` on a running dispatcher does nothing. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let mut runner = lock(&self.inner.runner);
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(dispatcher = %self.inner.config.name, "dispatcher already running");
            return;
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(self.clone().run(shutdown.clone()));
        *runner = Some(Runner { shutdown, handle });
    }

    /// Stop the polling loop and wait for it to exit.
    ///
    /// Jobs already executing keep running; use [`wait_idle`](Self::wait_idle)
    /// to wait for them.
    pub async fn stop(&self) {
        let Some(runner) = lock(&self.inner.runner).take() else {
            return;
        };

        runner.shutdown.notify_one();
        if let Err(e) = runner.handle.await {
            warn!(dispatcher = %self.inner.config.name, error = %e, "dispatcher loop ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.runner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Number of jobs currently executing under this dispatcher.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Wait until no job is executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        let config = &self.inner.config;
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            dispatcher = %config.name,
            poll_interval_ms = u64::try_from(config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            max_concurrent = config.max_concurrent,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(outcome) if outcome.dispatched > 0 || outcome.rearmed > 0 => {
                            debug!(
                                dispatcher = %config.name,
                                dispatched = outcome.dispatched,
                                rearmed = outcome.rearmed,
                                in_flight = self.in_flight_count(),
                                "poll finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(dispatcher = %config.name, error = %e, "poll failed");
                        }
                    }
                }
            }
        }

        info!(dispatcher = %config.name, "dispatcher stopped");
    }

    fn reserve(&self, id: WorkflowId) -> Reservation {
        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.contains(&id) {
            return Reservation::AlreadyRunning;
        }
        if in_flight.len() >= self.inner.config.max_concurrent {
            return Reservation::Full;
        }

        in_flight.insert(id);
        Reservation::Reserved(Slot {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Run one scheduling pass.
    ///
    /// Returns as soon as the jobs are handed off; it never waits for a
    /// handler.
    pub async fn poll(&self) -> Result<PollOutcome, StoreError> {
        let _polling = self.inner.polling.lock().await;
        let config = &self.inner.config;

        let rearmed = self.inner.store.rearm_due_retries().await?;
        for id in &rearmed {
            debug!(dispatcher = %config.name, workflow_id = %id, "retry due, workflow re-armed");
        }

        let mut outcome = PollOutcome {
            rearmed: rearmed.len(),
            ..Default::default()
        };

        if self.in_flight_count() >= config.max_concurrent {
            debug!(dispatcher = %config.name, "concurrency cap exhausted, skipping fetch");
            outcome.saturated = true;
            return Ok(outcome);
        }

        let pending = self.inner.store.get_pending(config.max_concurrent).await?;
        for job in pending {
            let slot = match self.reserve(job.id) {
                Reservation::Reserved(slot) => slot,
                Reservation::AlreadyRunning => {
                    outcome.skipped_in_flight += 1;
                    continue;
                }
                Reservation::Full => {
                    outcome.saturated = true;
                    break;
                }
            };

            outcome.dispatched += 1;
            let this = self.clone();
            tokio::spawn(async move {
                let _slot = slot;
                let id = job.id;
                if let Err(e) = this.execute(job).await {
                    this.log_store_error(id, &e);
                }
            });
        }

        Ok(outcome)
    }

    fn log_store_error(&self, id: WorkflowId, e: &StoreError) {
        let name = &self.inner.config.name;
        match e {
            StoreError::InvalidTransition { .. } | StoreError::Conflict(_) => {
                warn!(dispatcher = %name, workflow_id = %id, error = %e, "outcome rejected by store");
            }
            _ => {
                error!(dispatcher = %name, workflow_id = %id, error = %e, "failed to record workflow outcome");
            }
        }
    }

    /// Claim `job` and run it to an outcome.
    ///
    /// Handler errors and panics are absorbed here and become a status update
    /// plus a `workflow.failed` event. Store errors are returned; when the
    /// outcome write fails no event is published.
    pub async fn execute(&self, job: WorkflowJob) -> Result<ExecutionOutcome, StoreError> {
        let name = &self.inner.config.name;
        let id = job.id;

        let Some(job) = self.inner.store.claim(id).await? else {
            debug!(dispatcher = %name, workflow_id = %id, "workflow no longer pending, skipping");
            return Ok(ExecutionOutcome::NotClaimed);
        };

        info!(
            dispatcher = %name,
            workflow_id = %id,
            workflow_type = %job.workflow_type,
            attempt = job.retry_count + 1,
            "executing workflow"
        );

        let started = Instant::now();
        let result = match self.inner.registry.resolve(&job.workflow_type) {
            Some(handler) => {
                let ctx = TaskContext::for_job(&job, self.inner.store.clone());
                run_handler(handler, ctx).await
            }
            None => Err(HandlerError::UnknownWorkflowType(job.workflow_type.clone())),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(output) => self.complete(job, output, elapsed_ms).await,
            Err(e) => self.fail(job, e, elapsed_ms).await,
        }
    }

    async fn complete(
        &self,
        job: WorkflowJob,
        output: JsonValue,
        elapsed_ms: u64,
    ) -> Result<ExecutionOutcome, StoreError> {
        self.inner
            .store
            .update_status(
                job.id,
                WorkflowStatus::Completed,
                StatusUpdate::completed(output.clone()),
            )
            .await?;

        info!(
            dispatcher = %self.inner.config.name,
            workflow_id = %job.id,
            workflow_type = %job.workflow_type,
            elapsed_ms,
            "workflow completed"
        );

        self.publish(&WorkflowCompleted {
            workflow_id: job.id,
            workflow_type: job.workflow_type,
            company_id: job.company_id,
            deal_id: job.deal_id,
            result: output,
        });
        Ok(ExecutionOutcome::Completed)
    }

    async fn fail(
        &self,
        job: WorkflowJob,
        error: HandlerError,
        elapsed_ms: u64,
    ) -> Result<ExecutionOutcome, StoreError> {
        let config = &self.inner.config;
        let class = FailureClass::classify(&error, &job, &config.intervention_markers);
        let (update, message) = class.status_update(&error, &job);

        let updated = self
            .inner
            .store
            .update_status(job.id, WorkflowStatus::Failed, update)
            .await?;

        let outcome = if updated.requires_human_intervention {
            warn!(
                dispatcher = %config.name,
                workflow_id = %job.id,
                workflow_type = %job.workflow_type,
                error = %message,
                reason = updated.intervention_reason.as_deref().unwrap_or_default(),
                elapsed_ms,
                "workflow requires human intervention"
            );
            ExecutionOutcome::Intervention {
                reason: updated.intervention_reason.clone(),
            }
        } else {
            warn!(
                dispatcher = %config.name,
                workflow_id = %job.id,
                workflow_type = %job.workflow_type,
                error = %message,
                retry_count = updated.retry_count,
                next_retry_at = ?updated.next_retry_at,
                elapsed_ms,
                "workflow failed, retry scheduled"
            );
            ExecutionOutcome::Retrying {
                retry_count: updated.retry_count,
                next_retry_at: updated.next_retry_at,
            }
        };

        self.publish(&WorkflowFailed {
            workflow_id: job.id,
            workflow_type: job.workflow_type,
            error: message,
            requires_intervention: updated.requires_human_intervention,
        });
        Ok(outcome)
    }

    fn publish<E: DomainEvent>(&self, event: &E) {
        if let Err(e) = self.inner.bus.publish(event) {
            warn!(
                dispatcher = %self.inner.config.name,
                event = E::NAME,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// Run a handler on its own task so a panic surfaces as an error.
async fn run_handler(
    handler: Arc<dyn TaskHandler>,
    ctx: TaskContext,
) -> Result<JsonValue, HandlerError> {
    match tokio::spawn(async move { handler.handle(ctx).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(HandlerError::new(format!("handler task cancelled: {e}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
