//! Durable job store persisted in SQLite.
//!
//! Two tables back the store: `workflow_queue` holds one row per job and
//! `workflow_execution_log` holds the append-only step log. Timestamps are
//! stored as integer milliseconds since the Unix epoch so ordering and
//! eligibility checks run in SQL.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};

use workflowq_core::{Clock, LogEntryId, SystemClock, WorkflowId};

use super::WorkflowStore;
use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::types::{
    ExecutionLogEntry, NewLogEntry, NewWorkflow, Priority, QueueStats, StatusTypeCount,
    StatusUpdate, StepStatus, WorkflowJob, WorkflowStatus,
};

/// Implement `sqlx` text codecs for enums that carry `as_str` and `FromStr`.
macro_rules! sqlite_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl sqlx::Type<sqlx::Sqlite> for $ty {
                fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                    <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
                }
            }

            impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
                fn decode(
                    value: sqlx::sqlite::SqliteValueRef<'r>,
                ) -> Result<Self, sqlx::error::BoxDynError> {
                    let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
                    Ok(s.parse::<$ty>()?)
                }
            }

            impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
                fn encode_by_ref(
                    &self,
                    buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
                ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                    let s = self.as_str();
                    <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
                }
            }
        )+
    };
}

sqlite_text_enum!(WorkflowStatus, Priority, StepStatus);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_queue (
        seq                         INTEGER PRIMARY KEY AUTOINCREMENT,
        id                          TEXT    NOT NULL UNIQUE,
        workflow_type               TEXT    NOT NULL,
        priority                    TEXT    NOT NULL,
        status                      TEXT    NOT NULL,
        company_id                  TEXT    NULL,
        deal_id                     TEXT    NULL,
        payment_transaction_id      TEXT    NULL,
        input_data                  TEXT    NOT NULL,
        output_data                 TEXT    NULL,
        error_message               TEXT    NULL,
        assigned_agent              TEXT    NULL,
        retry_count                 INTEGER NOT NULL DEFAULT 0,
        max_retries                 INTEGER NOT NULL,
        requires_human_intervention INTEGER NOT NULL DEFAULT 0,
        intervention_reason         TEXT    NULL,
        created_at                  INTEGER NOT NULL,
        scheduled_for               INTEGER NULL,
        started_at                  INTEGER NULL,
        completed_at                INTEGER NULL,
        failed_at                   INTEGER NULL,
        next_retry_at               INTEGER NULL,
        updated_at                  INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_queue_status ON workflow_queue (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_queue_intervention ON workflow_queue (requires_human_intervention, status)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_execution_log (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        id            TEXT    NOT NULL UNIQUE,
        workflow_id   TEXT    NOT NULL REFERENCES workflow_queue (id),
        step_name     TEXT    NOT NULL,
        step_order    INTEGER NOT NULL,
        status        TEXT    NOT NULL,
        input_data    TEXT    NULL,
        output_data   TEXT    NULL,
        error_message TEXT    NULL,
        started_at    INTEGER NOT NULL,
        completed_at  INTEGER NULL,
        duration_ms   INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_execution_log_workflow ON workflow_execution_log (workflow_id, step_order)",
];

const JOB_COLUMNS: &str = r#"
    id, workflow_type, priority, status, company_id, deal_id, payment_transaction_id,
    input_data, output_data, error_message, assigned_agent, retry_count, max_retries,
    requires_human_intervention, intervention_reason, created_at, scheduled_for,
    started_at, completed_at, failed_at, next_retry_at, updated_at
"#;

/// SQLite-backed job store.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl SqliteWorkflowStore {
    /// Open (creating if missing) the database at `url` and ensure the schema exists.
    ///
    /// In-memory URLs get a single long-lived connection: every new SQLite
    /// memory connection would otherwise see its own empty database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
            retry_policy: RetryPolicy::default(),
        };
        store.migrate().await?;

        tracing::info!(url = %url, in_memory, "sqlite workflow store ready");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Current time truncated to the stored millisecond precision.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    async fn exists(&self, conn: &mut SqliteConnection, id: WorkflowId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM workflow_queue WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?;
        Ok(row.is_some())
    }

    async fn transition(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        update: StatusUpdate,
    ) -> Result<WorkflowJob, StoreError> {
        let now = self.now();
        // IMMEDIATE takes the write lock before the read, so a commit from another
        // connection cannot invalidate the snapshot between SELECT and UPDATE.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM workflow_queue WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let mut job = match row {
            Some(row) => row_to_job(&row)?,
            None => return Err(StoreError::NotFound(id)),
        };

        let from = job.status;
        job.apply_transition(status, update, now, &self.retry_policy)?;

        let written = write_job(&mut *tx, &job, from).await?;
        if written == 0 {
            return Err(StoreError::Conflict(id));
        }

        tx.commit().await?;
        Ok(job)
    }
}

/// Persist the mutable columns of `job`, guarded on the status it was read with.
async fn write_job(
    conn: &mut SqliteConnection,
    job: &WorkflowJob,
    expected: WorkflowStatus,
) -> Result<u64, StoreError> {
    let output = job.output_data.as_ref().map(serde_json::to_string).transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE workflow_queue
        SET status = ?1,
            output_data = ?2,
            error_message = ?3,
            retry_count = ?4,
            requires_human_intervention = ?5,
            intervention_reason = ?6,
            started_at = ?7,
            completed_at = ?8,
            failed_at = ?9,
            next_retry_at = ?10,
            updated_at = ?11
        WHERE id = ?12
          AND status = ?13
        "#,
    )
    .bind(job.status)
    .bind(output)
    .bind(job.error_message.as_deref())
    .bind(i64::from(job.retry_count))
    .bind(job.requires_human_intervention)
    .bind(job.intervention_reason.as_deref())
    .bind(job.started_at.map(to_millis))
    .bind(job.completed_at.map(to_millis))
    .bind(job.failed_at.map(to_millis))
    .bind(job.next_retry_at.map(to_millis))
    .bind(to_millis(job.updated_at))
    .bind(job.id.to_string())
    .bind(expected)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn opt_json(raw: Option<String>) -> Result<Option<JsonValue>, StoreError> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn row_to_job(row: &SqliteRow) -> Result<WorkflowJob, StoreError> {
    let id: String = row.try_get("id")?;
    let input: String = row.try_get("input_data")?;

    Ok(WorkflowJob {
        id: id.parse()?,
        workflow_type: row.try_get("workflow_type")?,
        priority: row.try_get("priority")?,
        status: row.try_get("status")?,
        company_id: row.try_get("company_id")?,
        deal_id: row.try_get("deal_id")?,
        payment_transaction_id: row.try_get("payment_transaction_id")?,
        input_data: serde_json::from_str(&input)?,
        output_data: opt_json(row.try_get("output_data")?)?,
        error_message: row.try_get("error_message")?,
        assigned_agent: row.try_get("assigned_agent")?,
        retry_count: to_u32(row.try_get("retry_count")?, "retry_count")?,
        max_retries: to_u32(row.try_get("max_retries")?, "max_retries")?,
        requires_human_intervention: row.try_get("requires_human_intervention")?,
        intervention_reason: row.try_get("intervention_reason")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        scheduled_for: opt_from_millis(row.try_get("scheduled_for")?)?,
        started_at: opt_from_millis(row.try_get("started_at")?)?,
        completed_at: opt_from_millis(row.try_get("completed_at")?)?,
        failed_at: opt_from_millis(row.try_get("failed_at")?)?,
        next_retry_at: opt_from_millis(row.try_get("next_retry_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn row_to_log_entry(row: &SqliteRow) -> Result<ExecutionLogEntry, StoreError> {
    let id: String = row.try_get("id")?;
    let workflow_id: String = row.try_get("workflow_id")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;

    Ok(ExecutionLogEntry {
        id: id.parse::<LogEntryId>()?,
        workflow_id: workflow_id.parse()?,
        step_name: row.try_get("step_name")?,
        step_order: to_u32(row.try_get("step_order")?, "step_order")?,
        status: row.try_get("status")?,
        input_data: opt_json(row.try_get("input_data")?)?,
        output_data: opt_json(row.try_get("output_data")?)?,
        error_message: row.try_get("error_message")?,
        started_at: from_millis(row.try_get("started_at")?)?,
        completed_at: opt_from_millis(row.try_get("completed_at")?)?,
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
    })
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn enqueue(&self, request: NewWorkflow) -> Result<WorkflowId, StoreError> {
        let now = self.now();
        let id = WorkflowId::new();
        let job = WorkflowJob::from_request(id, request, self.retry_policy.max_retries, now);

        sqlx::query(
            r#"
            INSERT INTO workflow_queue (
                id, workflow_type, priority, status, company_id, deal_id,
                payment_transaction_id, input_data, assigned_agent, retry_count,
                max_retries, requires_human_intervention, created_at, scheduled_for,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, 0, ?11, ?12, ?13)
            "#,
        )
        .bind(id.to_string())
        .bind(&job.workflow_type)
        .bind(job.priority)
        .bind(job.status)
        .bind(job.company_id.as_deref())
        .bind(job.deal_id.as_deref())
        .bind(job.payment_transaction_id.as_deref())
        .bind(serde_json::to_string(&job.input_data)?)
        .bind(job.assigned_agent.as_deref())
        .bind(i64::from(job.max_retries))
        .bind(to_millis(job.created_at))
        .bind(job.scheduled_for.map(to_millis))
        .bind(to_millis(job.updated_at))
        .execute(&self.pool)
        .await?;

        tracing::debug!(workflow_id = %id, workflow_type = %job.workflow_type, "workflow enqueued");
        Ok(id)
    }

    async fn get(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM workflow_queue WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<WorkflowJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM workflow_queue
            WHERE status = 'pending'
              AND (scheduled_for IS NULL OR scheduled_for <= ?1)
            ORDER BY
                CASE priority
                    WHEN 'urgent' THEN 1
                    WHEN 'high' THEN 2
                    WHEN 'medium' THEN 3
                    WHEN 'low' THEN 4
                    ELSE 5
                END,
                created_at ASC,
                seq ASC
            LIMIT ?2
            "#
        ))
        .bind(to_millis(self.now()))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn claim(&self, id: WorkflowId) -> Result<Option<WorkflowJob>, StoreError> {
        let now = to_millis(self.now());
        let mut conn = self.pool.acquire().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_queue
            SET status = 'in_progress',
                started_at = ?1,
                updated_at = ?1
            WHERE id = ?2
              AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = row {
            return Ok(Some(row_to_job(&row)?));
        }
        if self.exists(&mut *conn, id).await? {
            Ok(None)
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        update: StatusUpdate,
    ) -> Result<WorkflowJob, StoreError> {
        self.transition(id, status, update).await
    }

    async fn rearm_due_retries(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let now = to_millis(self.now());
        let rows = sqlx::query(
            r#"
            UPDATE workflow_queue
            SET status = 'pending',
                updated_at = ?1
            WHERE status = 'failed'
              AND requires_human_intervention = 0
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?1
            RETURNING id, seq
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut rearmed = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq")?;
            let id: String = row.try_get("id")?;
            rearmed.push((seq, id.parse::<WorkflowId>()?));
        }
        rearmed.sort();
        Ok(rearmed.into_iter().map(|(_, id)| id).collect())
    }

    async fn get_by_status(
        &self,
        status: WorkflowStatus,
        limit: usize,
    ) -> Result<Vec<WorkflowJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM workflow_queue
            WHERE status = ?1
            ORDER BY created_at DESC, seq DESC
            LIMIT ?2
            "#
        ))
        .bind(status)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn get_intervention_required(&self) -> Result<Vec<WorkflowJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM workflow_queue
            WHERE requires_human_intervention = 1
              AND status != 'completed'
            ORDER BY created_at DESC, seq DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn log_execution_step(
        &self,
        id: WorkflowId,
        entry: NewLogEntry,
    ) -> Result<LogEntryId, StoreError> {
        let now = self.now();
        let mut conn = self.pool.acquire().await?;
        if !self.exists(&mut *conn, id).await? {
            return Err(StoreError::NotFound(id));
        }

        let log_id = LogEntryId::new();
        let entry = ExecutionLogEntry::from_request(log_id, id, entry, now);

        sqlx::query(
            r#"
            INSERT INTO workflow_execution_log (
                id, workflow_id, step_name, step_order, status, input_data,
                output_data, error_message, started_at, completed_at, duration_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(log_id.to_string())
        .bind(id.to_string())
        .bind(&entry.step_name)
        .bind(i64::from(entry.step_order))
        .bind(entry.status)
        .bind(entry.input_data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(entry.output_data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(entry.error_message.as_deref())
        .bind(to_millis(entry.started_at))
        .bind(entry.completed_at.map(to_millis))
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .execute(&mut *conn)
        .await?;

        Ok(log_id)
    }

    async fn get_execution_history(
        &self,
        id: WorkflowId,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, step_name, step_order, status, input_data,
                   output_data, error_message, started_at, completed_at, duration_ms
            FROM workflow_execution_log
            WHERE workflow_id = ?1
            ORDER BY step_order ASC, seq ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log_entry).collect()
    }

    async fn get_queue_stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, workflow_type, COUNT(*) AS count
            FROM workflow_queue
            GROUP BY status, workflow_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let count: i64 = row.try_get("count")?;
            counts.push(StatusTypeCount {
                status: row.try_get("status")?,
                workflow_type: row.try_get("workflow_type")?,
                count: u64::try_from(count).unwrap_or(0),
            });
        }
        Ok(QueueStats::from_counts(counts))
    }

    async fn cancel(
        &self,
        id: WorkflowId,
        reason: Option<String>,
    ) -> Result<WorkflowJob, StoreError> {
        let update = StatusUpdate {
            error_message: reason,
            ..Default::default()
        };
        self.transition(id, WorkflowStatus::Canceled, update).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use workflowq_core::ManualClock;

    use super::*;
    use crate::types::MAX_RETRIES_EXCEEDED;

    async fn store() -> (SqliteWorkflowStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = SqliteWorkflowStore::in_memory()
            .await
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn enqueue_round_trips_every_field() {
        let (store, clock) = store().await;
        let at = clock.now() + ChronoDuration::hours(2);

        let id = store
            .enqueue(
                NewWorkflow::new("mc_filing", json!({"dot": 1234567, "state": "TX"}))
                    .with_company("co-1")
                    .with_deal("deal-9")
                    .with_payment_transaction("pay-3")
                    .with_priority(Priority::High)
                    .with_assigned_agent("filing-agent")
                    .scheduled_for(at)
                    .with_max_retries(5),
            )
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.workflow_type, "mc_filing");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.status, WorkflowStatus::Pending);
        assert_eq!(job.company_id.as_deref(), Some("co-1"));
        assert_eq!(job.deal_id.as_deref(), Some("deal-9"));
        assert_eq!(job.payment_transaction_id.as_deref(), Some("pay-3"));
        assert_eq!(job.assigned_agent.as_deref(), Some("filing-agent"));
        assert_eq!(job.input_data, json!({"dot": 1234567, "state": "TX"}));
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.scheduled_for.map(to_millis), Some(to_millis(at)));
        assert!(store.get(WorkflowId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_orders_by_priority_then_fifo() {
        let (store, clock) = store().await;
        let mut ids = Vec::new();
        for p in [Priority::Low, Priority::Urgent, Priority::Medium, Priority::Urgent] {
            ids.push(
                store
                    .enqueue(NewWorkflow::new("renewal_reminder", json!({})).with_priority(p))
                    .await
                    .unwrap(),
            );
            clock.advance(ChronoDuration::milliseconds(5));
        }

        let order: Vec<WorkflowId> = store
            .get_pending(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec![ids[1], ids[3], ids[2], ids[0]]);
    }

    #[tokio::test]
    async fn claim_is_conditional() {
        let (store, _clock) = store().await;
        let id = store
            .enqueue(NewWorkflow::new("renewal_reminder", json!({})))
            .await
            .unwrap();

        let job = store.claim(id).await.unwrap().unwrap();
        assert_eq!(job.status, WorkflowStatus::InProgress);
        assert!(job.started_at.is_some());
        assert!(store.claim(id).await.unwrap().is_none());
        assert!(matches!(
            store.claim(WorkflowId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failure_backoff_and_rearm() {
        let (store, clock) = store().await;
        let id = store
            .enqueue(NewWorkflow::new("usdot_filing", json!({})).with_max_retries(1))
            .await
            .unwrap();

        store.claim(id).await.unwrap();
        let job = store
            .update_status(id, WorkflowStatus::Failed, StatusUpdate::failed("portal timeout"))
            .await
            .unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(
            job.next_retry_at.unwrap() - job.failed_at.unwrap(),
            ChronoDuration::minutes(5)
        );
        assert_eq!(store.get(id).await.unwrap().unwrap(), job);

        assert!(store.rearm_due_retries().await.unwrap().is_empty());
        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(store.rearm_due_retries().await.unwrap(), vec![id]);

        store.claim(id).await.unwrap();
        let job = store
            .update_status(id, WorkflowStatus::Failed, StatusUpdate::failed("portal timeout"))
            .await
            .unwrap();
        assert!(job.requires_human_intervention);
        assert_eq!(job.intervention_reason.as_deref(), Some(MAX_RETRIES_EXCEEDED));

        let flagged = store.get_intervention_required().await.unwrap();
        assert_eq!(flagged.len(), 1);
        clock.advance(ChronoDuration::days(1));
        assert!(store.rearm_due_retries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_rows_reject_transitions() {
        let (store, _clock) = store().await;
        let id = store
            .enqueue(NewWorkflow::new("renewal_reminder", json!({})))
            .await
            .unwrap();
        store.cancel(id, Some("duplicate".into())).await.unwrap();

        let err = store
            .update_status(id, WorkflowStatus::InProgress, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, WorkflowStatus::Canceled);
        assert_eq!(job.error_message.as_deref(), Some("duplicate"));
    }

    #[tokio::test]
    async fn execution_log_and_stats() {
        let (store, _clock) = store().await;
        let id = store
            .enqueue(NewWorkflow::new("renewal_reminder", json!({})))
            .await
            .unwrap();
        store
            .enqueue(NewWorkflow::new("mc_filing", json!({})))
            .await
            .unwrap();

        store
            .log_execution_step(
                id,
                NewLogEntry::new("send_email", 2, StepStatus::Completed)
                    .with_output(json!({"sent": true}))
                    .with_duration_ms(42),
            )
            .await
            .unwrap();
        store
            .log_execution_step(
                id,
                NewLogEntry::new("load_company", 1, StepStatus::Started)
                    .with_input(json!({"companyId": "co-1"})),
            )
            .await
            .unwrap();

        let history = store.get_execution_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].step_name, "load_company");
        assert_eq!(history[0].input_data, Some(json!({"companyId": "co-1"})));
        assert!(history[0].completed_at.is_none());
        assert_eq!(history[1].output_data, Some(json!({"sent": true})));
        assert_eq!(history[1].duration_ms, 42);
        assert!(history[1].completed_at.is_some());

        assert!(matches!(
            store
                .log_execution_step(WorkflowId::new(), NewLogEntry::new("x", 1, StepStatus::Skipped))
                .await,
            Err(StoreError::NotFound(_))
        ));

        let stats = store.get_queue_stats().await.unwrap();
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.count(WorkflowStatus::Pending, "mc_filing"), 1);
        assert_eq!(stats.by_status()[&WorkflowStatus::Pending], 2);
    }
}
