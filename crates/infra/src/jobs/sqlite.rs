//! SQLite-backed durable job store.
//!
//! Jobs live in a single `jobs` table. The idempotency key carries a unique
//! index, so concurrent upserts for one logical event collapse into one row
//! at the database level. Claims and outcome writes are single conditional
//! `UPDATE` statements, which makes them atomic across processes sharing the
//! database file.
//!
//! Timestamps are stored as unix milliseconds.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (any code) | `Storage` with the operation name |
//! | PoolClosed | `Storage` |
//! | Decode / ColumnNotFound | `Storage` |

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use tactix_core::{JobId, SubjectRef};

use super::store::{JobStats, JobStore, JobStoreError, check_claimable};
use super::types::{IdempotencyKey, Job, JobKind, JobOutcome, JobState, Priority};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id               TEXT PRIMARY KEY,
        subject          TEXT NOT NULL,
        kind             TEXT NOT NULL,
        idempotency_key  TEXT NOT NULL,
        anchor_at        INTEGER NOT NULL,
        due_at           INTEGER NOT NULL,
        priority         INTEGER NOT NULL,
        state            TEXT NOT NULL,
        attempt          INTEGER NOT NULL,
        max_attempts     INTEGER NOT NULL,
        interval_secs    INTEGER NULL,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT NULL,
        claimed_at       INTEGER NULL,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS jobs_idempotency_key ON jobs (idempotency_key)",
    "CREATE INDEX IF NOT EXISTS jobs_state_due_at ON jobs (state, due_at)",
    "CREATE INDEX IF NOT EXISTS jobs_subject_kind ON jobs (subject, kind)",
];

const COLUMNS: &str = "id, subject, kind, idempotency_key, anchor_at, due_at, priority, state, \
     attempt, max_attempts, interval_secs, cancel_requested, last_error, claimed_at, \
     created_at, updated_at";

/// Durable job store over a SQLite database file.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://tactix-jobs.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Each connection to `:memory:` is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(url = %url, "sqlite job store ready");
        Ok(store)
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `jobs` table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_by_key(&self, key: &IdempotencyKey) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE idempotency_key = ?1"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_by_key", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    async fn cancel_matching(
        &self,
        subject: &SubjectRef,
        kind: Option<JobKind>,
        keep: Option<&IdempotencyKey>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let kind = kind.map(|k| k.as_str());
        let keep = keep.map(|k| k.as_str());
        let now = now.timestamp_millis();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let scheduled = sqlx::query(
            r#"
            UPDATE jobs SET state = 'cancelled', updated_at = ?1
            WHERE subject = ?2
              AND (?3 IS NULL OR kind = ?3)
              AND (?4 IS NULL OR idempotency_key <> ?4)
              AND state = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(subject.as_str())
        .bind(kind)
        .bind(keep)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_scheduled", e))?;

        let running = sqlx::query(
            r#"
            UPDATE jobs SET cancel_requested = 1, updated_at = ?1
            WHERE subject = ?2
              AND (?3 IS NULL OR kind = ?3)
              AND (?4 IS NULL OR idempotency_key <> ?4)
              AND state = 'running'
              AND cancel_requested = 0
            "#,
        )
        .bind(now)
        .bind(subject.as_str())
        .bind(kind)
        .bind(keep)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_running", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok((scheduled.rows_affected() + running.rows_affected()) as usize)
    }
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(level = "debug", skip(self, job), fields(key = %job.idempotency_key))]
    async fn upsert(&self, job: Job) -> Result<Job, JobStoreError> {
        let interval_secs = job
            .interval_secs
            .map(|secs| {
                i64::try_from(secs).map_err(|_| {
                    JobStoreError::Storage(format!("interval_secs out of range: {secs}"))
                })
            })
            .transpose()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // A cancelled job under this key gives way to the incoming one.
        let replaced = sqlx::query(
            "DELETE FROM jobs WHERE idempotency_key = ?1 AND state = 'cancelled'",
        )
        .bind(job.idempotency_key.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replace_cancelled", e))?;

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO jobs ({COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                due_at = MAX(jobs.due_at, excluded.due_at),
                priority = excluded.priority,
                updated_at = excluded.updated_at
            WHERE jobs.state = 'scheduled'
              AND (excluded.due_at > jobs.due_at OR excluded.priority <> jobs.priority)
            "#
        ))
        .bind(job.id.to_string())
        .bind(job.subject.as_str())
        .bind(job.kind.as_str())
        .bind(job.idempotency_key.as_str())
        .bind(job.anchor_at.timestamp_millis())
        .bind(job.due_at.timestamp_millis())
        .bind(job.priority.as_i64())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempt))
        .bind(i64::from(job.max_attempts))
        .bind(interval_secs)
        .bind(job.cancel_requested)
        .bind(job.last_error.as_deref())
        .bind(job.claimed_at.map(|t| t.timestamp_millis()))
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(
            rows = result.rows_affected(),
            replaced = replaced.rows_affected(),
            "upsert applied"
        );

        self.fetch_by_key(&job.idempotency_key)
            .await?
            .ok_or_else(|| JobStoreError::Storage(format!("upserted job {} vanished", job.id)))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(level = "debug", skip(self))]
    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let now_ms = now.timestamp_millis();
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'running', attempt = attempt + 1, claimed_at = ?2, updated_at = ?2
            WHERE id = ?1
              AND state = 'scheduled'
              AND due_at <= ?2
              AND attempt < max_attempts
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?;

        if let Some(row) = claimed {
            return decode_job(&row);
        }

        // Claim refused: work out why.
        let job = self.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
        match check_claimable(&job, now) {
            Err(JobStoreError::AttemptsExhausted(id)) => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET state = 'failed', last_error = ?2, claimed_at = NULL, updated_at = ?3
                    WHERE id = ?1 AND state = 'scheduled' AND attempt >= max_attempts
                    "#,
                )
                .bind(id.to_string())
                .bind(format!("attempt limit of {} reached", job.max_attempts))
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("mark_exhausted", e))?;
                Err(JobStoreError::AttemptsExhausted(id))
            }
            Err(e) => Err(e),
            // Another worker moved it between the two statements.
            Ok(()) => Err(JobStoreError::AlreadyRunning(id)),
        }
    }

    #[instrument(level = "debug", skip(self, outcome), fields(outcome = outcome.label()))]
    async fn record_outcome(
        &self,
        id: JobId,
        claim_attempt: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut job = self.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
        let stale = JobStoreError::StaleClaim {
            id,
            attempt: claim_attempt,
        };
        if job.state != JobState::Running || job.attempt != claim_attempt {
            return Err(stale);
        }

        job.apply_outcome(outcome, now);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested = 1 AND ?3 = 'scheduled' THEN 'cancelled' ELSE ?3 END,
                due_at = ?4, last_error = ?5, claimed_at = NULL, updated_at = ?6
            WHERE id = ?1 AND state = 'running' AND attempt = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(i64::from(claim_attempt))
        .bind(job.state.as_str())
        .bind(job.due_at.timestamp_millis())
        .bind(job.last_error.as_deref())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_outcome", e))?;

        if result.rows_affected() == 0 {
            return Err(stale);
        }

        // Re-read so a cancel that raced the write is reflected.
        self.get(id).await?.ok_or(JobStoreError::NotFound(id))
    }

    async fn cancel(
        &self,
        subject: &SubjectRef,
        kind: Option<JobKind>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        self.cancel_matching(subject, kind, None, now).await
    }

    async fn cancel_superseded(
        &self,
        subject: &SubjectRef,
        kind: JobKind,
        keep: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        self.cancel_matching(subject, Some(kind), Some(keep), now)
            .await
    }

    async fn list_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM jobs
            WHERE state = 'scheduled' AND due_at <= ?1
            ORDER BY priority DESC, due_at ASC, id ASC
            LIMIT ?2
            "#
        ))
        .bind(before.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_due_before", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(level = "debug", skip(self))]
    async fn recover_stuck_running(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'scheduled' END,
                claimed_at = NULL,
                updated_at = ?2
            WHERE state = 'running' AND claimed_at <= ?1
            "#,
        )
        .bind(older_than.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stuck_running", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn list_for_subject(&self, subject: &SubjectRef) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE subject = ?1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(subject.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_subject", e))?;

        rows.iter().map(decode_job).collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let state = JobState::from_str(&state).map_err(|e| JobStoreError::Storage(e.to_string()))?;
            stats.count(state, n as usize);
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

fn decode_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))
        .and_then(Job::try_from)
}

// SQLx row type

#[derive(Debug)]
struct JobRow {
    id: String,
    subject: String,
    kind: String,
    idempotency_key: String,
    anchor_at: i64,
    due_at: i64,
    priority: i64,
    state: String,
    attempt: i64,
    max_attempts: i64,
    interval_secs: Option<i64>,
    cancel_requested: bool,
    last_error: Option<String>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            subject: row.try_get("subject")?,
            kind: row.try_get("kind")?,
            idempotency_key: row.try_get("idempotency_key")?,
            anchor_at: row.try_get("anchor_at")?,
            due_at: row.try_get("due_at")?,
            priority: row.try_get("priority")?,
            state: row.try_get("state")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            interval_secs: row.try_get("interval_secs")?,
            cancel_requested: row.try_get("cancel_requested")?,
            last_error: row.try_get("last_error")?,
            claimed_at: row.try_get("claimed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn millis(column: &str, ms: i64) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::Storage(format!("{column} out of range: {ms}")))
}

fn count(column: &str, value: i64) -> Result<u32, JobStoreError> {
    u32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("{column} out of range: {value}")))
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: tactix_core::DomainError| JobStoreError::Storage(e.to_string());

        let id = Uuid::from_str(&row.id)
            .map_err(|e| JobStoreError::Storage(format!("invalid job id {}: {}", row.id, e)))?;

        Ok(Job {
            id: JobId::from_uuid(id),
            subject: SubjectRef::new(row.subject).map_err(corrupt)?,
            kind: JobKind::from_str(&row.kind).map_err(corrupt)?,
            idempotency_key: IdempotencyKey::from_stored(row.idempotency_key),
            anchor_at: millis("anchor_at", row.anchor_at)?,
            due_at: millis("due_at", row.due_at)?,
            priority: Priority::from_i64(row.priority).map_err(corrupt)?,
            state: JobState::from_str(&row.state).map_err(corrupt)?,
            attempt: count("attempt", row.attempt)?,
            max_attempts: count("max_attempts", row.max_attempts)?,
            interval_secs: row
                .interval_secs
                .map(|secs| {
                    u64::try_from(secs).map_err(|_| {
                        JobStoreError::Storage(format!("interval_secs out of range: {secs}"))
                    })
                })
                .transpose()?,
            cancel_requested: row.cancel_requested,
            last_error: row.last_error,
            claimed_at: row
                .claimed_at
                .map(|ms| millis("claimed_at", ms))
                .transpose()?,
            created_at: millis("created_at", row.created_at)?,
            updated_at: millis("updated_at", row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    async fn memory_store() -> SqliteJobStore {
        SqliteJobStore::connect("sqlite::memory:").await.unwrap()
    }

    fn reminder(task: i64, at: DateTime<Utc>) -> Job {
        Job::new(
            SubjectRef::task(task),
            JobKind::DeadlineReminder,
            at,
            ChronoDuration::seconds(60),
            t0(),
        )
    }

    #[tokio::test]
    async fn row_round_trips_every_column() {
        let store = memory_store().await;
        let job = reminder(5, t0())
            .with_priority(Priority::Urgent)
            .with_max_attempts(3)
            .every(3600);
        store.upsert(job.clone()).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
    }

    #[tokio::test]
    async fn upsert_merges_only_scheduled_rows() {
        let store = memory_store().await;
        let first = store.upsert(reminder(1, t0())).await.unwrap();

        let later = reminder(1, t0() + ChronoDuration::seconds(30)).with_priority(Priority::High);
        let merged = store.upsert(later).await.unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.due_at, t0() + ChronoDuration::seconds(30));
        assert_eq!(merged.priority, Priority::High);

        let earlier = reminder(1, t0());
        let merged = store.upsert(earlier).await.unwrap();
        assert_eq!(merged.due_at, t0() + ChronoDuration::seconds(30));

        let claim_at = t0() + ChronoDuration::minutes(1);
        store.mark_running(first.id, claim_at).await.unwrap();
        let rejected = store
            .upsert(reminder(1, t0() + ChronoDuration::seconds(50)))
            .await
            .unwrap();
        assert_eq!(rejected.state, JobState::Running);
        assert_eq!(rejected.due_at, t0() + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn upsert_replaces_cancelled_row() {
        let store = memory_store().await;
        let first = store.upsert(reminder(1, t0())).await.unwrap();
        store.cancel(&SubjectRef::task(1), None, t0()).await.unwrap();

        let again = reminder(1, t0());
        let revived = store.upsert(again.clone()).await.unwrap();
        assert_eq!(revived.id, again.id);
        assert_eq!(revived.state, JobState::Scheduled);
        assert_eq!(revived.attempt, 0);
        assert!(store.get(first.id).await.unwrap().is_none());

        store.mark_running(revived.id, t0()).await.unwrap();
        store
            .record_outcome(revived.id, 1, JobOutcome::Delivered, t0())
            .await
            .unwrap();
        let sticky = store.upsert(reminder(1, t0())).await.unwrap();
        assert_eq!(sticky.id, revived.id);
        assert_eq!(sticky.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn oversized_interval_is_rejected() {
        let store = memory_store().await;
        let err = store
            .upsert(reminder(1, t0()).every(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Storage(_)));
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn claim_then_outcome() {
        let store = memory_store().await;
        let job = store.upsert(reminder(1, t0())).await.unwrap();

        let claimed = store.mark_running(job.id, t0()).await.unwrap();
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.claimed_at, Some(t0()));
        assert!(matches!(
            store.mark_running(job.id, t0()).await,
            Err(JobStoreError::AlreadyRunning(_))
        ));

        let retry_at = t0() + ChronoDuration::seconds(30);
        let rescheduled = store
            .record_outcome(
                job.id,
                1,
                JobOutcome::RetryAt {
                    at: retry_at,
                    error: "timeout".into(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(rescheduled.state, JobState::Scheduled);
        assert_eq!(rescheduled.due_at, retry_at);
        assert!(rescheduled.claimed_at.is_none());
    }

    #[tokio::test]
    async fn cancel_flags_running_rows() {
        let store = memory_store().await;
        let job = store.upsert(reminder(1, t0())).await.unwrap();
        store.mark_running(job.id, t0()).await.unwrap();

        assert_eq!(store.cancel(&SubjectRef::task(1), None, t0()).await.unwrap(), 1);

        let done = store
            .record_outcome(
                job.id,
                1,
                JobOutcome::RetryAt {
                    at: t0(),
                    error: "timeout".into(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn stats_group_by_state() {
        let store = memory_store().await;
        let a = store.upsert(reminder(1, t0())).await.unwrap();
        store.upsert(reminder(2, t0())).await.unwrap();
        store.mark_running(a.id, t0()).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 2);
    }
}
