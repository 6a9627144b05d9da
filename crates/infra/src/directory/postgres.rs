//! Postgres-backed subject directory over the CRUD service's `tasks` table.
//!
//! Only `task:<id>` subject references resolve; anything else is reported as
//! missing. Task enum columns are read as text and parsed case-insensitively,
//! and the naive `due_date` column is interpreted as UTC.

use chrono::NaiveDateTime;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use tactix_core::{DomainError, SubjectRef};
use tactix_tasks::{SubjectState, TaskPriority, TaskStatus};

use super::{DirectoryError, SubjectDirectory};

/// Reads task state straight from the CRUD database.
#[derive(Debug, Clone)]
pub struct PgTaskDirectory {
    pool: PgPool,
}

impl PgTaskDirectory {
    pub async fn connect(url: &str) -> Result<Self, DirectoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("connect failed: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SubjectDirectory for PgTaskDirectory {
    #[instrument(level = "debug", skip(self), fields(subject = %subject))]
    async fn subject_state(
        &self,
        subject: &SubjectRef,
    ) -> Result<Option<SubjectState>, DirectoryError> {
        let Some(task_id) = subject.task_id() else {
            debug!("not a task reference");
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT status::text AS status, priority::text AS priority, due_date, assignee_id
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| DirectoryError::Corrupt {
            subject: subject.clone(),
            reason,
        };

        let status: String = row.try_get("status").map_err(|e| corrupt(e.to_string()))?;
        let priority: String = row.try_get("priority").map_err(|e| corrupt(e.to_string()))?;
        let due_date: Option<NaiveDateTime> =
            row.try_get("due_date").map_err(|e| corrupt(e.to_string()))?;
        let assignee_id: Option<i32> =
            row.try_get("assignee_id").map_err(|e| corrupt(e.to_string()))?;

        let status: TaskStatus = status
            .parse()
            .map_err(|e: DomainError| corrupt(e.to_string()))?;
        let priority: TaskPriority = priority
            .parse()
            .map_err(|e: DomainError| corrupt(e.to_string()))?;

        Ok(Some(SubjectState::from_task(
            status,
            priority,
            due_date.map(|d| d.and_utc()),
            assignee_id.map(|id| format!("user:{id}")).into_iter().collect(),
        )))
    }
}
