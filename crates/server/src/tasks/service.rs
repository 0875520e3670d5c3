//! Task queue service.
//!
//! Postgres-backed, priority-ordered queue with at-most-one-in-flight
//! semantics per (function, params): a unique index on the pair makes a
//! duplicate submission return the existing task instead of a second
//! row.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{Task, TaskOutcome, TaskParams, TaskPriority, TaskStatus};

/// Service for submitting and tracking background tasks.
#[derive(Clone)]
pub struct TaskService {
    pool: PgPool,
}

impl TaskService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Submit a task. Returns the task row and whether this call created
    /// it; a pending, active or still-kept duplicate is returned as-is.
    pub async fn submit(
        &self,
        name: &str,
        params: &TaskParams,
        priority: TaskPriority,
        keep_for_secs: i32,
        owner_id: Option<Uuid>,
    ) -> Result<(Task, bool)> {
        let funcname = params.funcname();
        let encoded = serde_json::to_value(params).context("failed to encode task params")?;

        let inserted = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (id, owner_id, name, funcname, params, priority, keep_for_secs)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (funcname, params) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(owner_id)
        .bind(name)
        .bind(funcname)
        .bind(&encoded)
        .bind(priority.as_i16())
        .bind(keep_for_secs)
        .fetch_optional(&self.pool)
        .await
        .context("failed to submit task")?;

        match inserted {
            Some(task) => {
                info!(task_id = %task.id, function = %funcname, "task submitted");
                Ok((task, true))
            }
            None => {
                let existing = sqlx::query_as::<_, Task>(
                    "SELECT * FROM tasks WHERE funcname = $1 AND params = $2",
                )
                .bind(funcname)
                .bind(&encoded)
                .fetch_one(&self.pool)
                .await
                .context("failed to fetch duplicate task")?;

                debug!(task_id = %existing.id, function = %funcname, "task already submitted");
                Ok((existing, false))
            }
        }
    }

    /// Fetch a task by ID.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch task")?;
        Ok(task)
    }

    /// Poll a task to completion, refreshing only status and result.
    /// Returns None when the timeout expires first.
    pub async fn wait_for(&self, id: Uuid, timeout: Duration) -> Result<Option<Task>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(task) = self.get(id).await? else {
                return Ok(None);
            };
            if task.status() == TaskStatus::Complete {
                return Ok(Some(task));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// The next dispatchable tasks, priority then insertion order.
    pub async fn peek_pending(&self, limit: i64) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status = 0 AND lock_id IS NULL
            ORDER BY priority ASC, created ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending tasks")?;
        Ok(tasks)
    }

    /// Atomically lock one pending task to a worker. The transition is
    /// conditional; a concurrent claimer losing the race gets None.
    pub async fn claim(&self, id: Uuid, lock_id: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 1, lock_id = $2, started = NOW()
            WHERE id = $1 AND status = 0 AND lock_id IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim task")?;
        Ok(task)
    }

    /// Store a finished task's outcome and start its keep timer.
    pub async fn complete(&self, id: Uuid, outcome: &TaskOutcome) -> Result<()> {
        let result = serde_json::to_value(outcome).context("failed to encode task outcome")?;
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 2,
                result = $2,
                completed = NOW(),
                keep_until = NOW() + make_interval(secs => keep_for_secs)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .context("failed to complete task")?;
        Ok(())
    }

    /// Reset tasks locked by a previous instance (crash recovery): any
    /// active row whose lock id starts with the given prefix goes back
    /// to pending.
    pub async fn reset_stale(&self, lock_prefix: &str) -> Result<u64> {
        let pattern = format!("{}%", lock_prefix.replace('%', "\\%").replace('_', "\\_"));
        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 0, lock_id = NULL, started = NULL
            WHERE status = 1 AND lock_id LIKE $1
            "#,
        )
        .bind(pattern)
        .execute(&self.pool)
        .await
        .context("failed to reset stale tasks")?
        .rows_affected();

        if affected > 0 {
            info!(count = affected, "reset tasks from previous instance");
        }
        Ok(affected)
    }

    /// Sweep completed tasks past their keep-until time.
    pub async fn purge_expired(&self) -> Result<u64> {
        let affected =
            sqlx::query("DELETE FROM tasks WHERE status = 2 AND keep_until < NOW()")
                .execute(&self.pool)
                .await
                .context("failed to purge expired tasks")?
                .rows_affected();

        if affected > 0 {
            debug!(count = affected, "purged expired tasks");
        }
        Ok(affected)
    }

    /// Number of tasks currently active (for monitoring).
    pub async fn active_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 1")
            .fetch_one(&self.pool)
            .await
            .context("failed to count active tasks")?;
        Ok(count)
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService").finish()
    }
}
