//! Database query functions for the `tasks` table.
//!
//! The atomic claim ([`claim_task`]) is the only cluster-wide mutex in the
//! system: a conditional UPDATE on `status = 'PENDING'` that exactly one
//! caller wins. Everything else builds on it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Task, TaskStatus};

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a given plan, in creation (= dispatch) order.
pub async fn list_tasks_for_plan(pool: &SqlitePool, plan_id: i64) -> Result<Vec<Task>> {
    let tasks =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE plan_id = ? ORDER BY id ASC")
            .bind(plan_id)
            .fetch_all(pool)
            .await
            .context("failed to list tasks for plan")?;

    Ok(tasks)
}

/// Fetch up to `limit` PENDING tasks of a plan, ascending by task id.
///
/// Ascending id is FIFO by creation, which is the dispatch order the
/// worker promises within a plan.
pub async fn list_pending_tasks(pool: &SqlitePool, plan_id: i64, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE plan_id = ? AND status = 'PENDING' \
         ORDER BY id ASC \
         LIMIT ?",
    )
    .bind(plan_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// Atomically claim a PENDING task: set `RUNNING`, stamp `started_at`, and
/// increment the attempt counter.
///
/// The WHERE clause includes `status = 'PENDING'`, so of any number of
/// workers racing on the same task exactly one sees a row count of 1.
/// Returns the number of rows updated (0 means another worker won).
pub async fn claim_task(pool: &SqlitePool, id: i64, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'RUNNING', started_at = ?, attempt = attempt + 1 \
         WHERE id = ? AND status = 'PENDING'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Record the child process id for a running task.
pub async fn record_pid(pool: &SqlitePool, id: i64, pid: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE tasks SET pid = ? WHERE id = ?")
        .bind(pid)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to record task pid")?;

    Ok(())
}

/// Write the terminal result of a task execution.
///
/// Sets the captured command/stdout/stderr/exit_code, stamps `ended_at`,
/// and moves the task to `status`. The caller is responsible for trimming
/// stdout/stderr to the configured caps before writing.
#[allow(clippy::too_many_arguments)]
pub async fn finish_task(
    pool: &SqlitePool,
    id: i64,
    command: &str,
    stdout: &str,
    stderr: &str,
    exit_code: i64,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET command = ?, stdout = ?, stderr = ?, exit_code = ?, status = ?, ended_at = ? \
         WHERE id = ?",
    )
    .bind(command)
    .bind(stdout)
    .bind(stderr)
    .bind(exit_code)
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to write task result")?;

    Ok(result.rows_affected())
}

/// Cancel a task if it has not reached a terminal status yet.
///
/// Conditional on `status IN ('PENDING', 'RUNNING')` so that cancel is
/// idempotent on terminal tasks (row count 0, nothing overwritten).
pub async fn cancel_task_if_active(pool: &SqlitePool, id: i64, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'CANCELED', ended_at = ? \
         WHERE id = ? AND status IN ('PENDING', 'RUNNING')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected())
}

/// Reset a task to PENDING for an operator retry.
///
/// Increments the attempt counter and clears the captured outputs,
/// exit code, pid, and timestamps. The captured `command` is kept for the
/// audit trail.
pub async fn reset_task_for_retry(pool: &SqlitePool, id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'PENDING', \
             attempt = attempt + 1, \
             stdout = '', \
             stderr = '', \
             exit_code = NULL, \
             pid = NULL, \
             started_at = NULL, \
             ended_at = NULL \
         WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to reset task for retry")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Progress rollup
// -----------------------------------------------------------------------

/// Status counts for a plan's tasks.
#[derive(Debug, Clone, Default)]
pub struct PlanProgress {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub canceled: i64,
    pub skipped: i64,
    pub total: i64,
}

impl PlanProgress {
    /// Count of tasks in a terminal status.
    pub fn done(&self) -> i64 {
        self.success + self.failed + self.canceled + self.skipped
    }
}

/// Get a summary of task counts by status for a given plan.
pub async fn get_plan_progress(pool: &SqlitePool, plan_id: i64) -> Result<PlanProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) as cnt \
         FROM tasks \
         WHERE plan_id = ? \
         GROUP BY status",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to get plan progress")?;

    let mut progress = PlanProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "PENDING" => progress.pending = *count,
            "RUNNING" => progress.running = *count,
            "SUCCESS" => progress.success = *count,
            "FAILED" => progress.failed = *count,
            "CANCELED" => progress.canceled = *count,
            "SKIPPED" => progress.skipped = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
