//! Operator task operations: cancel and retry.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use oozer_db::models::TaskStatus;
use oozer_db::queries::tasks as task_db;

use crate::events::{Event, EventBus};

/// Cancel a task.
///
/// Terminal tasks are returned unchanged (cancel is idempotent). An active
/// task becomes CANCELED with `ended_at` stamped. Cancel does not kill an
/// already-running child process; it only marks the row.
pub async fn cancel_task(pool: &SqlitePool, bus: &dyn EventBus, task_id: i64) -> Result<TaskStatus> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if task.status.is_terminal() {
        return Ok(task.status);
    }

    let rows = task_db::cancel_task_if_active(pool, task_id, Utc::now()).await?;
    if rows == 0 {
        // Lost a race against the executor's terminal write; report what
        // the row says now.
        let task = task_db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;
        return Ok(task.status);
    }

    bus.publish(&Event::TaskCanceled {
        plan_id: task.plan_id,
        task_id,
    })
    .await;

    Ok(TaskStatus::Canceled)
}

/// Reset a task to PENDING for another attempt.
///
/// Increments the attempt counter and clears stdout, stderr, exit_code,
/// pid, and both timestamps.
pub async fn retry_task(pool: &SqlitePool, bus: &dyn EventBus, task_id: i64) -> Result<TaskStatus> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    task_db::reset_task_for_retry(pool, task_id).await?;

    bus.publish(&Event::TaskRetried {
        plan_id: task.plan_id,
        task_id,
    })
    .await;

    Ok(TaskStatus::Pending)
}
