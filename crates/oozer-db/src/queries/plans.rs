//! Database query functions for the `plans` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Plan, PlanStatus};

/// Fetch a plan by its ID.
pub async fn get_plan(pool: &SqlitePool, id: i64) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

/// List all plans, newest first.
pub async fn list_plans(pool: &SqlitePool) -> Result<Vec<Plan>> {
    let plans = sqlx::query_as::<_, Plan>("SELECT * FROM plans ORDER BY id DESC")
        .fetch_all(pool)
        .await
        .context("failed to list plans")?;

    Ok(plans)
}

/// List all plans currently in `RUNNING` status, oldest first.
///
/// This is the worker loop's per-iteration scan.
pub async fn list_running_plans(pool: &SqlitePool) -> Result<Vec<Plan>> {
    let plans =
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE status = 'RUNNING' ORDER BY id ASC")
            .fetch_all(pool)
            .await
            .context("failed to list running plans")?;

    Ok(plans)
}

/// Write a terminal rollup status for a plan, but only if it is still
/// `RUNNING`.
///
/// The status guard makes the worker's completion aggregation safe against
/// concurrent operator transitions (stop, pause): whoever moved the plan
/// out of `RUNNING` first wins, and the rollup becomes a no-op. Returns
/// the number of rows updated.
pub async fn finalize_plan_if_running(
    pool: &SqlitePool,
    id: i64,
    status: PlanStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plans SET status = ?, updated_at = ? WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finalize plan")?;

    Ok(result.rows_affected())
}
