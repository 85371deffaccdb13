//! `oozer status`: progress rollup for one plan or all plans.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use oozer_db::queries::{plans as plan_db, tasks as task_db};

pub async fn run_status(pool: &SqlitePool, plan_id: Option<i64>) -> Result<()> {
    match plan_id {
        None => {
            let plans = plan_db::list_plans(pool).await?;
            if plans.is_empty() {
                println!("No plans found.");
                return Ok(());
            }
            println!(
                "{:>6}  {:<10}  {:>8}  {:>8}  {:>8}  {:>8}  name",
                "id", "status", "pending", "running", "done", "failed"
            );
            for plan in plans {
                let progress = task_db::get_plan_progress(pool, plan.id).await?;
                println!(
                    "{:>6}  {:<10}  {:>8}  {:>8}  {:>8}  {:>8}  {}",
                    plan.id,
                    plan.status.to_string(),
                    progress.pending,
                    progress.running,
                    progress.done(),
                    progress.failed,
                    plan.name,
                );
            }
        }
        Some(plan_id) => {
            let plan = plan_db::get_plan(pool, plan_id)
                .await?
                .with_context(|| format!("plan {plan_id} not found"))?;
            let progress = task_db::get_plan_progress(pool, plan_id).await?;

            println!("Plan {} ({}) -- {}", plan.id, plan.name, plan.status);
            println!(
                "  {} total: {} pending, {} running, {} success, {} failed, {} canceled, {} skipped",
                progress.total,
                progress.pending,
                progress.running,
                progress.success,
                progress.failed,
                progress.canceled,
                progress.skipped,
            );

            let tasks = task_db::list_tasks_for_plan(pool, plan_id).await?;
            for task in tasks {
                let exit = task
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_owned());
                println!(
                    "  {:>6}  {:<9}  {:<12}  exit={:<4}  {}",
                    task.id,
                    task.status.to_string(),
                    task.task_type.to_string(),
                    exit,
                    task.name,
                );
            }
        }
    }
    Ok(())
}
