//! `oozer task` subcommands: operator cancel and retry.

use anyhow::Result;
use sqlx::SqlitePool;

use oozer_core::events::EventBus;
use oozer_core::state::dispatch;

use crate::TaskCommands;

pub async fn run_task_command(
    command: TaskCommands,
    pool: &SqlitePool,
    bus: &dyn EventBus,
) -> Result<()> {
    match command {
        TaskCommands::Cancel { task_id } => {
            let status = dispatch::cancel_task(pool, bus, task_id).await?;
            println!("Task {task_id} is now {status}");
        }
        TaskCommands::Retry { task_id } => {
            let status = dispatch::retry_task(pool, bus, task_id).await?;
            println!("Task {task_id} reset to {status}");
        }
    }
    Ok(())
}
