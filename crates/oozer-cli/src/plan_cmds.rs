//! `oozer plan` subcommands: create from a TOML file, show, and lifecycle
//! transitions.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use oozer_core::events::EventBus;
use oozer_core::plan::{self, PlanSpec};
use oozer_core::state;
use oozer_db::models::PlanStatus;
use oozer_db::queries::plans as plan_db;

use crate::PlanCommands;

pub async fn run_plan_command(
    command: PlanCommands,
    pool: &SqlitePool,
    bus: &dyn EventBus,
) -> Result<()> {
    match command {
        PlanCommands::Create { file } => cmd_create(pool, bus, &file).await,
        PlanCommands::Show { plan_id } => cmd_show(pool, plan_id).await,
        PlanCommands::Start { plan_id } => cmd_transition(pool, bus, plan_id, PlanStatus::Running).await,
        PlanCommands::Pause { plan_id } => cmd_transition(pool, bus, plan_id, PlanStatus::Paused).await,
        PlanCommands::Resume { plan_id } => cmd_transition(pool, bus, plan_id, PlanStatus::Running).await,
        PlanCommands::Stop { plan_id } => cmd_transition(pool, bus, plan_id, PlanStatus::Stopped).await,
    }
}

async fn cmd_create(pool: &SqlitePool, bus: &dyn EventBus, file: &str) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read plan file {file}"))?;
    let spec: PlanSpec =
        toml::from_str(&contents).with_context(|| format!("failed to parse plan file {file}"))?;
    spec.validate()
        .with_context(|| format!("invalid plan file {file}"))?;

    let whoami = std::env::var("USER").unwrap_or_else(|_| "cli".to_owned());
    let plan = plan::create_plan(pool, bus, &spec, &whoami).await?;

    println!("Created plan {} ({})", plan.id, plan.name);
    println!("  tasks: {}", spec.tasks.len());
    println!("  max_concurrency: {}", plan.max_concurrency);
    println!("  use_rest: {}", plan.use_rest);
    println!();
    println!("Start it with: oozer plan start {}", plan.id);
    Ok(())
}

async fn cmd_show(pool: &SqlitePool, plan_id: Option<i64>) -> Result<()> {
    match plan_id {
        None => {
            let plans = plan_db::list_plans(pool).await?;
            if plans.is_empty() {
                println!("No plans found.");
                return Ok(());
            }
            for plan in plans {
                println!("{:>6}  {:<10}  {}", plan.id, plan.status.to_string(), plan.name);
            }
        }
        Some(plan_id) => {
            let (plan, tasks) = plan::get_plan_with_tasks(pool, plan_id).await?;
            println!("Plan {} ({})", plan.id, plan.name);
            println!("  status: {}", plan.status);
            println!("  oozie_url: {}", if plan.oozie_url.is_empty() { "<default>" } else { &plan.oozie_url });
            println!("  use_rest: {}", plan.use_rest);
            println!("  max_concurrency: {}", plan.max_concurrency);
            println!("  created_by: {}", plan.created_by);
            println!("  tasks:");
            for task in tasks {
                println!(
                    "    {:>6}  {:<9}  {:<12}  {}  (attempt {})",
                    task.id,
                    task.status.to_string(),
                    task.task_type.to_string(),
                    task.job_id,
                    task.attempt,
                );
            }
        }
    }
    Ok(())
}

async fn cmd_transition(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    plan_id: i64,
    target: PlanStatus,
) -> Result<()> {
    let plan = state::transition_plan(pool, bus, plan_id, target).await?;
    println!("Plan {} is now {}", plan.id, plan.status);
    Ok(())
}
