//! Plan authoring: the operator-facing plan/task spec, its validation, and
//! the transactional insert.
//!
//! The same [`PlanSpec`] serves the JSON API body and the `plan.toml` file
//! consumed by `oozer plan create`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use oozer_db::models::{Plan, Task, TaskType};

use crate::events::{Event, EventBus};

/// Validation failures for an authored plan.
///
/// Raised before any row is written; the API surfaces them as 400s.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanSpecError {
    #[error("plan name must not be empty")]
    EmptyName,

    #[error("max_concurrency must be between 1 and 64")]
    MaxConcurrencyOutOfRange,

    #[error("task {0:?}: job_id must not be empty")]
    EmptyJobId(String),

    #[error("task {0:?}: coordinator rerun requires action or date")]
    CoordinatorMissingSelector(String),

    #[error("task {0:?}: bundle rerun requires coordinator or date")]
    BundleMissingSelector(String),
}

/// An authored plan with its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub oozie_url: String,
    #[serde(default)]
    pub use_rest: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: i64,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// A single task within an authored plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub job_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub coordinator: String,
    #[serde(default)]
    pub wf_failnodes: bool,
    #[serde(default)]
    pub wf_skip_nodes: String,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub extra_props: BTreeMap<String, String>,
}

fn default_max_concurrency() -> i64 {
    1
}

impl PlanSpec {
    /// Check the authoring invariants: non-empty name, concurrency bounds,
    /// and per-type rerun selectors.
    pub fn validate(&self) -> Result<(), PlanSpecError> {
        if self.name.trim().is_empty() {
            return Err(PlanSpecError::EmptyName);
        }
        if !(1..=64).contains(&self.max_concurrency) {
            return Err(PlanSpecError::MaxConcurrencyOutOfRange);
        }
        for task in &self.tasks {
            if task.job_id.trim().is_empty() {
                return Err(PlanSpecError::EmptyJobId(task.name.clone()));
            }
            match task.task_type {
                TaskType::Coordinator => {
                    if task.action.is_empty() && task.date.is_empty() {
                        return Err(PlanSpecError::CoordinatorMissingSelector(task.name.clone()));
                    }
                }
                TaskType::Bundle => {
                    if task.coordinator.is_empty() && task.date.is_empty() {
                        return Err(PlanSpecError::BundleMissingSelector(task.name.clone()));
                    }
                }
                TaskType::Workflow => {}
            }
        }
        Ok(())
    }
}

/// Create a plan and all its tasks inside a single transaction.
///
/// The plan starts in DRAFT and every task in PENDING. Publishes
/// `plan_created` after the commit.
pub async fn create_plan(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    spec: &PlanSpec,
    created_by: &str,
) -> Result<Plan> {
    spec.validate()
        .with_context(|| format!("invalid plan {:?}", spec.name))?;

    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (name, description, status, oozie_url, use_rest, max_concurrency, \
                            created_by, created_at, updated_at) \
         VALUES (?, ?, 'DRAFT', ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&spec.name)
    .bind(&spec.description)
    .bind(&spec.oozie_url)
    .bind(spec.use_rest)
    .bind(spec.max_concurrency)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert plan")?;

    for task in &spec.tasks {
        let extra_props =
            serde_json::to_string(&task.extra_props).context("failed to serialize extra_props")?;
        sqlx::query(
            "INSERT INTO tasks (plan_id, name, type, job_id, action, date, coordinator, \
                                wf_failnodes, wf_skip_nodes, refresh, failed, extra_props) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(plan.id)
        .bind(&task.name)
        .bind(task.task_type)
        .bind(&task.job_id)
        .bind(&task.action)
        .bind(&task.date)
        .bind(&task.coordinator)
        .bind(task.wf_failnodes)
        .bind(&task.wf_skip_nodes)
        .bind(task.refresh)
        .bind(task.failed)
        .bind(extra_props)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert task {:?}", task.name))?;
    }

    tx.commit().await.context("failed to commit transaction")?;

    bus.publish(&Event::PlanCreated { plan_id: plan.id }).await;

    Ok(plan)
}

/// Fetch a plan and all its tasks.
pub async fn get_plan_with_tasks(pool: &SqlitePool, plan_id: i64) -> Result<(Plan, Vec<Task>)> {
    let plan = oozer_db::queries::plans::get_plan(pool, plan_id)
        .await?
        .with_context(|| format!("plan {plan_id} not found"))?;

    let tasks = oozer_db::queries::tasks::list_tasks_for_plan(pool, plan_id).await?;

    Ok((plan, tasks))
}
