//! Shared test utilities for oozer integration tests.
//!
//! Each test gets its own file-backed SQLite database inside a
//! [`tempfile::TempDir`] with all migrations applied. File-backed (rather
//! than `:memory:`) because a pool hands out multiple connections and each
//! in-memory connection would see a different database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;

use oozer_db::config::DbConfig;
use oozer_db::models::{Plan, PlanStatus, Task, TaskType};
use oozer_db::pool;

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`. Keep the [`TempDir`] alive for the duration of
/// the test; dropping it deletes the database file.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("oozer_test.db");

    let config = DbConfig::new(format!("sqlite://{}", db_path.display()));
    let db_pool = pool::create_pool(&config)
        .await
        .expect("failed to open temp database");

    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (db_pool, dir)
}

/// Insert a plan with the given status and return it.
pub async fn seed_plan(
    pool: &SqlitePool,
    name: &str,
    status: PlanStatus,
    use_rest: bool,
    max_concurrency: i64,
    oozie_url: &str,
) -> Plan {
    let now = Utc::now();
    sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (name, description, status, oozie_url, use_rest, max_concurrency, \
                            created_by, created_at, updated_at) \
         VALUES (?, '', ?, ?, ?, ?, 'test', ?, ?) \
         RETURNING *",
    )
    .bind(name)
    .bind(status)
    .bind(oozie_url)
    .bind(use_rest)
    .bind(max_concurrency)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .expect("failed to seed plan")
}

/// Seed parameters for a task row. `Default` gives a workflow task with
/// empty type-specific fields.
#[derive(Debug, Clone)]
pub struct TaskSeed {
    pub name: String,
    pub task_type: TaskType,
    pub job_id: String,
    pub action: String,
    pub date: String,
    pub coordinator: String,
    pub wf_failnodes: bool,
    pub wf_skip_nodes: String,
    pub refresh: bool,
    pub failed: bool,
    pub extra_props: BTreeMap<String, String>,
}

impl Default for TaskSeed {
    fn default() -> Self {
        Self {
            name: "task".to_owned(),
            task_type: TaskType::Workflow,
            job_id: "0000000-000000000000000-oozie-W".to_owned(),
            action: String::new(),
            date: String::new(),
            coordinator: String::new(),
            wf_failnodes: false,
            wf_skip_nodes: String::new(),
            refresh: false,
            failed: false,
            extra_props: BTreeMap::new(),
        }
    }
}

/// Insert a PENDING task for a plan and return it.
pub async fn seed_task(pool: &SqlitePool, plan_id: i64, seed: &TaskSeed) -> Task {
    let extra_props = serde_json::to_string(&seed.extra_props).expect("serialize extra_props");
    sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (plan_id, name, type, job_id, action, date, coordinator, \
                            wf_failnodes, wf_skip_nodes, refresh, failed, extra_props) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(plan_id)
    .bind(&seed.name)
    .bind(seed.task_type)
    .bind(&seed.job_id)
    .bind(&seed.action)
    .bind(&seed.date)
    .bind(&seed.coordinator)
    .bind(seed.wf_failnodes)
    .bind(&seed.wf_skip_nodes)
    .bind(seed.refresh)
    .bind(seed.failed)
    .bind(extra_props)
    .fetch_one(pool)
    .await
    .expect("failed to seed task")
}

/// Write a fake `oozie` binary into `dir` that prints its arguments to
/// stdout and exits with `exit_code`.
///
/// Lets worker end-to-end tests run the real executor pipeline without an
/// Oozie installation.
pub fn fake_oozie_bin(dir: &Path, exit_code: i32) -> PathBuf {
    let path = dir.join("oozie");
    let script = format!("#!/bin/sh\necho \"$@\"\nexit {exit_code}\n");
    std::fs::write(&path, script).expect("failed to write fake oozie binary");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("failed to chmod fake oozie binary");
    }

    path
}

/// Write a fake `oozie` binary that sleeps for `sleep_secs` before exiting
/// 0. Used by timeout tests.
pub fn slow_oozie_bin(dir: &Path, sleep_secs: u32) -> PathBuf {
    let path = dir.join("oozie-slow");
    let script = format!("#!/bin/sh\nsleep {sleep_secs}\nexit 0\n");
    std::fs::write(&path, script).expect("failed to write slow oozie binary");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("failed to chmod slow oozie binary");
    }

    path
}
