//! Per-task execution pipeline.
//!
//! Claim -> pre-hook -> REST attempt -> CLI fallback -> terminal write.
//! Errors never escape a task: anything unexpected marks the task FAILED
//! with the error text in stderr, and a lost claim simply returns.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use oozer_db::models::{PlanStatus, Task, TaskStatus, TaskType};
use oozer_db::queries::{plans as plan_db, tasks as task_db};

use crate::events::{Event, EventBus};
use crate::oozie::{self, OozieClient, OozieError};
use crate::settings::Settings;
use crate::worker::hook::PreTaskHook;
use crate::worker::process::{self, truncate_utf8};

/// The slice of [`Settings`] the executor needs, resolved once per worker.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub oozie_bin: String,
    pub oozie_default_url: String,
    pub http_timeout: Duration,
    pub task_timeout: Duration,
    pub max_stdout: usize,
    pub max_stderr: usize,
    pub rest_fallback_to_cli: bool,
    pub worker_id: String,
    pub hook: PreTaskHook,
}

impl ExecSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            oozie_bin: settings.oozie_bin.clone(),
            oozie_default_url: settings.oozie_default_url.clone(),
            http_timeout: settings.oozie_http_timeout(),
            task_timeout: settings.task_timeout(),
            max_stdout: settings.max_stdout,
            max_stderr: settings.max_stderr,
            rest_fallback_to_cli: settings.rest_fallback_to_cli,
            worker_id: settings.worker_id.clone(),
            hook: PreTaskHook::resolve(&settings.pre_task_cmd, &settings.pre_task_shell_cmd),
        }
    }
}

/// Run one task to a terminal status.
///
/// Aborts silently when the plan or task is gone, the plan is no longer
/// RUNNING, or another worker won the claim.
pub async fn run_task(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    cfg: &ExecSettings,
    plan_id: i64,
    task_id: i64,
) {
    if let Err(e) = try_run_task(pool, bus, cfg, plan_id, task_id).await {
        error!(plan_id, task_id, error = %e, "task execution failed");
        // If the claim went through, leave an audit trail on the row
        // instead of a task stuck in RUNNING.
        fail_if_still_running(pool, bus, cfg, plan_id, task_id, &e).await;
    }
}

async fn try_run_task(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    cfg: &ExecSettings,
    plan_id: i64,
    task_id: i64,
) -> Result<()> {
    let Some(plan) = plan_db::get_plan(pool, plan_id).await? else {
        return Ok(());
    };
    let Some(task) = task_db::get_task(pool, task_id).await? else {
        return Ok(());
    };
    if plan.status != PlanStatus::Running || task.status != TaskStatus::Pending {
        return Ok(());
    }

    // Atomic claim: exactly one worker moves PENDING -> RUNNING.
    let claimed = task_db::claim_task(pool, task_id, Utc::now()).await?;
    if claimed == 0 {
        debug!(task_id, "claim lost to another worker");
        return Ok(());
    }

    bus.publish(&Event::TaskStarted {
        plan_id,
        task_id,
        worker_id: cfg.worker_id.clone(),
    })
    .await;

    // Pre-hook. A non-zero exit fails the task before anything reaches
    // the orchestrator.
    match cfg
        .hook
        .run(cfg.task_timeout, cfg.max_stdout, cfg.max_stderr)
        .await
    {
        Ok(None) => {}
        Ok(Some(out)) if out.exit_code == 0 => {}
        Ok(Some(out)) => {
            finish(
                pool, bus, cfg, plan_id, task_id,
                "PRE_TASK_CMD",
                &out.stdout,
                &out.stderr,
                out.exit_code,
            )
            .await?;
            return Ok(());
        }
        Err(e) => {
            finish(
                pool, bus, cfg, plan_id, task_id,
                "PRE_TASK_CMD",
                "",
                &format!("pre-task hook failed to start: {e:#}"),
                1,
            )
            .await?;
            return Ok(());
        }
    }

    // REST attempt, workflow-only. On failure the error becomes a stderr
    // preamble and the CLI takes over (when fallback is enabled). A
    // missing base URL skips straight to the CLI, which reports the
    // configuration error with the proper text.
    let mut rest_preamble = String::new();
    if plan.use_rest && task.task_type == TaskType::Workflow {
        if let Ok(base_url) = oozie::command::effective_oozie_url(&plan, &cfg.oozie_default_url) {
            match workflow_rest_rerun(&base_url, &task, cfg).await {
                Ok((command, stdout)) => {
                    finish(pool, bus, cfg, plan_id, task_id, &command, &stdout, "", 0).await?;
                    return Ok(());
                }
                Err(e) => {
                    let detail = format!("REST rerun failed ({}): {e}", rest_error_kind(&e));
                    if !cfg.rest_fallback_to_cli {
                        finish(pool, bus, cfg, plan_id, task_id, "", "", &detail, 1).await?;
                        return Ok(());
                    }
                    rest_preamble = format!("{detail}\nFalling back to CLI rerun.");
                }
            }
        }
    }

    // CLI path.
    let argv = match oozie::build_cli_command(&plan, &task, &cfg.oozie_bin, &cfg.oozie_default_url)
    {
        Ok(argv) => argv,
        Err(e) => {
            let stderr = join_stderr(&rest_preamble, &e.to_string());
            finish(pool, bus, cfg, plan_id, task_id, "", "", &stderr, 1).await?;
            return Ok(());
        }
    };
    let command_text = oozie::render_command(&argv);

    let child = match process::spawn_argv(&argv) {
        Ok(child) => child,
        Err(e) => {
            let stderr = join_stderr(&rest_preamble, &format!("{e:#}"));
            finish(pool, bus, cfg, plan_id, task_id, &command_text, "", &stderr, 1).await?;
            return Ok(());
        }
    };

    task_db::record_pid(pool, task_id, child.pid()).await?;

    let out = child
        .wait(cfg.task_timeout, cfg.max_stdout, cfg.max_stderr)
        .await
        .context("failed waiting on oozie CLI child")?;

    let stderr = join_stderr(&rest_preamble, &out.stderr);
    finish(
        pool,
        bus,
        cfg,
        plan_id,
        task_id,
        &command_text,
        &out.stdout,
        &stderr,
        out.exit_code,
    )
    .await?;

    Ok(())
}

/// REST rerun of a workflow task. Returns the display command and the
/// response JSON for the task's stdout.
async fn workflow_rest_rerun(
    base_url: &str,
    task: &Task,
    cfg: &ExecSettings,
) -> Result<(String, String), OozieError> {
    let client = OozieClient::new(base_url, cfg.http_timeout)?;
    let conf = oozie::workflow_conf(task);
    let response = client.rerun(&task.job_id, Some(&conf), None).await?;

    let command = format!(
        "REST PUT {}/v2/job/{}?action=rerun",
        client.base_url(),
        task.job_id
    );
    Ok((command, response.to_string()))
}

fn rest_error_kind(e: &OozieError) -> &'static str {
    match e {
        OozieError::ReservedParam(_) => "InvalidArgument",
        OozieError::Transport(_) => "TransportError",
        OozieError::Http { .. } => "HttpError",
    }
}

fn join_stderr(preamble: &str, stderr: &str) -> String {
    format!("{preamble}\n{stderr}").trim().to_owned()
}

/// Terminal write + `task_finished` event. SUCCESS iff the exit code is 0.
#[allow(clippy::too_many_arguments)]
async fn finish(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    cfg: &ExecSettings,
    plan_id: i64,
    task_id: i64,
    command: &str,
    stdout: &str,
    stderr: &str,
    exit_code: i64,
) -> Result<()> {
    let status = if exit_code == 0 {
        TaskStatus::Success
    } else {
        TaskStatus::Failed
    };

    task_db::finish_task(
        pool,
        task_id,
        command,
        &truncate_utf8(stdout, cfg.max_stdout),
        &truncate_utf8(stderr, cfg.max_stderr),
        exit_code,
        status,
        Utc::now(),
    )
    .await?;

    info!(plan_id, task_id, %status, exit_code, "task finished");

    bus.publish(&Event::TaskFinished {
        plan_id,
        task_id,
        status,
        worker_id: cfg.worker_id.clone(),
    })
    .await;

    Ok(())
}

/// Last-resort failure path for unexpected executor errors: if the claim
/// succeeded and the task is still RUNNING, write exit code 1 with the
/// error text so the row is never left dangling.
async fn fail_if_still_running(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    cfg: &ExecSettings,
    plan_id: i64,
    task_id: i64,
    cause: &anyhow::Error,
) {
    let task = match task_db::get_task(pool, task_id).await {
        Ok(Some(task)) => task,
        _ => return,
    };
    if task.status != TaskStatus::Running {
        return;
    }

    let stderr = format!("unexpected worker error: {cause:#}");
    if let Err(e) = finish(
        pool,
        bus,
        cfg,
        plan_id,
        task_id,
        &task.command,
        "",
        &stderr,
        1,
    )
    .await
    {
        error!(task_id, error = %e, "failed to record task failure");
    }
}
