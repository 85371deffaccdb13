//! Builds the argv vector for an `oozie job -rerun` CLI invocation.
//!
//! Argv is dispatched without a shell; [`render_command`] produces the
//! shell-quoted display string stored on the task row for audit only.

use oozer_db::models::{Plan, Task, TaskType};

/// Errors raised while assembling a rerun command from a task.
///
/// These fail the task (with the message in stderr) and are never retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("oozie_url not configured")]
    MissingOozieUrl,

    #[error("coordinator rerun requires action or date")]
    CoordinatorMissingSelector,

    #[error("bundle rerun requires coordinator or date")]
    BundleMissingSelector,
}

/// Resolve the Oozie base URL for a plan: the plan override when set,
/// otherwise the configured default.
pub fn effective_oozie_url(plan: &Plan, default_url: &str) -> Result<String, CommandError> {
    let url = if plan.oozie_url.trim().is_empty() {
        default_url.trim()
    } else {
        plan.oozie_url.trim()
    };
    if url.is_empty() {
        return Err(CommandError::MissingOozieUrl);
    }
    Ok(url.to_owned())
}

/// Build the rerun configuration properties for a workflow task.
///
/// Exactly one of the rerun-control keys is present: `skip.nodes` when
/// `wf_skip_nodes` is non-empty, else `failnodes`. Extra properties follow
/// and may override.
pub fn workflow_conf(task: &Task) -> Vec<(String, String)> {
    let mut props: Vec<(String, String)> = Vec::new();

    if task.wf_skip_nodes.is_empty() {
        props.push((
            "oozie.wf.rerun.failnodes".to_owned(),
            if task.wf_failnodes { "true" } else { "false" }.to_owned(),
        ));
    } else {
        props.push((
            "oozie.wf.rerun.skip.nodes".to_owned(),
            task.wf_skip_nodes.clone(),
        ));
    }

    for (k, v) in task.extra_props.0.iter() {
        match props.iter_mut().find(|(key, _)| key == k) {
            Some(slot) => slot.1 = v.clone(),
            None => props.push((k.clone(), v.clone())),
        }
    }

    props
}

/// Build the argv vector for the external CLI.
///
/// Base: `oozie job -oozie URL -rerun JOBID`, then type-specific flags,
/// always ending in `-nocleanup`.
pub fn build_cli_command(
    plan: &Plan,
    task: &Task,
    oozie_bin: &str,
    default_url: &str,
) -> Result<Vec<String>, CommandError> {
    let oozie_url = effective_oozie_url(plan, default_url)?;

    let mut cmd: Vec<String> = vec![
        oozie_bin.to_owned(),
        "job".to_owned(),
        "-oozie".to_owned(),
        oozie_url,
        "-rerun".to_owned(),
        task.job_id.clone(),
    ];

    match task.task_type {
        TaskType::Workflow => {
            for (k, v) in workflow_conf(task) {
                cmd.push(format!("-D{k}={v}"));
            }
            cmd.push("-nocleanup".to_owned());
        }

        TaskType::Coordinator => {
            if !task.action.is_empty() {
                cmd.push("-action".to_owned());
                cmd.push(task.action.clone());
            } else if !task.date.is_empty() {
                cmd.push("-date".to_owned());
                cmd.push(task.date.clone());
            } else {
                return Err(CommandError::CoordinatorMissingSelector);
            }

            if task.failed {
                cmd.push("-failed".to_owned());
            }
            if task.refresh {
                cmd.push("-refresh".to_owned());
            }
            cmd.push("-nocleanup".to_owned());
        }

        TaskType::Bundle => {
            if !task.coordinator.is_empty() {
                cmd.push("-coordinator".to_owned());
                cmd.push(task.coordinator.clone());
            } else if !task.date.is_empty() {
                cmd.push("-date".to_owned());
                cmd.push(task.date.clone());
            } else {
                return Err(CommandError::BundleMissingSelector);
            }

            if task.refresh {
                cmd.push("-refresh".to_owned());
            }
            cmd.push("-nocleanup".to_owned());
        }
    }

    Ok(cmd)
}

/// Render an argv vector as a shell-quoted display string.
///
/// For the audit trail only; execution always dispatches the argv
/// directly.
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use oozer_db::models::{PlanStatus, TaskStatus};
    use sqlx::types::Json;

    use super::*;

    fn test_plan(oozie_url: &str) -> Plan {
        let now = Utc::now();
        Plan {
            id: 1,
            name: "p".to_owned(),
            description: String::new(),
            status: PlanStatus::Running,
            oozie_url: oozie_url.to_owned(),
            use_rest: false,
            max_concurrency: 1,
            created_by: "test".to_owned(),
            created_at: now,
            updated_at: now,
        }
    }

    fn test_task(task_type: TaskType, job_id: &str) -> Task {
        Task {
            id: 1,
            plan_id: 1,
            name: "t".to_owned(),
            task_type,
            job_id: job_id.to_owned(),
            action: String::new(),
            date: String::new(),
            coordinator: String::new(),
            wf_failnodes: false,
            wf_skip_nodes: String::new(),
            refresh: false,
            failed: false,
            extra_props: Json(BTreeMap::new()),
            status: TaskStatus::Pending,
            attempt: 0,
            command: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            pid: None,
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn coordinator_action_refresh() {
        let plan = test_plan("http://oozie:11000/oozie");
        let mut task = test_task(TaskType::Coordinator, "C-001");
        task.action = "1-3".to_owned();
        task.refresh = true;

        let argv = build_cli_command(&plan, &task, "oozie", "").unwrap();
        assert_eq!(
            argv,
            vec![
                "oozie",
                "job",
                "-oozie",
                "http://oozie:11000/oozie",
                "-rerun",
                "C-001",
                "-action",
                "1-3",
                "-refresh",
                "-nocleanup",
            ]
        );
    }

    #[test]
    fn coordinator_date_fallback_and_failed_flag() {
        let plan = test_plan("http://oozie:11000/oozie");
        let mut task = test_task(TaskType::Coordinator, "C-002");
        task.date = "2024-01-01T00:00Z".to_owned();
        task.failed = true;

        let argv = build_cli_command(&plan, &task, "oozie", "").unwrap();
        assert!(argv.contains(&"-date".to_owned()));
        assert!(argv.contains(&"-failed".to_owned()));
        assert!(!argv.contains(&"-action".to_owned()));
    }

    #[test]
    fn coordinator_action_wins_over_date() {
        let plan = test_plan("http://oozie:11000/oozie");
        let mut task = test_task(TaskType::Coordinator, "C-003");
        task.action = "5".to_owned();
        task.date = "2024-01-01T00:00Z".to_owned();

        let argv = build_cli_command(&plan, &task, "oozie", "").unwrap();
        assert!(argv.contains(&"-action".to_owned()));
        assert!(!argv.contains(&"-date".to_owned()));
    }

    #[test]
    fn coordinator_without_selector_fails() {
        let plan = test_plan("http://oozie:11000/oozie");
        let task = test_task(TaskType::Coordinator, "C-004");

        let err = build_cli_command(&plan, &task, "oozie", "").unwrap_err();
        assert_eq!(err, CommandError::CoordinatorMissingSelector);
    }

    #[test]
    fn bundle_without_selector_fails() {
        let plan = test_plan("http://oozie:11000/oozie");
        let task = test_task(TaskType::Bundle, "B-9");

        let err = build_cli_command(&plan, &task, "oozie", "").unwrap_err();
        assert_eq!(err, CommandError::BundleMissingSelector);
    }

    #[test]
    fn bundle_coordinator_and_refresh() {
        let plan = test_plan("http://oozie:11000/oozie");
        let mut task = test_task(TaskType::Bundle, "B-1");
        task.coordinator = "my-coord".to_owned();
        task.refresh = true;

        let argv = build_cli_command(&plan, &task, "oozie", "").unwrap();
        assert_eq!(
            argv,
            vec![
                "oozie",
                "job",
                "-oozie",
                "http://oozie:11000/oozie",
                "-rerun",
                "B-1",
                "-coordinator",
                "my-coord",
                "-refresh",
                "-nocleanup",
            ]
        );
    }

    #[test]
    fn workflow_failnodes_default() {
        let plan = test_plan("http://oozie:11000/oozie");
        let task = test_task(TaskType::Workflow, "W-1");

        let argv = build_cli_command(&plan, &task, "oozie", "").unwrap();
        assert!(argv.contains(&"-Doozie.wf.rerun.failnodes=false".to_owned()));
        assert_eq!(argv.last().unwrap(), "-nocleanup");
    }

    #[test]
    fn workflow_skip_nodes_excludes_failnodes() {
        let mut task = test_task(TaskType::Workflow, "W-2");
        task.wf_skip_nodes = "node1,node2".to_owned();
        task.wf_failnodes = true;

        let conf = workflow_conf(&task);
        assert!(
            conf.iter()
                .any(|(k, v)| k == "oozie.wf.rerun.skip.nodes" && v == "node1,node2")
        );
        assert!(
            !conf.iter().any(|(k, _)| k == "oozie.wf.rerun.failnodes"),
            "skip.nodes and failnodes are mutually exclusive"
        );
    }

    #[test]
    fn workflow_extra_props_appended() {
        let plan = test_plan("http://oozie:11000/oozie");
        let mut task = test_task(TaskType::Workflow, "W-3");
        task.wf_failnodes = true;
        task.extra_props = Json(BTreeMap::from([("a".to_owned(), "b".to_owned())]));

        let argv = build_cli_command(&plan, &task, "oozie", "").unwrap();
        assert!(argv.contains(&"-Doozie.wf.rerun.failnodes=true".to_owned()));
        assert!(argv.contains(&"-Da=b".to_owned()));
    }

    #[test]
    fn extra_props_can_override_rerun_control() {
        let mut task = test_task(TaskType::Workflow, "W-4");
        task.extra_props = Json(BTreeMap::from([(
            "oozie.wf.rerun.failnodes".to_owned(),
            "true".to_owned(),
        )]));

        let conf = workflow_conf(&task);
        let failnodes: Vec<_> = conf
            .iter()
            .filter(|(k, _)| k == "oozie.wf.rerun.failnodes")
            .collect();
        assert_eq!(failnodes.len(), 1, "no duplicate keys");
        assert_eq!(failnodes[0].1, "true");
    }

    #[test]
    fn plan_url_overrides_default() {
        let plan = test_plan("http://plan-specific:11000/oozie");
        let url = effective_oozie_url(&plan, "http://default:11000/oozie").unwrap();
        assert_eq!(url, "http://plan-specific:11000/oozie");
    }

    #[test]
    fn default_url_used_when_plan_url_empty() {
        let plan = test_plan("");
        let url = effective_oozie_url(&plan, "http://default:11000/oozie").unwrap();
        assert_eq!(url, "http://default:11000/oozie");
    }

    #[test]
    fn missing_url_everywhere_fails() {
        let plan = test_plan("   ");
        let err = effective_oozie_url(&plan, "").unwrap_err();
        assert_eq!(err, CommandError::MissingOozieUrl);
    }

    #[test]
    fn render_quotes_only_unsafe_args() {
        let argv = vec![
            "oozie".to_owned(),
            "-Dkey=has space".to_owned(),
            "plain".to_owned(),
        ];
        assert_eq!(render_command(&argv), "oozie '-Dkey=has space' plain");
    }

    #[test]
    fn render_escapes_single_quotes() {
        let argv = vec!["it's".to_owned()];
        assert_eq!(render_command(&argv), "'it'\\''s'");
    }
}
