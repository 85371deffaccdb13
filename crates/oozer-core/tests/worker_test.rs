//! End-to-end worker loop tests: plans run to completion through the real
//! polling loop, executor pool, and completion rollup, with a fake Oozie
//! CLI and the in-process event bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use oozer_db::models::{PlanStatus, TaskStatus, TaskType};
use oozer_db::queries::{plans as plan_db, tasks as task_db};
use oozer_test_utils::{TaskSeed, create_test_db, fake_oozie_bin, seed_plan, seed_task};

use oozer_core::events::{Event, EventBus, LocalBus};
use oozer_core::worker::executor::ExecSettings;
use oozer_core::worker::hook::PreTaskHook;
use oozer_core::worker::{Worker, WorkerConfig};

fn test_worker(pool: sqlx::SqlitePool, bus: Arc<LocalBus>, oozie_bin: &Path) -> Worker {
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(50),
        max_threads: 8,
        worker_id: "w-test".to_owned(),
    };
    let exec = ExecSettings {
        oozie_bin: oozie_bin.display().to_string(),
        oozie_default_url: "http://default:11000/oozie".to_owned(),
        http_timeout: Duration::from_secs(5),
        task_timeout: Duration::from_secs(30),
        max_stdout: 50_000,
        max_stderr: 50_000,
        rest_fallback_to_cli: true,
        worker_id: "w-test".to_owned(),
        hook: PreTaskHook::None,
    };
    Worker::with_config(pool, bus, config, exec)
}

/// Poll the database until the plan reaches a terminal status or the
/// deadline passes.
async fn wait_for_plan_status(
    pool: &sqlx::SqlitePool,
    plan_id: i64,
    expected: PlanStatus,
) -> PlanStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let plan = plan_db::get_plan(pool, plan_id).await.unwrap().unwrap();
        if plan.status == expected {
            return plan.status;
        }
        if tokio::time::Instant::now() > deadline {
            return plan.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn workflow_seed(name: &str) -> TaskSeed {
    TaskSeed {
        name: name.to_owned(),
        task_type: TaskType::Workflow,
        job_id: format!("{name}-W"),
        ..Default::default()
    }
}

#[tokio::test]
async fn plan_with_all_tasks_passing_completes() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 0));

    let plan = seed_plan(&pool, "P", PlanStatus::Running, false, 2, "http://o:1/oozie").await;
    for name in ["a", "b", "c"] {
        seed_task(&pool, plan.id, &workflow_seed(name)).await;
    }

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let status = wait_for_plan_status(&pool, plan.id, PlanStatus::Completed).await;
    assert_eq!(status, PlanStatus::Completed);

    let tasks = task_db::list_tasks_for_plan(&pool, plan.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Success, "task {}", task.name);
        assert_eq!(task.exit_code, Some(0));
        assert_eq!(task.attempt, 1);
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn one_failed_task_rolls_plan_up_to_failed() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 2));

    let plan = seed_plan(&pool, "P", PlanStatus::Running, false, 1, "http://o:1/oozie").await;
    seed_task(&pool, plan.id, &workflow_seed("only")).await;

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let status = wait_for_plan_status(&pool, plan.id, PlanStatus::Failed).await;
    assert_eq!(status, PlanStatus::Failed);

    let tasks = task_db::list_tasks_for_plan(&pool, plan.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].exit_code, Some(2));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn empty_plan_completes_immediately() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 0));

    let plan = seed_plan(&pool, "P", PlanStatus::Running, false, 1, "http://o:1/oozie").await;

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let status = wait_for_plan_status(&pool, plan.id, PlanStatus::Completed).await;
    assert_eq!(status, PlanStatus::Completed);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn tasks_run_in_creation_order_under_cap_one() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let mut events = bus.subscribe().await.unwrap();
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 0));

    let plan = seed_plan(&pool, "P", PlanStatus::Running, false, 1, "http://o:1/oozie").await;
    let mut expected_order = Vec::new();
    for name in ["first", "second", "third"] {
        expected_order.push(seed_task(&pool, plan.id, &workflow_seed(name)).await.id);
    }

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    wait_for_plan_status(&pool, plan.id, PlanStatus::Completed).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    // With max_concurrency 1 the task_started events arrive in task-id
    // order (FIFO by creation).
    let mut started_order = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.next()).await
    {
        if let Event::TaskStarted { task_id, .. } = event {
            started_order.push(task_id);
        }
    }
    assert_eq!(started_order, expected_order);
}

#[tokio::test]
async fn worker_publishes_heartbeats() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let mut events = bus.subscribe().await.unwrap();
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 0));

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let heartbeat = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Event::WorkerHeartbeat { worker_id, .. }) = events.next().await {
                return worker_id;
            }
        }
    })
    .await
    .expect("a heartbeat should arrive within the deadline");
    assert_eq!(heartbeat, "w-test");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn paused_plan_admits_no_new_tasks() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 0));

    let plan = seed_plan(&pool, "P", PlanStatus::Paused, false, 4, "http://o:1/oozie").await;
    seed_task(&pool, plan.id, &workflow_seed("idle")).await;

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    // Give the loop a few polls, then confirm nothing moved.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let tasks = task_db::list_tasks_for_plan(&pool, plan.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Pending);

    let plan = plan_db::get_plan(&pool, plan.id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Paused);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn retried_task_is_picked_up_again() {
    let (pool, dir) = create_test_db().await;
    let bus = Arc::new(LocalBus::new());
    let worker = test_worker(pool.clone(), Arc::clone(&bus), &fake_oozie_bin(dir.path(), 0));

    let plan = seed_plan(&pool, "P", PlanStatus::Running, false, 1, "http://o:1/oozie").await;
    let task = seed_task(&pool, plan.id, &workflow_seed("again")).await;

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    wait_for_plan_status(&pool, plan.id, PlanStatus::Completed).await;

    // Operator retries the finished task and restarts the plan.
    oozer_core::state::dispatch::retry_task(&pool, bus.as_ref(), task.id)
        .await
        .unwrap();
    oozer_core::state::transition_plan(&pool, bus.as_ref(), plan.id, PlanStatus::Running)
        .await
        .unwrap();

    let status = wait_for_plan_status(&pool, plan.id, PlanStatus::Completed).await;
    assert_eq!(status, PlanStatus::Completed);

    let done = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.attempt, 3, "claim, retry, claim");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
