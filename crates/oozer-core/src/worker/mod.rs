//! Worker loop: scans RUNNING plans, admits pending tasks up to each
//! plan's concurrency cap, dispatches them onto a bounded executor pool,
//! and rolls plans up to COMPLETED/FAILED when every task is terminal.
//!
//! The per-plan inflight set is a local soft admission cache; the atomic
//! claim in the executor is the only cluster-wide correctness barrier, so
//! any number of workers can run this loop against the same database.

pub mod executor;
pub mod hook;
pub mod process;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use oozer_db::models::{Plan, PlanStatus};
use oozer_db::queries::{plans as plan_db, tasks as task_db};

use crate::events::{Event, EventBus};
use crate::settings::Settings;

pub use executor::ExecSettings;
pub use hook::PreTaskHook;

/// Tasks submitted to the executor pool but not yet reported terminal,
/// keyed by plan id.
type InflightMap = Arc<Mutex<HashMap<i64, HashSet<i64>>>>;

/// Loop-level knobs, resolved once from [`Settings`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub max_threads: usize,
    pub worker_id: String,
}

pub struct Worker {
    pool: SqlitePool,
    bus: Arc<dyn EventBus>,
    config: WorkerConfig,
    exec: Arc<ExecSettings>,
}

impl Worker {
    pub fn new(pool: SqlitePool, bus: Arc<dyn EventBus>, settings: &Settings) -> Self {
        let config = WorkerConfig {
            poll_interval: Duration::from_secs(settings.worker_poll_seconds.max(1)),
            max_threads: settings.worker_max_threads.max(1),
            worker_id: settings.worker_id.clone(),
        };
        Self::with_config(pool, bus, config, ExecSettings::from_settings(settings))
    }

    /// Build a worker from explicit knobs instead of [`Settings`].
    pub fn with_config(
        pool: SqlitePool,
        bus: Arc<dyn EventBus>,
        config: WorkerConfig,
        exec: ExecSettings,
    ) -> Self {
        Self {
            pool,
            bus,
            config,
            exec: Arc::new(exec),
        }
    }

    /// Run the polling loop until `cancel` fires, then drain the pool.
    ///
    /// No new tasks are admitted after cancellation; outstanding executor
    /// slots run to completion (children are not killed).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "worker loop started");

        let semaphore = Arc::new(Semaphore::new(self.config.max_threads));
        let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));
        let mut executors: JoinSet<()> = JoinSet::new();

        while !cancel.is_cancelled() {
            // Reap finished executor handles so the set stays bounded.
            while executors.try_join_next().is_some() {}

            match plan_db::list_running_plans(&self.pool).await {
                Ok(plans) => {
                    for plan in plans {
                        if let Err(e) = self
                            .process_plan(&plan, &inflight, &semaphore, &mut executors)
                            .await
                        {
                            warn!(plan_id = plan.id, error = %e, "plan iteration failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to scan running plans"),
            }

            self.bus
                .publish(&Event::WorkerHeartbeat {
                    worker_id: self.config.worker_id.clone(),
                    ts: Utc::now(),
                })
                .await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            outstanding = executors.len(),
            "worker shutting down, draining executor pool"
        );
        while executors.join_next().await.is_some() {}
        info!(worker_id = %self.config.worker_id, "worker loop stopped");

        Ok(())
    }

    /// One iteration's work for a single RUNNING plan: admit pending tasks
    /// up to the concurrency slack, then try the completion rollup.
    async fn process_plan(
        &self,
        plan: &Plan,
        inflight: &InflightMap,
        semaphore: &Arc<Semaphore>,
        executors: &mut JoinSet<()>,
    ) -> Result<()> {
        let slack = {
            let mut guard = inflight.lock().expect("inflight mutex poisoned");
            let set = guard.entry(plan.id).or_default();
            (plan.max_concurrency.max(1) as usize).saturating_sub(set.len())
        };

        if slack > 0 {
            let pending = task_db::list_pending_tasks(&self.pool, plan.id, slack as i64).await?;
            for task in pending {
                // A task can stay PENDING while queued behind the pool
                // semaphore; skip anything already admitted.
                let inserted = inflight
                    .lock()
                    .expect("inflight mutex poisoned")
                    .entry(plan.id)
                    .or_default()
                    .insert(task.id);
                if !inserted {
                    continue;
                }

                let pool = self.pool.clone();
                let bus = Arc::clone(&self.bus);
                let exec = Arc::clone(&self.exec);
                let semaphore = Arc::clone(semaphore);
                let inflight = Arc::clone(inflight);
                let plan_id = plan.id;
                let task_id = task.id;

                executors.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    executor::run_task(&pool, bus.as_ref(), &exec, plan_id, task_id).await;
                    if let Ok(mut guard) = inflight.lock() {
                        if let Some(set) = guard.get_mut(&plan_id) {
                            set.remove(&task_id);
                        }
                    }
                });
            }
        }

        self.maybe_complete_plan(plan.id, inflight).await?;

        Ok(())
    }

    /// Roll a plan up to COMPLETED (or FAILED if any task failed) once all
    /// tasks are terminal and this worker has nothing in flight for it.
    ///
    /// The conditional write (`WHERE status = 'RUNNING'`) tolerates a
    /// concurrent operator transition; whoever moved the plan first wins.
    async fn maybe_complete_plan(&self, plan_id: i64, inflight: &InflightMap) -> Result<()> {
        let inflight_empty = inflight
            .lock()
            .expect("inflight mutex poisoned")
            .get(&plan_id)
            .map(HashSet::is_empty)
            .unwrap_or(true);
        if !inflight_empty {
            return Ok(());
        }

        let progress = task_db::get_plan_progress(&self.pool, plan_id).await?;
        if progress.total != 0 && progress.done() != progress.total {
            return Ok(());
        }

        let status = if progress.failed > 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };

        let rows = plan_db::finalize_plan_if_running(&self.pool, plan_id, status, Utc::now()).await?;
        if rows > 0 {
            info!(plan_id, %status, "plan completed");
            self.bus
                .publish(&Event::PlanCompleted {
                    plan_id,
                    status,
                    worker_id: self.config.worker_id.clone(),
                })
                .await;
        }

        Ok(())
    }
}
