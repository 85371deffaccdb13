//! Plan state machine.
//!
//! Validates and executes plan status transitions, applying the cascading
//! task effects (requeue on restart, cancel on stop) inside the same
//! transaction as the status write.

pub mod dispatch;

use chrono::Utc;
use sqlx::SqlitePool;

use oozer_db::models::{Plan, PlanStatus};

use crate::events::{Event, EventBus};

/// Errors from a plan transition request.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("plan {0} not found")]
    NotFound(i64),

    /// The request violates the transition table. Surfaced to operators as
    /// HTTP 409; nothing is written.
    #[error("cannot transition plan {plan_id} from {from} to {to}")]
    Illegal {
        plan_id: i64,
        from: PlanStatus,
        to: PlanStatus,
    },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// The plan state machine.
///
/// Enforces the transition graph:
///
/// ```text
/// DRAFT     -> RUNNING | STOPPED
/// RUNNING   -> PAUSED  | STOPPED
/// PAUSED    -> RUNNING | STOPPED
/// STOPPED   -> RUNNING
/// FAILED    -> RUNNING
/// COMPLETED -> RUNNING
/// ```
///
/// Self-transitions are accepted as no-ops.
pub struct PlanStateMachine;

impl PlanStateMachine {
    /// Check whether a transition from `from` to `to` is permitted.
    pub fn is_allowed(from: PlanStatus, to: PlanStatus) -> bool {
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (PlanStatus::Draft, PlanStatus::Running)
                | (PlanStatus::Draft, PlanStatus::Stopped)
                | (PlanStatus::Running, PlanStatus::Paused)
                | (PlanStatus::Running, PlanStatus::Stopped)
                | (PlanStatus::Paused, PlanStatus::Running)
                | (PlanStatus::Paused, PlanStatus::Stopped)
                | (PlanStatus::Stopped, PlanStatus::Running)
                | (PlanStatus::Failed, PlanStatus::Running)
                | (PlanStatus::Completed, PlanStatus::Running)
        )
    }
}

/// Execute a plan transition with its cascading task effects.
///
/// In one transaction:
/// - to RUNNING from a terminal plan status (STOPPED / FAILED / COMPLETED):
///   every FAILED / CANCELED / SKIPPED task is re-queued to PENDING. Task
///   outputs are kept; operator retry is what clears them.
/// - to STOPPED: every PENDING task becomes CANCELED. Tasks already
///   RUNNING are left alone and finish on their own.
/// - the plan status and `updated_at` are written.
///
/// Publishes `plan_status` after commit, plus `plan_stopped` when the
/// target was STOPPED.
pub async fn transition_plan(
    pool: &SqlitePool,
    bus: &dyn EventBus,
    plan_id: i64,
    target: PlanStatus,
) -> Result<Plan, TransitionError> {
    let mut tx = pool.begin().await?;

    let plan: Option<Plan> = sqlx::query_as("SELECT * FROM plans WHERE id = ?")
        .bind(plan_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(plan) = plan else {
        return Err(TransitionError::NotFound(plan_id));
    };

    if !PlanStateMachine::is_allowed(plan.status, target) {
        return Err(TransitionError::Illegal {
            plan_id,
            from: plan.status,
            to: target,
        });
    }

    if target == PlanStatus::Running
        && matches!(
            plan.status,
            PlanStatus::Stopped | PlanStatus::Failed | PlanStatus::Completed
        )
    {
        sqlx::query(
            "UPDATE tasks SET status = 'PENDING' \
             WHERE plan_id = ? AND status IN ('FAILED', 'CANCELED', 'SKIPPED')",
        )
        .bind(plan_id)
        .execute(&mut *tx)
        .await?;
    }

    if target == PlanStatus::Stopped {
        sqlx::query("UPDATE tasks SET status = 'CANCELED' WHERE plan_id = ? AND status = 'PENDING'")
            .bind(plan_id)
            .execute(&mut *tx)
            .await?;
    }

    let updated: Plan =
        sqlx::query_as("UPDATE plans SET status = ?, updated_at = ? WHERE id = ? RETURNING *")
            .bind(target)
            .bind(Utc::now())
            .bind(plan_id)
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;

    bus.publish(&Event::PlanStatus {
        plan_id,
        status: target,
    })
    .await;
    if target == PlanStatus::Stopped {
        bus.publish(&Event::PlanStopped { plan_id }).await;
    }

    Ok(updated)
}
