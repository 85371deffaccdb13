//! Lifecycle events and the pub/sub bus they travel on.
//!
//! Every state change publishes one JSON object, `{"event": <kind>, ...}`,
//! on a shared channel. Publication is best-effort: a failed publish is
//! logged and dropped, never rolled into a database error.

pub mod local;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use oozer_db::models::{PlanStatus, TaskStatus};

pub use local::LocalBus;
pub use redis::RedisBus;

/// A lifecycle event as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PlanCreated {
        plan_id: i64,
    },
    PlanStatus {
        plan_id: i64,
        status: PlanStatus,
    },
    PlanStopped {
        plan_id: i64,
    },
    PlanCompleted {
        plan_id: i64,
        status: PlanStatus,
        worker_id: String,
    },
    TaskStarted {
        plan_id: i64,
        task_id: i64,
        worker_id: String,
    },
    TaskFinished {
        plan_id: i64,
        task_id: i64,
        status: TaskStatus,
        worker_id: String,
    },
    TaskCanceled {
        plan_id: i64,
        task_id: i64,
    },
    TaskRetried {
        plan_id: i64,
        task_id: i64,
    },
    WorkerHeartbeat {
        worker_id: String,
        ts: DateTime<Utc>,
    },
}

/// A pub/sub channel for [`Event`]s.
///
/// `publish` never fails from the caller's point of view; implementations
/// log and swallow transport errors. `subscribe` yields a stream of every
/// event published on the channel after the call.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &Event);

    async fn subscribe(&self) -> anyhow::Result<BoxStream<'static, Event>>;

    /// Readiness probe for the underlying transport. In-process buses are
    /// always ready.
    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_event_tag() {
        let event = Event::TaskFinished {
            plan_id: 1,
            task_id: 2,
            status: TaskStatus::Success,
            worker_id: "w-1".to_owned(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_finished");
        assert_eq!(json["plan_id"], 1);
        assert_eq!(json["task_id"], 2);
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["worker_id"], "w-1");
    }

    #[test]
    fn all_kinds_use_snake_case_tags() {
        let cases = [
            (Event::PlanCreated { plan_id: 1 }, "plan_created"),
            (
                Event::PlanStatus {
                    plan_id: 1,
                    status: PlanStatus::Running,
                },
                "plan_status",
            ),
            (Event::PlanStopped { plan_id: 1 }, "plan_stopped"),
            (
                Event::PlanCompleted {
                    plan_id: 1,
                    status: PlanStatus::Completed,
                    worker_id: "w".to_owned(),
                },
                "plan_completed",
            ),
            (
                Event::TaskStarted {
                    plan_id: 1,
                    task_id: 2,
                    worker_id: "w".to_owned(),
                },
                "task_started",
            ),
            (
                Event::TaskCanceled {
                    plan_id: 1,
                    task_id: 2,
                },
                "task_canceled",
            ),
            (
                Event::TaskRetried {
                    plan_id: 1,
                    task_id: 2,
                },
                "task_retried",
            ),
            (
                Event::WorkerHeartbeat {
                    worker_id: "w".to_owned(),
                    ts: Utc::now(),
                },
                "worker_heartbeat",
            ),
        ];
        for (event, tag) in cases {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], tag);
        }
    }

    #[test]
    fn events_roundtrip_through_json() {
        let event = Event::PlanStatus {
            plan_id: 7,
            status: PlanStatus::Paused,
        };
        let text = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, event);
    }
}
