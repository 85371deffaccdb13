//! Core engine for the Oozie reprocessing manager: settings, auth tokens,
//! the Oozie client and CLI command builder, the event bus, the plan/task
//! state machines, and the worker that executes rerun tasks.

pub mod auth;
pub mod events;
pub mod oozie;
pub mod plan;
pub mod settings;
pub mod state;
pub mod worker;
