//! Oozie integration: the REST client and the CLI argv builder.

pub mod client;
pub mod command;

pub use client::{OozieClient, OozieError};
pub use command::{CommandError, build_cli_command, render_command, workflow_conf};
