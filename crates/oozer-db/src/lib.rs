//! Persistence layer for the Oozie reprocessing manager: models, connection
//! pool, migrations, and parameterized query functions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
