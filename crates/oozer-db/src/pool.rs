use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
///
/// WAL journaling plus a busy timeout so that a worker fleet and the API
/// server can race on the atomic task claim without immediate
/// `SQLITE_BUSY` failures.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    if !config.is_sqlite() {
        bail!(
            "unsupported database URL {:?}: this build persists to SQLite \
             (see DB_URL in the deployment notes)",
            config.database_url
        );
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.sqlite_path()))
        .with_context(|| format!("invalid database URL {:?}", config.database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_url))?;

    Ok(pool)
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no database is required at compile
/// time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Return the row count for every application table.
///
/// Useful for the `oozer db-init` success message.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `oozer-db`.
///
/// At runtime this resolves relative to the `oozer-db` crate's source tree
/// via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    // CARGO_MANIFEST_DIR is set at *compile* time for the crate being
    // compiled, so this points at crates/oozer-db/.
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
