mod config;
mod observer;
mod plan_cmds;
mod serve_cmd;
mod status_cmd;
mod task_cmds;
mod worker_cmd;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tracing::warn;

use oozer_core::auth;
use oozer_core::events::{EventBus, RedisBus};
use oozer_core::settings::Settings;
use oozer_db::config::DbConfig;
use oozer_db::models::Role;
use oozer_db::pool;
use oozer_db::queries::users as user_db;

#[derive(Parser)]
#[command(name = "oozer", about = "Bulk reprocessing manager for Apache Oozie jobs")]
struct Cli {
    /// Database URL (overrides the DB_URL env var and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an oozer config file (no database required)
    Init {
        /// Database connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database schema and the bootstrap admin, if configured
    DbInit,
    /// Plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Show plan progress (omit plan_id to list all plans)
    Status {
        /// Plan ID to show status for
        plan_id: Option<i64>,
    },
    /// Run the task execution worker
    Worker,
    /// Run the operator API and WebSocket observer endpoint
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Create a plan from a TOML file
    Create {
        /// Path to the plan TOML file
        file: String,
    },
    /// Show plan details (or list all plans)
    Show {
        /// Plan ID to show (omit to list all)
        plan_id: Option<i64>,
    },
    /// Start (or restart) a plan
    Start { plan_id: i64 },
    /// Pause a running plan; running tasks finish, no new ones start
    Pause { plan_id: i64 },
    /// Resume a paused plan
    Resume { plan_id: i64 },
    /// Stop a plan and cancel its pending tasks
    Stop { plan_id: i64 },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Cancel a task (terminal tasks are left unchanged)
    Cancel { task_id: i64 },
    /// Reset a task to PENDING for another attempt
    Retry { task_id: i64 },
}

/// Execute the `oozer init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let jwt_secret = config::generate_jwt_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            jwt_secret: jwt_secret.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!(
        "  auth.jwt_secret = {}...{}",
        &jwt_secret[..8],
        &jwt_secret[56..]
    );
    println!();
    println!("Next: run `oozer db-init` to create the schema.");

    Ok(())
}

/// Open the connection pool for the resolved settings.
async fn open_pool(settings: &Settings) -> Result<SqlitePool> {
    let db_config = DbConfig::new(settings.db_url.clone());
    pool::create_pool(&db_config).await
}

/// Build the event bus from settings. Publishing stays best-effort, so a
/// Redis that is down only costs events, never correctness.
fn make_bus(settings: &Settings) -> Result<Arc<dyn EventBus>> {
    let bus = RedisBus::new(&settings.redis_url, &settings.redis_channel)
        .with_context(|| format!("invalid REDIS_URL {:?}", settings.redis_url))?;
    Ok(Arc::new(bus))
}

/// Create the bootstrap admin when enabled and the users table is empty.
async fn bootstrap_admin(pool: &SqlitePool, settings: &Settings) -> Result<()> {
    if !settings.bootstrap_admin_enabled {
        return Ok(());
    }
    if user_db::count_users(pool).await? > 0 {
        return Ok(());
    }

    let password = settings.bootstrap_admin_pass.as_deref().unwrap_or_default();
    user_db::insert_user(
        pool,
        &settings.bootstrap_admin_user,
        &auth::hash_password(password),
        Role::Admin,
        chrono::Utc::now(),
    )
    .await?;
    warn!(
        user = %settings.bootstrap_admin_user,
        "bootstrapped initial admin user"
    );
    Ok(())
}

/// Execute the `oozer db-init` command: run migrations, then bootstrap.
async fn cmd_db_init(settings: &Settings) -> Result<()> {
    println!("Initializing oozer database...");

    let db_pool = open_pool(settings).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    bootstrap_admin(&db_pool, settings).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("oozer db-init complete.");
    Ok(())
}

/// Startup chores shared by the long-running commands.
async fn boot(pool: &SqlitePool, settings: &Settings) -> Result<()> {
    if settings.auto_create_schema {
        warn!("AUTO_CREATE_SCHEMA=true is enabled. This should be used only for local/dev runs.");
        pool::run_migrations(pool, pool::default_migrations_path()).await?;
    }
    bootstrap_admin(pool, settings).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
                tracing_subscriber::EnvFilter::new(level)
            }),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { db_url, force } = &cli.command {
        return cmd_init(db_url, *force);
    }

    let settings = config::resolve(cli.database_url.as_deref())?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::DbInit => {
            cmd_db_init(&settings).await?;
        }
        Commands::Plan { command } => {
            let db_pool = open_pool(&settings).await?;
            let bus = make_bus(&settings)?;
            let result = plan_cmds::run_plan_command(command, &db_pool, bus.as_ref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let db_pool = open_pool(&settings).await?;
            let bus = make_bus(&settings)?;
            let result = task_cmds::run_task_command(command, &db_pool, bus.as_ref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { plan_id } => {
            let db_pool = open_pool(&settings).await?;
            let result = status_cmd::run_status(&db_pool, plan_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker => {
            let db_pool = open_pool(&settings).await?;
            boot(&db_pool, &settings).await?;
            let bus = make_bus(&settings)?;
            let result = worker_cmd::run_worker(db_pool.clone(), bus, &settings).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            let db_pool = open_pool(&settings).await?;
            boot(&db_pool, &settings).await?;
            let bus = make_bus(&settings)?;
            let result = serve_cmd::run_serve(db_pool.clone(), bus, &settings, &bind, port).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
