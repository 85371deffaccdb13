//! `oozer worker`: run the polling worker until SIGTERM/SIGINT.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use oozer_core::events::EventBus;
use oozer_core::settings::Settings;
use oozer_core::worker::Worker;

pub async fn run_worker(
    pool: SqlitePool,
    bus: Arc<dyn EventBus>,
    settings: &Settings,
) -> Result<()> {
    let worker = Worker::new(pool, bus, settings);

    // Graceful shutdown: first signal stops admissions and drains the
    // pool, a second Ctrl+C force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            wait_for_shutdown_signal().await;
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    worker.run(cancel).await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
