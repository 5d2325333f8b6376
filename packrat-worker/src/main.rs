use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use packrat_worker::composition::{WorkerDependencies, WorkerError};
use packrat_worker::handler::PipelineHandler;
use packrat_worker::settings::WorkerSettings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run().await {
        error!(event = "worker_failed", error = %err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WorkerError> {
    let settings = WorkerSettings::from_env()?;
    let deps = WorkerDependencies::connect(settings).await?;

    // Single-slot processing: shutdown waits on this mutex, bounded below.
    let slot = Arc::new(Mutex::new(()));
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let handler =
        Arc::new(PipelineHandler::new(deps.service.clone(), slot.clone(), errors_tx));

    let consumer_tag = deps.consumer.start_consuming(handler).await?;
    info!(event = "worker_started", consumer_tag = %consumer_tag);

    shutdown_signal().await;

    if let Err(err) = deps.consumer.cancel(&consumer_tag).await {
        warn!(event = "consumer_cancel_failed", error = %err);
    }
    match tokio::time::timeout(deps.settings.shutdown_lock_wait, slot.lock()).await {
        Ok(_guard) => {}
        Err(_elapsed) => {
            warn!(
                event = "shutdown_lock_timeout",
                timeout_s = deps.settings.shutdown_lock_wait.as_secs(),
            );
        }
    }
    deps.close().await;
    info!(event = "worker_stopped");

    // Poison messages were dropped, not requeued; surface the first failure
    // so the supervisor sees a non-zero exit.
    let mut first_error: Option<WorkerError> = None;
    let mut seen = 0usize;
    while let Ok(err) = errors_rx.try_recv() {
        seen += 1;
        if first_error.is_none() {
            first_error = Some(WorkerError::Handler(err.to_string()));
        } else {
            warn!(event = "handler_error_during_run", index = seen, error = %err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(event = "signal_handler_failed", error = %err),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(event = "shutdown_signal");
}
