use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use packrat_api::app::{router, ApiError, AppDependencies};
use packrat_api::settings::ApiSettings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run().await {
        error!(event = "api_startup_failed", error = %err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let settings = ApiSettings::from_env()?;
    let deps = AppDependencies::connect(settings).await?;

    let listener = tokio::net::TcpListener::bind(&deps.settings.bind_addr).await?;
    info!(event = "api_started", bind_addr = %deps.settings.bind_addr);

    let app = router(deps.state());
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    deps.close().await;
    info!(event = "api_stopped");
    Ok(())
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
