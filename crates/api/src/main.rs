use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sketchforge_api::config::{OrchestratorConfig, ServerConfig};
use sketchforge_api::router::build_app_router;
use sketchforge_api::state::{build_registry, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sketchforge_api=debug,sketchforge_worker=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    let orchestrator = OrchestratorConfig::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        workers = orchestrator.queue.max_concurrent_jobs,
        providers = orchestrator.providers.len(),
        "Loaded configuration",
    );

    // --- Providers ---
    let client = reqwest::Client::builder().build()?;
    let registry = Arc::new(build_registry(&orchestrator, client)?);

    // --- App state ---
    let state = AppState::new(config.clone(), &orchestrator, Arc::clone(&registry));

    // --- Background services ---
    let cancel = CancellationToken::new();
    state.queue.start(cancel.clone());
    let health_handle = tokio::spawn(
        Arc::clone(&registry).run_health_checks(orchestrator.health_check_interval, cancel.clone()),
    );

    // --- Start server ---
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = build_app_router(state.clone(), &config);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    cancel.cancel();
    state
        .queue
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;

    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;
    tracing::info!("Health checks stopped");

    state.events.shutdown_all();

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
