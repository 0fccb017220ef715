use std::time::Duration;

use panel_control::config::PanelConfig;
use panel_control::routes;
use panel_control::state::AppState;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PanelConfig::from_env()?;
    let addr = config.listen;
    tracing::info!(
        factorio_dir = %config.factorio_dir.display(),
        executable = %config.executable.display(),
        "factorio-panel configured"
    );

    let state = AppState::new(config)?;
    let app = routes::router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "factorio-panel HTTP listening");
    // Start streams stay open until the server exits: stop it as soon as
    // shutdown begins.
    let wait = state.config.stop_grace.unwrap_or(Duration::from_secs(10));
    let slot = state.slot.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tokio::spawn(async move { slot.shutdown(wait).await });
        })
        .await?;

    state.slot.shutdown(wait).await;
    Ok(())
}
