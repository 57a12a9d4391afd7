use anyhow::Result;
use axum::Router;
use delve_api::{config::AppConfig, routes::build_router, state::AppState};
use delve_core::{
    ConfigLoader, ResearchService, ServiceComponents, TelemetryOptions, init_telemetry, metrics,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    // Engine settings come from `DELVE_CONFIG` or `./delve.toml`.
    let core = ConfigLoader::load(None)?;

    init_telemetry(TelemetryOptions::default().with_level(core.logging.level.as_deref()))?;
    if let Err(err) = metrics::init_metrics_from_env("delve-api") {
        warn!(error = %err, "metrics disabled");
    }

    let components = ServiceComponents::from_config(&core)?;
    let service = ResearchService::start(&core, components);
    let state = AppState::new(service.manager(), &config);

    let app: Router = build_router(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(address = %config.listen_addr, "delve-api listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(err) = &served {
        error!(error = %err, "server shutdown with error");
    }

    service.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            stream.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
