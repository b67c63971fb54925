//! Voice Session Server Entry Point

use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_session_config::{load_settings, Settings};
use voice_session_server::{create_router, init_metrics, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first (need observability settings for tracing init)
    let environment = std::env::var("VOICE_SESSION_ENV").ok();
    let config = load_settings(environment.as_deref())?;

    init_tracing(&config);

    tracing::info!("Starting Voice Session Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = environment.as_deref().unwrap_or("default"),
        "Loaded configuration"
    );

    if config.observability.metrics_enabled {
        match init_metrics() {
            Ok(_) => tracing::info!("Initialized Prometheus metrics at /metrics"),
            Err(e) => tracing::warn!("Metrics disabled: {}", e),
        }
    }

    let state = AppState::new(config.clone())?;
    let cleanup = state.sessions.start_cleanup_task();
    tracing::info!(
        max_sessions = config.server.max_sessions,
        ws_path = %config.server.ws_path,
        "Initialized application state"
    );

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = cleanup.send(true);
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Console logging, JSON or plain per configuration
fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("voice_session={},tower_http=info", level).into()
    });

    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
