mod activities;
mod catalog;
mod config;
mod delivery;
mod dispatch;
mod engine;
mod error;
mod model;
mod polling;
mod reconciliation;
mod routes;
mod schedule_store;
mod state;
mod template;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use config::EngineConfig;
use engine::Engine;
use state::EngineState;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = EngineConfig::from_env();
    if let Err(error) = config.validate() {
        tracing::error!(%error, "configuration validation failed");
        std::process::exit(3);
    }

    tracing::info!(
        app_name = %config.app_name,
        environment = %config.environment,
        "xnovu notification engine starting"
    );

    let state = match EngineState::build(config).await {
        Ok(state) => state,
        Err(error) => {
            tracing::error!(%error, "engine initialization failed");
            std::process::exit(1);
        }
    };

    let host = state.config.host.clone();
    let port = state.config.port;

    let engine = Arc::new(Engine::build(state).await);
    if let Err(error) = engine.init().await {
        tracing::error!(%error, "engine controller failed to start");
        std::process::exit(match error {
            error::EngineError::ScheduleStoreUnavailable(_) | error::EngineError::ScheduleStoreNotFound(_) => 2,
            _ => 1,
        });
    }

    let app = axum::Router::new()
        .merge(routes::router(engine.clone()))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(TraceLayer::new_for_http());

    let socket_addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, "invalid HOST/PORT configuration");
            std::process::exit(3);
        }
    };

    let listener = match tokio::net::TcpListener::bind(socket_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %socket_addr, "failed to bind control-plane listener");
            std::process::exit(1);
        }
    };

    tracing::info!(%socket_addr, "control-plane surface listening");

    let shutdown_engine = engine.clone();
    let serve_result = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_engine.shutdown().await;
        })
        .await;

    if let Err(error) = serve_result {
        tracing::error!(%error, "control-plane server exited with an error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("shutdown signal received, stopping engine loops");
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
