use std::sync::Arc;

use axum::http::HeaderValue;
use clap::Parser;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bridge::Bridge;
use crate::broker::SessionBroker;
use crate::config::Settings;
use crate::router::{build_router_with_state, shutdown_sessions, AppState, AuthConfig};
use crate::user_env::SettingsEnvironment;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_codex_bridge() -> Result<(), CliError> {
    let settings = Settings::parse();
    init_logging();
    run_server(&settings)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(settings: &Settings) -> Result<(), CliError> {
    let auth = match settings.token.clone().filter(|token| !token.is_empty()) {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };
    let environment = Arc::new(SettingsEnvironment::new(settings));
    let cors = build_cors_layer(settings)?;
    let addr = settings.bind_addr();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        // The broker spawns its cleanup task, so it is built inside the runtime.
        let broker = SessionBroker::new(settings.broker_config(), environment);
        broker.start_cleanup_loop();
        let state = Arc::new(AppState::new(auth, Bridge::new(broker)));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            binary = %settings.binary_path().display(),
            homes_dir = %settings.homes_dir().display(),
            max_sessions = settings.max_sessions,
            "server listening"
        );
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down, closing app-server sessions");
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

/// No origins configured means any origin.
fn build_cors_layer(settings: &Settings) -> Result<CorsLayer, CliError> {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if settings.cors_allow_origin.is_empty() {
        return Ok(cors.allow_origin(Any));
    }

    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &settings.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    Ok(cors.allow_origin(origins))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_cors_origin_is_rejected() {
        let settings = Settings::try_parse_from(["codex-bridge", "--cors-allow-origin", "bad\norigin"])
            .expect("parse settings");
        assert!(matches!(
            build_cors_layer(&settings),
            Err(CliError::InvalidCorsOrigin(_))
        ));

        let settings = Settings::try_parse_from([
            "codex-bridge",
            "--cors-allow-origin",
            "http://localhost:3000",
        ])
        .expect("parse settings");
        assert!(build_cors_layer(&settings).is_ok());
    }
}
