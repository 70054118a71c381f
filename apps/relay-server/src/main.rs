//! # Relay Server
//!
//! Actix-web HTTP server with request admission control in front of every route.

use actix_web::{App, HttpServer, web};
use anyhow::Context;
use tracing_actix_web::TracingLogger;

mod config;
mod handlers;
mod middleware;
mod state;
mod telemetry;

use config::AppConfig;
use middleware::RateLimitMiddleware;
use state::AppState;
use telemetry::{TelemetryConfig, init_telemetry};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_telemetry(&TelemetryConfig::from_env());

    // Load configuration
    let config = AppConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        "Starting Relay Server on {}:{}",
        config.host,
        config.port
    );

    // Build application state
    let state = AppState::new(&config.rate_limit)
        .await
        .context("failed to initialize rate limiter")?;

    let limiter = state.limiter.clone();
    let gate = config.admission_gate();
    let app_state = state.clone();

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .wrap(RateLimitMiddleware::new(limiter.clone(), gate.clone()))
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(app_state.clone()))
            .configure(handlers::configure_routes)
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
    .run()
    .await?;

    tracing::info!("Server stopped");
    state.shutdown().await;

    Ok(())
}
