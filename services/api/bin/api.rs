//! Main Entrypoint for the Call Relay API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the tool registry and the outbound clients (model, telephony).
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use callrelay_api::{
    config::Config, router::create_router, state::AppState, telephony::TwilioDialer,
    ws::provider::OpenAiConnector,
};
use callrelay_core::tools::{DemoLog, builtin_registry, weather::OpenMeteoClient};
use openai_realtime::RealtimeConfig;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let http = reqwest::Client::new();
    let demos = DemoLog::new();
    let weather = Arc::new(OpenMeteoClient::new(http.clone()));
    let tools = builtin_registry(demos.clone(), weather, config.tool_timeout)
        .context("Failed to register built-in tools")?;

    let connector = Arc::new(OpenAiConnector::new(RealtimeConfig::new(
        config.openai_api_key.clone(),
        config.realtime_model.clone(),
    )));
    let dialer = Arc::new(TwilioDialer::new(
        http,
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
    ));

    let bind_address = config.bind_address;
    let model = config.realtime_model.clone();
    let public_base_url = config.public_base_url.clone();
    let app_state = Arc::new(
        AppState::new(config, tools, demos, connector, dialer)
            .context("Invalid allowed origin pattern")?,
    );
    let _sweeper = app_state.pending.spawn_sweeper(PENDING_SWEEP_INTERVAL);

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        %model,
        %public_base_url,
        %bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
