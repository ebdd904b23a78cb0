use axum::{http::StatusCode, routing::get, Router};
use clap::Parser;
use device_api::backend::{HttpRegistryClient, MqttConnector};
use device_api::config::Config;
use device_api::{metrics, rest, DeviceFacade};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting device API");

    // Credentials are required up front
    let device_credentials = match config.device_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let registry_credentials = match config.registry_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Registry host: {}", registry_credentials.host_name);
    info!(
        "Messaging host: {}:{}",
        device_credentials.host_name, config.mqtt_port
    );
    info!("Backend timeout: {}ms", config.backend_timeout_ms);
    info!("Delete policy: {:?}", config.delete_policy);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let registry = match HttpRegistryClient::new(registry_credentials, config.sas_ttl()) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to create registry client: {}", e);
            std::process::exit(1);
        }
    };
    let messaging = MqttConnector::new(device_credentials, config.mqtt_port, config.sas_ttl());

    let facade = DeviceFacade::new(
        Arc::new(registry),
        Arc::new(messaging),
        config.facade_options(),
    );

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(facade, config.expose_backend_errors));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Shutting down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
