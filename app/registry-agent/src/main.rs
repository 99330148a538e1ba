//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Registry agent main binary
//!
//! Registers this instance (when configured), tracks the configured
//! services and periodically reports what it sees until asked to stop.

use registry_core::{
    config::RegistryConfig, error::RegistryError, init_registry, ServiceRegistry,
    REGISTRY_VERSION,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting registry agent v{}", REGISTRY_VERSION);

    // Load configuration
    let config = load_config()?;
    info!("Configuration loaded successfully");

    let registry = Arc::new(init_registry(config.clone()).await?);

    // A failed registration is fatal for the registering role only
    match registry.register_self().await {
        Ok(Some(key)) => info!("Registered this instance as {}", key),
        Ok(None) => info!("No registration configured, running discovery only"),
        Err(e) => error!("Service registration failed: {}", e),
    }

    registry.track_configured().await;

    let reporter = {
        let registry = registry.clone();
        let interval = config.report_interval;
        tokio::spawn(async move { report_loop(registry, interval).await })
    };

    shutdown_signal().await;

    info!("Shutting down registry agent");
    reporter.abort();
    registry.shutdown().await?;

    info!("Registry agent shutdown completed");
    Ok(())
}

/// Periodically log the discovered view and registration health
async fn report_loop(registry: Arc<ServiceRegistry>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        for (key, state) in registry.registrations().await {
            if state.is_lost() {
                error!("Registration {} lost: {:?}", key, state);
            }
        }

        let states = registry.service_states();
        let mut services: Vec<_> = states.keys().cloned().collect();
        services.sort();

        for service_name in services {
            let count = registry.endpoints(&service_name).len();
            match registry.select_endpoint(&service_name) {
                Ok(endpoint) => info!(
                    "service {} ({:?}): {} endpoints, selected {} at {}",
                    service_name, states[&service_name], count, endpoint.key, endpoint.address
                ),
                Err(e) => warn!(
                    "service {} ({:?}): {}",
                    service_name, states[&service_name], e
                ),
            }
        }
    }
}

/// Load configuration from file, then apply environment overrides
fn load_config() -> Result<RegistryConfig, RegistryError> {
    let config_path =
        std::env::var("REGISTRY_CONFIG").unwrap_or_else(|_| "config/registry.toml".to_string());

    let mut config = if std::path::Path::new(&config_path).exists() {
        RegistryConfig::from_file(&config_path)?
    } else {
        info!("No config file at {}, using defaults", config_path);
        RegistryConfig::default()
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Handle shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }

    info!("Shutdown signal received");
}
