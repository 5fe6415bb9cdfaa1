//! metaproxy
//!
//! Loads the static configuration, binds the listeners, serves the admin
//! API and runs until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mp_proxy::admin::{self, Admin};
use mp_proxy::config::{Config, LogFormat, StaticConfig};
use mp_proxy::engine::{Dispatcher, Registry};
use mp_proxy::proxy::Listener;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MP_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
    }

    info!("Starting metaproxy");
    info!(
        config_file = %config.config_file.display(),
        admin_addr = ?config.admin_addr,
        max_connections = config.max_connections,
        strict_validation = config.strict_validation,
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(registry);
    let admin = Admin::new(dispatcher.clone()).with_strict_validation(config.strict_validation);

    let listeners = StaticConfig::load(&config.config_file)?
        .apply(&admin, config.max_connections)
        .await
        .context("Failed to load static configuration")?;

    for listener_config in listeners {
        let bind_addr = listener_config.bind_addr;
        let listener = Listener::bind(listener_config, dispatcher.clone())
            .await
            .with_context(|| format!("Failed to bind listener on {bind_addr}"))?;
        let listener = Arc::new(listener);
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "Listener error");
            }
        });
    }

    if let Some(addr) = config.admin_addr {
        let tcp = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin API on {addr}"))?;
        tokio::spawn(async move {
            if let Err(e) = admin::http::serve(tcp, admin).await {
                error!(error = %e, "Admin API error");
            }
        });
    } else {
        info!("Admin API disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    dispatcher.shutdown().await;
    info!("metaproxy stopped");
    Ok(())
}
