use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use misra_ring::config::RingConfig;
use misra_ring::console::run_console;
use misra_ring::dispatch::Dispatcher;
use misra_ring::participant::Participant;
use misra_ring::transport::{ChannelCommunicator, Communicator};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from file if available, otherwise use defaults
    let loaded = RingConfig::from_file("config/default");

    // Initialize structured logging; RUST_LOG wins over the config level
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("misra_ring={level}").into()),
        )
        .with_target(false)
        .init();

    let config = match loaded {
        Ok(config) => {
            info!("Configuration loaded from config/default.toml");
            config
        }
        Err(e) => {
            warn!("Failed to load config file: {}, using defaults", e);
            RingConfig::default()
        }
    };

    info!(
        "Starting misra-ring v{} with {} participants",
        env!("CARGO_PKG_VERSION"),
        config.ring.process_count
    );

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid configuration")?;

    // Bring up one dispatcher + participant per ring position over an
    // in-memory mesh transport.
    let mesh = ChannelCommunicator::mesh(config.ring.process_count);
    for communicator in mesh {
        let process = communicator.process_id();
        let dispatcher = Dispatcher::new(communicator);
        let participant = Participant::new(Arc::clone(&dispatcher), &config);
        // Subscriptions are registered; delivery may start.
        dispatcher.listen();

        tokio::spawn(async move {
            if let Err(e) = participant.run().await {
                error!(process, error = %e, "participant failed");
                std::process::exit(1);
            }
        });

        // The operator console is addressed to the coordinator.
        if process == config.ring.coordinator {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                if let Err(e) = run_console(dispatcher).await {
                    error!(error = %e, "operator console failed");
                }
            });
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    Ok(())
}
