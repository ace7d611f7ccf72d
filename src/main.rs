//! pacer - simulated stepper motion controller
//!
//! Serves the pacer wire protocol over TCP with a simulated device table,
//! command queue and thermal model.

use pacer_sim::{Config, Simulator};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if PACER_SIM_CONFIG is set, then env overrides)
    let config_path = std::env::var("PACER_SIM_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting pacer simulator");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Firmware: {}", config.firmware.name);
    tracing::info!("  Queue capacity: {}", config.firmware.queue_capacity);
    tracing::info!("  Step rate: {} Hz", config.firmware.step_rate_hz);
    tracing::info!(
        "  Devices: {} steppers, {} heaters, {} sensors, {} inputs, {} outputs",
        config.devices.steppers.len(),
        config.devices.heaters.len(),
        config.devices.sensors.len(),
        config.devices.inputs.len(),
        config.devices.outputs.len()
    );

    let simulator = Arc::new(Simulator::start(config));

    // Spawn shutdown signal handler
    let shutdown_simulator = simulator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping simulator...");
        shutdown_simulator.shutdown();
    });

    // Run simulator (blocks until shutdown)
    simulator.run().await?;

    tracing::info!("Simulator stopped");
    Ok(())
}
