//! pacer-cli - G-code front end for pacer controllers
//!
//! Reads G-code from stdin or a TCP line server and drives one or more
//! controllers through the motion planner.

mod commands;
mod dispatcher;
mod gcode;
mod transport;

use clap::{Parser, Subcommand};
use colored::Colorize;
use dispatcher::Dispatcher;
use pacer_client::{Client, ConnectionConfig};
use pacer_motion::{MachineConfig, Planner};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use transport::LineServer;

#[derive(Parser)]
#[command(name = "pacer-cli")]
#[command(about = "G-code front end for pacer stepper controllers")]
#[command(version)]
struct Cli {
    /// Machine configuration (YAML)
    #[arg(short, long, env = "PACER_MACHINE_CONFIG")]
    config: Option<PathBuf>,

    /// Controller address; repeat for more controllers (overrides the config)
    #[arg(long = "controller", value_name = "ADDR")]
    controllers: Vec<SocketAddr>,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "500")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read G-code from stdin
    Run,

    /// Serve G-code lines over TCP
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:7420")]
        listen: SocketAddr,
    },

    /// Describe connected controllers
    Info,

    /// Print queue and heater status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let config = MachineConfig::from_file(path)?;
            config.validate()?;
            config
        }
        None => MachineConfig::default(),
    };

    let addresses = if cli.controllers.is_empty() {
        config
            .controllers
            .iter()
            .map(|c| c.address.parse::<SocketAddr>())
            .collect::<Result<Vec<_>, _>>()?
    } else {
        cli.controllers.clone()
    };

    let connection = ConnectionConfig::new()
        .with_request_timeout(Duration::from_millis(cli.timeout_ms));
    let mut clients = Vec::with_capacity(addresses.len());
    for addr in &addresses {
        let client = Client::connect(*addr, connection.clone()).await.map_err(|e| {
            eprintln!("{} {}: {}", "Connection failed".red(), addr, e);
            e
        })?;
        clients.push(Arc::new(client));
    }

    match cli.command {
        Some(Commands::Info) => {
            println!("{}", commands::info(&clients).await?);
        }
        Some(Commands::Status) => {
            println!("{}", commands::status(&clients, &config).await?);
        }
        Some(Commands::Serve { listen }) => {
            let planner = Planner::connect(config, clients).await?;
            let server = Arc::new(LineServer::new(Dispatcher::new(planner)));

            let shutdown_server = server.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                eprintln!("\n{}", "Stopping server...".dimmed());
                shutdown_server.shutdown();
            });

            server.run(listen).await?;
        }
        Some(Commands::Run) | None => {
            let planner = Planner::connect(config, clients).await?;
            transport::run_stdio(Dispatcher::new(planner)).await?;
        }
    }

    Ok(())
}
