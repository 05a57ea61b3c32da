//! Boardlink - TCP communication core for robot-module middleware
//!
//! Runs a connection manager with a shared variable service, or sends a
//! single command to one.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use boardlink::config::{self, Config};
use boardlink::network::{ConnectionManager, ManagerEvent, ModuleClient};
use boardlink::protocol;
use boardlink::service::VariableService;
use boardlink::shared_var::SubscriptionNotification;

/// Boardlink - robot-module middleware core
#[derive(Parser)]
#[command(name = "boardlink")]
#[command(author = "Boardlink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "TCP command/response transport and shared variables for robot modules", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept module connections and host shared variables
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one command and print the response
    Send {
        /// Host running the connection manager
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// Command name
        command: String,

        /// Command parameters
        #[arg(default_value = "")]
        params: String,

        /// Seconds to wait for the response
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port } => {
            run_serve(config, port).await?;
        }
        Commands::Send {
            server,
            port,
            command,
            params,
            timeout,
        } => {
            run_send(config, &server, port, &command, &params, timeout).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the connection manager and shared variable service
async fn run_serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<SubscriptionNotification>();
    let service = VariableService::new(config.general.module_name.as_str(), Arc::new(notify_tx));

    for var in &config.shared_variables {
        let info = var.to_info()?;
        service.registry().create(info).await?;
        tracing::info!("Declared shared variable '{}'", var.name);
    }

    let mut manager = ConnectionManager::new(config.network.to_network_config(port));
    let mut events = manager.subscribe();
    manager.start().await?;

    let bind_addr = manager
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    println!("\n========================================");
    println!("  Boardlink Running");
    println!("========================================");
    println!("  Module: {}", service.module_name());
    println!("  Listening: {}", bind_addr);
    println!("  Shared variables: {}", service.registry().len().await);
    println!("========================================");
    println!("\nWaiting for modules to connect...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        log_event(&event);
                        service.handle_event(&manager, &event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Event loop lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(notification) = notify_rx.recv() => {
                service.deliver(&manager, &notification).await;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    manager.stop().await?;
    tracing::info!("Connection manager stopped");

    Ok(())
}

fn log_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::ClientConnected { addr } => {
            println!("+ Module connected: {}", addr);
        }
        ManagerEvent::ClientDisconnected { addr, reason } => {
            println!("- Module disconnected: {} ({})", addr, reason);
        }
        ManagerEvent::CommandReceived { addr, command } => {
            tracing::debug!("{} <- {}", addr, command);
        }
        ManagerEvent::ResponseReceived { addr, response } => {
            tracing::debug!("{} <- {}", addr, response);
        }
        ManagerEvent::Error { message } => {
            tracing::error!("Connection manager error: {}", message);
        }
        _ => {}
    }
}

/// Send one command and print its response
async fn run_send(
    config: Config,
    server: &str,
    port: u16,
    command: &str,
    params: &str,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let server_addr: SocketAddr = match format!("{}:{}", server, port).parse() {
        Ok(addr) => addr,
        Err(_) => boardlink::network::resolve_host(server, port).await?,
    };

    let client = ModuleClient::new(
        config.network.to_network_config(Some(port)),
        config.general.module_name.as_str(),
    );
    client.connect(server_addr).await?;

    let result = client
        .execute(command, params, Duration::from_secs(timeout_secs))
        .await;
    client.disconnect().await?;

    let pair = result?;
    println!("{}", pair.response());
    if !pair.response().success() {
        anyhow::bail!("{} failed: {}", command, pair.response().params());
    }

    Ok(())
}
