//! Concierge daemon and control CLI.
//!
//! `concierge run` starts every service in the manifest and supervises them
//! until SIGTERM/SIGINT. The other subcommands talk to a running daemon over
//! its control socket, or inspect the manifest offline.

mod bootstrap;

use anyhow::{bail, Result};
use boss::{
    ControlClient, ControlResponse, Daemon, HealthStatus, ServiceSnapshot, Status,
};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "concierge",
    about = "Dependency-aware service lifecycle daemon for the assistant backend",
    version,
    author
)]
struct Cli {
    /// Path to the manifest (auto-detected if not specified)
    #[arg(short, long, env = "CONCIERGE_CONFIG")]
    config: Option<PathBuf>,

    /// Control socket path (defaults to the manifest's setting)
    #[arg(long, env = "CONCIERGE_SOCKET")]
    socket: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start all services and supervise them until signalled
    Run {
        /// Abort startup when a required service fails
        #[arg(long)]
        strict: bool,

        /// Don't open the control socket
        #[arg(long)]
        no_control: bool,
    },

    /// Show service status
    Status {
        /// Service name (optional, shows all if not specified)
        name: Option<String>,
    },

    /// List all services
    List,

    /// Start a service
    Start {
        /// Service name
        name: String,
    },

    /// Stop a service and everything depending on it
    Stop {
        /// Service name
        name: String,
    },

    /// Restart a service and everything depending on it
    Restart {
        /// Service name
        name: String,
    },

    /// Print the start order
    Order,

    /// Validate the manifest
    Check,

    /// Check whether the daemon is responding
    Ping,

    /// Stop all services and exit the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_daemon(&cli, false, false).await?,

        Some(Commands::Run { strict, no_control }) => run_daemon(&cli, strict, no_control).await?,

        Some(Commands::Order) => {
            let config = bootstrap::load_config(&bootstrap::detect_config_path(cli.config.as_deref())?)?;
            let order = bootstrap::start_order(&config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&order)?);
            } else {
                print_order(&order);
            }
        }

        Some(Commands::Check) => {
            let path = bootstrap::detect_config_path(cli.config.as_deref())?;
            let config = bootstrap::load_config(&path)?;
            let order = bootstrap::start_order(&config)?;
            println!("{}: OK ({} services)", path.display(), order.len());
        }

        Some(Commands::Ping) => {
            if client(&cli).ping().await? {
                println!("concierge is running");
            } else {
                bail!("concierge is not responding");
            }
        }

        Some(Commands::Status { ref name }) => {
            let client = client(&cli);
            let response = match name {
                Some(name) => client.get_service_status(name).await?,
                None => client.get_all_status().await?,
            };
            print_response(response, cli.json)?;
        }

        Some(Commands::List) => print_response(client(&cli).list_services().await?, cli.json)?,

        Some(Commands::Start { ref name }) => {
            print_response(client(&cli).start_service(name).await?, cli.json)?
        }

        Some(Commands::Stop { ref name }) => {
            print_response(client(&cli).stop_service(name).await?, cli.json)?
        }

        Some(Commands::Restart { ref name }) => {
            print_response(client(&cli).restart_service(name).await?, cli.json)?
        }

        Some(Commands::Shutdown) => print_response(client(&cli).shutdown().await?, cli.json)?,
    }

    Ok(())
}

/// Run the daemon in the foreground.
async fn run_daemon(cli: &Cli, strict: bool, no_control: bool) -> Result<()> {
    let path = bootstrap::detect_config_path(cli.config.as_deref())?;
    let config = bootstrap::load_config(&path)?;
    info!(manifest = %path.display(), "Loaded manifest");

    let allow_partial_failure = config.manager.allow_partial_failure && !strict;
    let socket = if no_control {
        None
    } else {
        Some(cli.socket.clone().unwrap_or_else(|| config.manager.control_socket.clone()))
    };

    let manager = bootstrap::build_manager(config).await?;
    let daemon = Daemon::new(manager, socket);

    if !daemon.run(allow_partial_failure).await? {
        bail!("one or more required services failed");
    }
    Ok(())
}

/// Control client for the configured socket.
fn client(cli: &Cli) -> ControlClient {
    let socket = cli.socket.clone().unwrap_or_else(|| {
        bootstrap::detect_config_path(cli.config.as_deref())
            .and_then(|path| bootstrap::load_config(&path))
            .map(|config| config.manager.control_socket)
            .unwrap_or_else(|_| PathBuf::from(boss::control::DEFAULT_CONTROL_SOCKET))
    });
    ControlClient::new(socket)
}

fn print_response(response: ControlResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        if let ControlResponse::Error { .. } = response {
            std::process::exit(1);
        }
        return Ok(());
    }

    match response {
        ControlResponse::Success { message } => println!("{}", message),
        ControlResponse::Error { message } => bail!(message),
        ControlResponse::Status { status } => print_status(&status),
        ControlResponse::StatusMap { overall, services } => print_status_map(overall, &services),
        ControlResponse::ServiceList { services } => print_services(&services),
        ControlResponse::Order { services } => print_order(&services),
        ControlResponse::Pong => println!("pong"),
    }
    Ok(())
}

fn print_order(order: &[String]) {
    for (i, name) in order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, name);
    }
}

/// Print service status.
fn print_status(status: &Status) {
    println!("● {} - {}", status.name, status.status);

    if let Some(state) = status.details.get("state").and_then(|v| v.as_str()) {
        println!("   State: {}", state);
    }

    if let Some(ref version) = status.version {
        println!("   Version: {}", version);
    }

    if let Some(ref error) = status.error {
        println!("   Error: {}", error);
    }

    for (key, value) in status.details.iter().filter(|(k, _)| k.as_str() != "state") {
        println!("   {}: {}", key, value);
    }

    println!("   Checked: {}", status.last_check.format("%Y-%m-%d %H:%M:%S"));
}

fn print_status_map(overall: HealthStatus, services: &BTreeMap<String, Status>) {
    println!("Overall: {}", overall);
    println!();
    for status in services.values() {
        print_status(status);
        println!();
    }
}

fn print_services(services: &[ServiceSnapshot]) {
    if services.is_empty() {
        println!("No services found");
        return;
    }

    println!("{:<20} {:<12} {:>8} {:>9}  DEPENDS ON", "SERVICE", "STATE", "PRIORITY", "RESTARTS");
    for svc in services {
        println!(
            "{:<20} {:<12} {:>8} {:>9}  {}",
            svc.name,
            svc.state.to_string(),
            svc.priority,
            svc.restart_count,
            svc.dependencies.join(", ")
        );
        if let Some(uptime) = svc.uptime_secs {
            let hours = uptime / 3600;
            let minutes = (uptime % 3600) / 60;
            let seconds = uptime % 60;
            println!("{:<20} uptime {}h {}m {}s", "", hours, minutes, seconds);
        }
        if let Some(ref error) = svc.last_error {
            println!("{:<20} error: {}", "", error);
        }
    }
}
