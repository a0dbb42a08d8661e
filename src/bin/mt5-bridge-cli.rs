//! Operational CLI for the bridge (§10.7): `serve` runs a persistent
//! connection with the background health monitor active, `health` performs
//! a single health probe and exits. Mirrors the teacher's own bin-per-crate
//! convention of a thin `clap`-derived wrapper over library entry points.

use clap::{Parser, Subcommand};
use mt5_bridge::{Config, Mt5Client};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mt5-bridge-cli", version, about = "MT5 bridge client operations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connects and stays resident, logging health-monitor events.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connects, runs one health check, prints the result, and exits.
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().unwrap_or_else(|_| Config::default());

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.grpc_port = port;
            }
            let client = Mt5Client::connect(config).await?;
            tracing::info!("mt5 bridge connected, serving");
            let _ = client.health_check().await?;
            tokio::signal::ctrl_c().await?;
            Ok(())
        }
        Command::Health => {
            let client = Mt5Client::connect(config).await?;
            let status = client.health_check().await?;
            println!(
                "healthy={} mt5_available={} connected={} trade_allowed={} build={} reason={}",
                status.healthy,
                status.mt5_available,
                status.connected,
                status.trade_allowed,
                status.build,
                status.reason.as_deref().unwrap_or("")
            );
            if status.healthy {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}
