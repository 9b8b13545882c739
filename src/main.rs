use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use partner_gateway::comms::local_api;
use partner_gateway::gateway::config::GatewayConfig;
use partner_gateway::gateway::registry::{ClientRegistry, PublicKeyState};
use partner_gateway::utils;

#[derive(Parser)]
#[command(name = "partner-gateway", version, about = "Partner API gateway")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Overrides server.port from the config file
    #[arg(long, env = "GATEWAY_PORT", global = true)]
    port: Option<u16>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway HTTP server (default)
    Serve,
    /// Validate the config file and report client key status
    Check,
}

fn check(config: &GatewayConfig) -> bool {
    let registry = ClientRegistry::from_config(config);
    let mut ok = true;
    let mut ids: Vec<_> = registry.iter().map(|c| c.client_id.as_str()).collect();
    ids.sort_unstable();
    for id in ids {
        let Some(client) = registry.get(id) else { continue };
        match &client.public_key {
            PublicKeyState::Loaded(_) => println!("{id}: public key ok"),
            PublicKeyState::Unavailable(reason) => {
                ok = false;
                println!("{id}: public key unavailable ({reason})");
            }
        }
    }
    ok
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = GatewayConfig::from_file(&args.config)?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!(version = partner_gateway::VERSION, config = %args.config, "starting partner gateway");
            local_api::serve(config, args.port).await?;
        }
        Commands::Check => {
            if !check(&config) {
                warn!("one or more client keys could not be loaded");
                std::process::exit(1);
            }
            println!("configuration ok ({} clients)", config.clients.len());
        }
    }

    Ok(())
}
