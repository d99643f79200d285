use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use venue_fleet::{
    config::RegistryConfig,
    registry::{RegistryState, credentials::CredentialStore, spawn_registry_server},
    util::get_registry_config_path,
};

#[derive(Debug, Clone, Parser)]
#[command(about = "Reference fleet registry")]
struct Args {
    /// Config file (defaults to $VENUE_REGISTRY_CONFIG or ./registry.toml)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Clone, Subcommand)]
enum Cmd {
    /// Accept device links and serve the operator API
    Serve,
    /// Issue (or rotate) the api key of a site and print the device identity
    Issue {
        #[arg(long)]
        site: String,

        /// Write the identity file here instead of printing it
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("venue_fleet", LevelFilter::DEBUG),
        ("venue_registry", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<RegistryConfig> {
    let path = path.unwrap_or_else(get_registry_config_path);
    if path.exists() {
        RegistryConfig::load(&path)
    } else {
        info!("{} not found, using defaults", path.display());
        Ok(RegistryConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = load_config(args.config)?;

    match args.command {
        Cmd::Serve => {
            let state = RegistryState::from_config(&config)?;
            spawn_registry_server(config.bind_addr, state).await?;
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
        }
        Cmd::Issue { site, out } => {
            let mut store = CredentialStore::open(&config.credentials_file)?;
            let identity = store.issue(&site)?;
            match out {
                Some(path) => {
                    identity.save(&path)?;
                    info!("wrote identity for {site} to {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&identity)?),
            }
        }
    }

    Ok(())
}
