// src/main.rs
//! repoforge - build service for pacman-style package repositories

use anyhow::Result;
use clap::{Parser, Subcommand};
use repoforge::setup::ServiceSetup;
use repoforge::{client, server, Error};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_SERVER_CONFIG: &str = "/etc/repoforge/server.conf";
const DEFAULT_CLIENT_CONFIG: &str = "/etc/repoforge/client.conf";

#[derive(Parser)]
#[command(name = "repoforge")]
#[command(version)]
#[command(about = "Build service managing pacman-style binary package repositories", long_about = None)]
struct Cli {
    /// Path of the config file
    #[arg(short, long, global = true, env = "REPOFORGE_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Instance to connect to (client commands)
    #[arg(short, long, global = true)]
    instance: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,

    /// Search packages
    Search {
        /// The search term
        #[arg(short, long)]
        term: String,

        /// The search mode
        #[arg(
            short,
            long,
            default_value = "name-contains",
            value_parser = [
                "name",
                "name-contains",
                "regex",
                "provides",
                "depends",
                "libprovides",
                "libdepends",
            ]
        )]
        mode: String,
    },

    /// Show details about a package
    Package {
        /// The package name
        #[arg(short, long)]
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_ansi(!cli.no_color)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Run => {
            let config_file = cli
                .config_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_CONFIG));
            runtime.block_on(run_server(config_file))
        }
        Commands::Search { term, mode } => {
            let config = load_client_config(cli.config_file, cli.instance.as_deref());
            runtime.block_on(run_client(client::search(&config, &term, &mode)))
        }
        Commands::Package { name } => {
            let config = load_client_config(cli.config_file, cli.instance.as_deref());
            runtime.block_on(run_client(client::show_package(&config, &name)))
        }
    }
}

async fn run_server(config_file: PathBuf) -> Result<()> {
    let mut setup = ServiceSetup::default();
    setup.config_file_path = config_file;
    setup.load_config_files()?;
    let setup = Arc::new(setup);

    setup.load_all_packages()?;
    match setup.restore_packages_from_storage() {
        Ok(restored) if restored > 0 => {
            info!("Restored {restored} packages from the storage environment")
        }
        Ok(_) => {}
        Err(e) => warn!("Unable to restore packages from storage: {e}"),
    }

    // write the freshly loaded databases through the storage cache so the
    // next start can resume from it
    let databases: Vec<(String, String)> = {
        let config = setup.config.read().expect("config lock poisoned");
        config
            .databases
            .iter()
            .map(|db| (db.name.clone(), db.arch.clone()))
            .collect()
    };
    for (name, arch) in databases {
        if let Err(e) = setup.persist_database(&name, &arch) {
            warn!("Unable to persist database {name}@{arch}: {e}");
        }
    }

    server::run_server(setup).await?;
    Ok(())
}

/// Load the client config, exiting with code 10 on failure
fn load_client_config(
    config_file: Option<PathBuf>,
    instance: Option<&str>,
) -> client::ClientConfig {
    let path = config_file.unwrap_or_else(|| PathBuf::from(DEFAULT_CLIENT_CONFIG));
    match client::ClientConfig::parse(&path, instance) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Unable to parse config: {e}");
            eprintln!("Path of config file was: {}", path.display());
            std::process::exit(10);
        }
    }
}

/// Run a client operation, translating error kinds into exit codes
async fn run_client(operation: impl std::future::Future<Output = repoforge::Result<()>>) -> Result<()> {
    match operation.await {
        Ok(()) => Ok(()),
        Err(e @ Error::Config(_)) => {
            eprintln!("{e}");
            std::process::exit(10);
        }
        Err(e @ Error::Parse(_)) => {
            eprintln!("{e}");
            std::process::exit(11);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(12);
        }
    }
}
