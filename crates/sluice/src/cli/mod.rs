//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use sluice_common::{Handle, SluicePaths};
use sluice_network::{FilePortAllocator, NetworkConfig, NetworkManager, UpInputs};
use tokio::io::AsyncReadExt;

/// Sluice - container network plugin
#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for sluice state
    #[arg(long, global = true, env = "SLUICE_ROOT")]
    pub root: Option<PathBuf>,

    /// Path to the JSON network configuration
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Plugin actions.
#[derive(Subcommand)]
pub enum Commands {
    /// Create the shared NAT network
    Create,

    /// Delete the shared NAT network
    Delete,

    /// Bring up networking for a container (request JSON on stdin)
    Up {
        /// Container handle
        #[arg(long)]
        handle: String,
    },

    /// Tear down networking for a container
    Down {
        /// Container handle
        #[arg(long)]
        handle: String,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = match &self.config_file {
            Some(path) => NetworkConfig::load(path)
                .wrap_err_with(|| format!("Failed to load config {}", path.display()))?,
            None => NetworkConfig::default(),
        };
        let paths = self
            .root
            .clone()
            .map_or_else(SluicePaths::new, SluicePaths::with_root);

        match self.command {
            Commands::Create => {
                let manager = manager(config, &paths)?;
                let network = manager.create_host_network().await?;
                tracing::debug!(id = %network.id, "NAT network ready");
                Ok(())
            }

            Commands::Delete => {
                let manager = manager(config, &paths)?;
                manager.delete_host_network().await?;
                Ok(())
            }

            Commands::Up { handle } => {
                let handle = Handle::new(handle)?;
                let inputs = read_up_inputs().await?;

                let manager = manager(config, &paths)?;
                let outputs = manager.up(&handle, &inputs).await?;

                println!("{}", serde_json::to_string(&outputs)?);
                Ok(())
            }

            Commands::Down { handle } => {
                let handle = Handle::new(handle)?;

                let manager = manager(config, &paths)?;
                manager.down(&handle).await?;
                Ok(())
            }
        }
    }
}

fn manager(config: NetworkConfig, paths: &SluicePaths) -> Result<NetworkManager> {
    let bindings = crate::platform::host_bindings()?;

    paths.create_dirs()?;
    let allocator = FilePortAllocator::new(config.tracker(), paths.port_pool());

    Ok(NetworkManager::new(bindings, Arc::new(allocator), config))
}

/// Read the `up` request from stdin. Empty input is an empty request.
async fn read_up_inputs() -> Result<UpInputs> {
    let mut raw = String::new();
    tokio::io::stdin().read_to_string(&mut raw).await?;
    parse_up_inputs(&raw)
}

fn parse_up_inputs(raw: &str) -> Result<UpInputs> {
    if raw.trim().is_empty() {
        return Ok(UpInputs::default());
    }
    serde_json::from_str(raw).wrap_err("Failed to parse up inputs")
}
