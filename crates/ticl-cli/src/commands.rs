//! Command handlers for the ticl CLI

use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::Result;
use crate::simulation::Simulation;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Simulate { objects, invalidations } => {
                Self::handle_simulate_command(config, objects, invalidations).await
            }
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Print each listener event as a JSON line, then the final report
    async fn handle_simulate_command(config: CliConfig, objects: usize, invalidations: usize) -> Result<()> {
        let report = Simulation::new(config, objects, invalidations)
            .run(|event| match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Cannot print event: {}", e),
            })
            .await?;

        info!(
            "Received {} invalidations, server saw {} acks",
            report.invalidations_received, report.acknowledged_by_server
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    fn handle_config_command(config: &CliConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }
}
