//! Command line interface definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ticl")]
#[command(about = "Run an invalidation client against a loopback server")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML format)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register objects, receive invalidations and acknowledge them
    Simulate {
        /// Number of objects to register
        #[arg(short, long, default_value_t = 3)]
        objects: usize,

        /// Number of invalidations the server sends
        #[arg(short, long, default_value_t = 5)]
        invalidations: usize,
    },
    /// Print the effective configuration as TOML
    Config,
}
