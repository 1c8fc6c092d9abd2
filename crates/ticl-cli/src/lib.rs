//! ticl CLI library
//!
//! Drives an invalidation client runtime against an in-process loopback
//! server, for demonstration and smoke testing.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod server;
pub mod simulation;

pub use cli::{Cli, Commands};
pub use config::{CliConfig, SimulationConfig};
pub use error::{CliError, Result};
pub use server::LoopbackServer;
pub use simulation::{Simulation, SimulationReport};
