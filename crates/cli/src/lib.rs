//! CLI tool for exercising a node fabric in one process.
//!
//! Provides commands for:
//! - Building a mesh of nodes around a broker
//! - Stressing link memory allocation
//! - Printing the effective configuration

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
