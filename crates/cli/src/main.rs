//! CLI entry point for the node fabric.

use clap::Parser;
use fabric_cli::CliConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    CliConfig::parse().run().await
}
