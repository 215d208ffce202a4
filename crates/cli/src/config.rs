//! Command line arguments and node configuration loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use fabric::NodeConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Command;

#[derive(Parser, Debug)]
#[command(name = "fabric-cli")]
#[command(about = "Run node fabric scenarios over the in-process driver", long_about = None)]
pub struct CliConfig {
    /// JSON file with a node configuration; defaults apply otherwise.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "fabric=info,fabric_cli=info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        match &self.config {
            Some(path) => load_node_config(path),
            None => Ok(NodeConfig::default()),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| self.log.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();

        let node_config = self.node_config()?;
        let result = self.command.execute(node_config).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&result.details)?);
        } else {
            println!("{result}");
        }
        Ok(())
    }
}

pub fn load_node_config(path: &Path) -> anyhow::Result<NodeConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: NodeConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    config
        .memory
        .validate()
        .with_context(|| format!("invalid memory layout in {}", path.display()))?;
    Ok(config)
}
