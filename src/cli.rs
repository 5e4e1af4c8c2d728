use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "cacheward", about = "Cacheward caching forward HTTP proxy")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./cacheward.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to bind the proxy listener on; overrides the configuration file.
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
