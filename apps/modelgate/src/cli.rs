use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "modelgate", about = "Unified AI API gateway", version)]
pub struct Cli {
    /// Path to the YAML config file. Watched for changes when present.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Override the listen host from the config.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the listen port from the config.
    #[arg(long)]
    pub port: Option<u16>,
}
