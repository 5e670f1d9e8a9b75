//! Command line interface definition

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Data directory for received files
    #[arg(short, long)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the engine and open an interactive session
    Run {
        /// Display name announced to peers, overrides the configured one
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}
