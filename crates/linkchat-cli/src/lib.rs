//! linkchat CLI
//!
//! Runs the linkchat engine over TCP sockets with a line-oriented prompt.
//! Devices, identity and engine tunables come from a TOML file.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod files;
pub mod link;

pub use cli::{Cli, Commands};
pub use commands::{Command, CommandDispatcher, Repl};
pub use config::{AppConfig, IdentityConfig, NetworkConfig, PeerConfig};
pub use error::{CliError, Result};
pub use files::DirFileStore;
pub use link::TcpLink;
