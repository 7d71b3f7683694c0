//! CLI module for walgate
//!
//! Provides command-line interface for:
//! - serve: Restore if needed, replicate, and serve durable writes
//! - restore: One-shot restore of the latest generation

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{build_config, restore, run, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};
