//! CLI argument definitions using clap
//!
//! Commands:
//! - walgate serve --dsn <path> --replica-dir <dir> [--config <path>] [--addr <host:port>]
//! - walgate restore --dsn <path> --replica-dir <dir> [--output <path>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// walgate - SQLite write gateway acknowledging writes only once they are
/// replicated
#[derive(Parser, Debug)]
#[command(name = "walgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Restore if needed, then serve durable writes over HTTP
    Serve {
        /// Local SQLite database path
        #[arg(long)]
        dsn: PathBuf,

        /// Root directory of the file replica
        #[arg(long)]
        replica_dir: PathBuf,

        /// Optional JSON configuration file; flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, `host:port` or `:port`
        #[arg(long)]
        addr: Option<String>,
    },

    /// Restore the latest replicated generation into a file and exit
    Restore {
        /// Database path to restore into unless `--output` is given
        #[arg(long)]
        dsn: PathBuf,

        /// Root directory of the file replica
        #[arg(long)]
        replica_dir: PathBuf,

        /// Write the restored database here instead of `--dsn`
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_requires_dsn_and_replica_dir() {
        assert!(Cli::try_parse_from(["walgate", "serve", "--dsn", "app.db"]).is_err());
        assert!(Cli::try_parse_from(["walgate", "serve", "--replica-dir", "r"]).is_err());

        let cli = Cli::try_parse_from([
            "walgate", "serve", "--dsn", "app.db", "--replica-dir", "r", "--addr", ":9000",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Command::Serve {
                dsn: "app.db".into(),
                replica_dir: "r".into(),
                config: None,
                addr: Some(":9000".into()),
            }
        );
    }

    #[test]
    fn test_restore_output_is_optional() {
        let cli = Cli::try_parse_from(["walgate", "restore", "--dsn", "a.db", "--replica-dir", "r"])
            .unwrap();
        assert!(matches!(cli.command, Command::Restore { output: None, .. }));
    }
}
