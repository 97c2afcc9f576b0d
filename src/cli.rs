//! Command-line interface for Lazarus
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Lazarus - self-healing engine for service meshes
#[derive(Parser)]
#[command(name = "lazarus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "lazarus.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration
    Check,

    /// Run every probe once and print the snapshot
    Probe {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run the self-healing loop until Ctrl+C
    Supervise {
        /// Print engine status every N seconds (0 disables)
        #[arg(long, default_value = "60")]
        status_interval: u64,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "lazarus", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_supervise() {
        let cli = Cli::try_parse_from(["lazarus", "-c", "/etc/lazarus.toml", "supervise", "--status-interval", "5"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/lazarus.toml"));
        assert!(matches!(cli.command, Commands::Supervise { status_interval: 5 }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["lazarus", "probe", "--json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Probe { json: true }));
    }
}
