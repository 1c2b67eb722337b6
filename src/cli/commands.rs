//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - declarative resource reconciliation.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "CONVERGE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter stack file.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack file.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show resources in dependency order.
    Graph,

    /// Show the operations needed to converge.
    Plan {
        /// Read live outputs before planning.
        #[arg(long)]
        refresh: bool,
    },

    /// Converge recorded state towards the stack file.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Read live outputs before planning.
        #[arg(long)]
        refresh: bool,

        /// Maximum provider calls in flight.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Delete every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Replace recorded outputs with live ones.
    Refresh,

    /// Check for drift between recorded and live state.
    Drift,

    /// Manage recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show recorded state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from(["converge", "apply", "--yes", "--concurrency", "2"])
            .expect("parses");
        assert!(matches!(
            cli.command,
            Commands::Apply {
                yes: true,
                refresh: false,
                concurrency: Some(2)
            }
        ));
        assert_eq!(cli.output, OutputFormat::Text);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["converge", "plan", "--output", "json", "--log-format", "json"])
            .expect("parses");
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_state_unlock() {
        let cli = Cli::try_parse_from(["converge", "state", "unlock", "--force"]).expect("parses");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true, .. }
            }
        ));
    }
}
