//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Terrace - plan, apply and drift detection for declarative infrastructure.
#[derive(Parser, Debug)]
#[command(name = "terrace")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TERRACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Desired graph document, overriding `pipeline.desired_graph`.
    #[arg(short, long, global = true, env = "TERRACE_GRAPH")]
    pub graph: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and the desired graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the convergence plan without changing anything.
    Plan {
        /// Refresh recorded state from the provider first.
        #[arg(short, long)]
        refresh: bool,

        /// Show attribute-level differences.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge the recorded state to the desired graph.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Refresh recorded state from the provider first.
        #[arg(short, long)]
        refresh: bool,
    },

    /// Check for drift between recorded and live state.
    Drift {
        /// Exit with status 2 when drift is found.
        #[arg(long)]
        detailed_exitcode: bool,
    },

    /// Run the pipeline: converge on every desired graph change and check
    /// for drift on a schedule.
    Watch {
        /// Disable scheduled drift checks.
        #[arg(long)]
        no_drift: bool,
    },

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the recorded snapshot.
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
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "terrace", "plan", "--refresh", "-g", "stack.json", "--output", "json",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.graph, Some(PathBuf::from("stack.json")));
        assert!(matches!(
            cli.command,
            Commands::Plan {
                refresh: true,
                detailed: false
            }
        ));
    }

    #[test]
    fn test_state_unlock_arguments() {
        let cli =
            Cli::try_parse_from(["terrace", "state", "unlock", "--lock-id", "abc", "--force"])
                .unwrap();
        match cli.command {
            Commands::State {
                command: StateCommands::Unlock { lock_id, force },
            } => {
                assert_eq!(lock_id.as_deref(), Some("abc"));
                assert!(force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
