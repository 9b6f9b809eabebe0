//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// vpcforge - Declarative virtual network environments.
#[derive(Parser, Debug)]
#[command(name = "vpcforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "VPCFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format on stderr (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Control plane to talk to.
    #[arg(long, global = true, default_value = "aws", env = "VPCFORGE_PROVIDER")]
    pub provider: ProviderKind,

    /// Maximum in-flight provider operations (overrides the config).
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and build the resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Generate and display the plan without executing it.
    Plan {
        /// Include deletes of owned resources no longer declared.
        #[arg(long, conflicts_with = "destroy")]
        prune: bool,

        /// Plan the deletion of every owned resource.
        #[arg(long)]
        destroy: bool,

        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Create and update resources to match the configuration.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Also delete owned resources no longer declared.
        #[arg(long)]
        prune: bool,
    },

    /// Delete every resource owned by the environment.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check for drift between config and live resources.
    Drift,

    /// List resources owned by the environment.
    Status,
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
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Control plane implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Amazon EC2 and classic ELB.
    Aws,
    /// Process-local control plane; state is lost on exit.
    Memory,
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
    fn test_plan_flags() {
        let cli = Cli::try_parse_from(["vpcforge", "--provider", "memory", "plan", "--prune"]).unwrap();
        assert_eq!(cli.provider, ProviderKind::Memory);
        assert!(matches!(
            cli.command,
            Commands::Plan {
                prune: true,
                destroy: false,
                ..
            }
        ));
    }

    #[test]
    fn test_plan_prune_and_destroy_conflict() {
        assert!(Cli::try_parse_from(["vpcforge", "plan", "--prune", "--destroy"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "vpcforge",
            "apply",
            "--yes",
            "--output",
            "json",
            "--max-concurrency",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.max_concurrency, Some(2));
        assert!(matches!(cli.command, Commands::Apply { yes: true, prune: false }));
    }
}
