//! CLI module for vpcforge.
//!
//! This module provides the command-line interface for planning, applying
//! and destroying network environments.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, ProviderKind};
pub use output::OutputFormatter;
