//! CLI module for the terrace convergence engine.
//!
//! This module provides the command-line interface for planning, applying
//! and watching desired resource graphs.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{MessageLevel, OutputFormatter};
