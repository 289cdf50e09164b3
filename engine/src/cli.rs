//! CLI interface for Foreman
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for driving the controller.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Foreman task controller
///
/// Routes an intent into a plan of capability-backed steps, executes them
/// under hook gating, and stops when the decision engine says so.
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a session for an intent
    Run {
        /// The intent to plan and execute
        intent: String,

        /// Approve raised approval requests without prompting (use with care)
        #[arg(long)]
        approve: bool,
    },

    /// Show the persisted task ledger
    Status,

    /// Show recent audit trail events
    History {
        /// Number of events to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_parses() {
        let cli = Cli::parse_from(["foreman", "run", "scrape headlines from bbc.com"]);
        match cli.command {
            Command::Run { intent, approve } => {
                assert_eq!(intent, "scrape headlines from bbc.com");
                assert!(!approve);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["foreman", "--json", "--log", "debug", "status"]);
        assert!(cli.json);
        assert_eq!(cli.log.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_history_limit() {
        let cli = Cli::parse_from(["foreman", "history", "--limit", "25"]);
        match cli.command {
            Command::History { limit } => assert_eq!(limit, 25),
            other => panic!("expected History, got {other:?}"),
        }
    }
}
