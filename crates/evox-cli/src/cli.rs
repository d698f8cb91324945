//! CLI argument definitions for the `evox` binary.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// EVOX -- request admission, background scheduling and intent-routed
/// persistence for a service process.
#[derive(Parser)]
#[command(
    name = "evox",
    version,
    about = "EVOX runtime: admission control, task scheduling and intent-based storage routing",
    long_about = "Loads a TOML configuration, registers the declared storage backends, and \
                  runs the admission queue, task scheduler and health monitor until Ctrl-C."
)]
pub struct Cli {
    /// Path to the TOML configuration file.  Defaults are used when omitted.
    #[arg(long, short, global = true, env = "EVOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the runtime and run until interrupted.
    Run,

    /// Register the configured backends, probe them once and print a report.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and print the effective settings.
    CheckConfig,

    /// Generate a fresh base64 encryption key for sealed intents.
    GenKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["evox", "status", "--json", "--config", "evox.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("evox.toml")));
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }
}
