//! CLI command definitions using clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Conductor - route queries to expert models
#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Orchestrator config file (YAML or JSON)
    #[arg(short = 'c', long, global = true, default_value = "experts.yaml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Parse the config and check every backend kind is known
    Validate,

    /// Provision and activate every backend, then wait until all are ready
    Up(BringUp),

    /// Probe every backend once and print its readiness
    Status,

    /// Bring everything up, then route one query
    Ask {
        /// The query
        query: String,

        /// Print fragments as they arrive
        #[arg(long)]
        stream: bool,

        #[command(flatten)]
        bring_up: BringUp,
    },

    /// Bring everything up, greet every expert, route one query, tear down
    Smoke {
        /// Query routed at the end
        #[arg(long, default_value = "What is the capital of France?")]
        query: String,

        #[command(flatten)]
        bring_up: BringUp,
    },

    /// Decommission every backend
    Down,
}

/// Timing knobs for bringing backends up.
#[derive(Args, Clone, Copy)]
pub struct BringUp {
    /// Longest time one activation may wait for its resource (e.g. "2m")
    #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
    pub max_wait: Duration,

    /// Pause between retries of pending steps and between readiness probes
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Give up on each bring-up step after this long (default: wait forever)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub ready_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ask_with_durations() {
        let cli = Cli::try_parse_from([
            "conductor",
            "--config",
            "fleet.json",
            "ask",
            "hello",
            "--stream",
            "--poll-interval",
            "5s",
            "--ready-timeout",
            "10m",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("fleet.json"));
        let Commands::Ask { query, stream, bring_up } = cli.command else {
            panic!("expected ask");
        };
        assert_eq!(query, "hello");
        assert!(stream);
        assert_eq!(bring_up.max_wait, Duration::from_secs(120));
        assert_eq!(bring_up.poll_interval, Duration::from_secs(5));
        assert_eq!(bring_up.ready_timeout, Some(Duration::from_secs(600)));
    }
}
