use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pairlink")]
#[command(about = "Reliable messaging and telemetry streaming to a paired companion device")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scripted session against a simulated companion
    ///
    /// Streams GPS, heart rate and rep telemetry, sends periodic state
    /// messages and finishes with an emergency stop, then prints the link
    /// diagnostics. Settings not given on the command line come from the
    /// config file.
    ///
    /// Examples:
    ///   pairlink simulate
    ///   pairlink simulate --duration-secs 30 --loss-rate 0.1
    ///   pairlink simulate --outage-at-secs 5 --outage-secs 4
    Simulate {
        /// Session length in seconds
        #[arg(short, long, default_value_t = 10)]
        duration_secs: u64,
        /// Fraction of sends the companion drops, within [0, 1]
        #[arg(short, long)]
        loss_rate: Option<f64>,
        /// One-way latency of the simulated link
        #[arg(long)]
        latency_ms: Option<u64>,
        /// Take the companion out of reach at this offset
        #[arg(long)]
        outage_at_secs: Option<u64>,
        /// How long the outage lasts
        #[arg(long, default_value_t = 3)]
        outage_secs: u64,
        /// Seed for the simulated loss
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Configuration file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the active configuration
    Show,
    /// Show the configuration file path
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite custom settings
        #[arg(short, long)]
        force: bool,
    },
}
