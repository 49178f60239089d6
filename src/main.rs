use anyhow::Result;
use clap::Parser;
use pairlink::cli::{App, Cli, Commands, ConfigCommand, SimulationOptions};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pairlink=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut app = App::new()?;

    match cli.command {
        Commands::Simulate {
            duration_secs,
            loss_rate,
            latency_ms,
            outage_at_secs,
            outage_secs,
            seed,
        } => {
            let options = SimulationOptions {
                duration: Duration::from_secs(duration_secs),
                loss_rate,
                latency: latency_ms.map(Duration::from_millis),
                outage_at: outage_at_secs.map(Duration::from_secs),
                outage_length: Duration::from_secs(outage_secs),
                seed,
            };
            app.handle_simulate(options).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommand::Show => app.handle_config_show()?,
            ConfigCommand::Path => app.handle_config_path()?,
            ConfigCommand::Init { force } => app.handle_config_init(force)?,
        },
    }

    Ok(())
}
