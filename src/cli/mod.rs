pub mod app;
pub mod commands;
pub mod simulate;

pub use app::{App, Config, ConfigError, LinkSettings, SimulatorSettings};
pub use commands::{Cli, Commands, ConfigCommand};
pub use simulate::{run_simulation, SimulationOptions, SimulationReport};
