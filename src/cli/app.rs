use crate::cli::simulate::{run_simulation, SimulationOptions};
use crate::network::monitor::MonitorConfig;
use crate::network::recovery::RecoveryConfig;
use crate::network::retry_queue::RetryPolicy;
use crate::network::stream::StreamConfig;
use crate::network::LinkConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Tunables for the link components; durations are in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub sample_interval_ms: u64,
    pub metrics_refresh_interval_ms: u64,
    pub metrics_window: usize,
    pub max_backoff_ms: u64,
    pub attempt_timeout_factor: u32,
    pub backlog_capacity: usize,
    pub backlog_ttl_ms: u64,
    pub buffer_capacity: usize,
    pub drain_interval_ms: u64,
    pub drain_batch: usize,
    /// Omit to disable buffer compaction
    pub compaction_threshold: Option<f64>,
    pub compaction_fraction: f64,
    pub stream_send_timeout_ms: u64,
    pub recovery_max_attempts: u32,
    pub recovery_backoff_cap_ms: u64,
    pub connectivity_poll_ms: u64,
    pub conservative_delay_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        let retry = RetryPolicy::default();
        let stream = StreamConfig::default();
        let recovery = RecoveryConfig::default();
        let link = LinkConfig::default();
        Self {
            sample_interval_ms: millis(monitor.sample_interval),
            metrics_refresh_interval_ms: millis(monitor.metrics_refresh_interval),
            metrics_window: link.metrics_window,
            max_backoff_ms: millis(retry.max_backoff),
            attempt_timeout_factor: retry.attempt_timeout_factor,
            backlog_capacity: retry.backlog_capacity,
            backlog_ttl_ms: millis(retry.backlog_ttl),
            buffer_capacity: stream.buffer_capacity,
            drain_interval_ms: millis(stream.drain_interval),
            drain_batch: stream.drain_batch,
            compaction_threshold: stream.compaction_threshold,
            compaction_fraction: stream.compaction_fraction,
            stream_send_timeout_ms: millis(stream.send_timeout),
            recovery_max_attempts: recovery.max_backoff_attempts,
            recovery_backoff_cap_ms: millis(recovery.backoff_cap),
            connectivity_poll_ms: millis(recovery.connectivity_poll),
            conservative_delay_ms: millis(recovery.conservative_delay),
        }
    }
}

impl LinkSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("sample_interval_ms", self.sample_interval_ms),
            ("metrics_refresh_interval_ms", self.metrics_refresh_interval_ms),
            ("drain_interval_ms", self.drain_interval_ms),
            ("stream_send_timeout_ms", self.stream_send_timeout_ms),
            ("connectivity_poll_ms", self.connectivity_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        for (field, value) in [
            ("metrics_window", self.metrics_window),
            ("buffer_capacity", self.buffer_capacity),
            ("drain_batch", self.drain_batch),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if let Some(threshold) = self.compaction_threshold {
            check_fraction("compaction_threshold", threshold)?;
        }
        check_fraction("compaction_fraction", self.compaction_fraction)
    }

    /// Build the runtime configuration for a [`crate::network::LinkManager`]
    pub fn to_link_config(&self) -> LinkConfig {
        let defaults = RecoveryConfig::default();
        LinkConfig {
            monitor: MonitorConfig {
                sample_interval: Duration::from_millis(self.sample_interval_ms),
                metrics_refresh_interval: Duration::from_millis(self.metrics_refresh_interval_ms),
            },
            retry: RetryPolicy {
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                attempt_timeout_factor: self.attempt_timeout_factor,
                backlog_capacity: self.backlog_capacity,
                backlog_ttl: Duration::from_millis(self.backlog_ttl_ms),
            },
            stream: StreamConfig {
                buffer_capacity: self.buffer_capacity,
                drain_interval: Duration::from_millis(self.drain_interval_ms),
                drain_batch: self.drain_batch,
                compaction_threshold: self.compaction_threshold,
                compaction_fraction: self.compaction_fraction,
                send_timeout: Duration::from_millis(self.stream_send_timeout_ms),
            },
            recovery: RecoveryConfig {
                max_backoff_attempts: self.recovery_max_attempts,
                backoff_cap: Duration::from_millis(self.recovery_backoff_cap_ms),
                connectivity_poll: Duration::from_millis(self.connectivity_poll_ms),
                conservative_delay: Duration::from_millis(self.conservative_delay_ms),
                ..defaults
            },
            metrics_window: self.metrics_window,
        }
    }
}

/// Defaults for the simulated companion used by `pairlink simulate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub latency_ms: u64,
    pub loss_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            latency_ms: 40,
            loss_rate: 0.02,
            seed: 7,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkSettings,
    pub simulator: SimulatorSettings,
}

impl Config {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "pairlink", "pairlink")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).context("Failed to parse configuration file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content).context("Failed to write configuration file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        check_fraction("simulator.loss_rate", self.simulator.loss_rate)
    }

    pub fn to_link_config(&self) -> LinkConfig {
        self.link.to_link_config()
    }
}

/// Main application state
pub struct App {
    pub config: Config,
    pub config_path: PathBuf,
}

impl App {
    pub fn new() -> Result<Self> {
        let config_path = Config::default_config_file()?;
        let config =
            Config::load_or_create(&config_path).context("Failed to initialize configuration")?;
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn handle_config_show(&self) -> Result<()> {
        let content =
            toml::to_string_pretty(&self.config).context("Failed to serialize configuration")?;
        println!("# {}", self.config_path.display());
        println!("{}", content);
        Ok(())
    }

    pub fn handle_config_path(&self) -> Result<()> {
        println!("{}", self.config_path.display());
        Ok(())
    }

    /// Write default settings to the config file
    pub fn handle_config_init(&mut self, force: bool) -> Result<()> {
        if self.config != Config::default() && !force {
            println!(
                "{} has custom settings; pass --force to overwrite them",
                self.config_path.display()
            );
            return Ok(());
        }
        self.config = Config::default();
        self.config.save_to(&self.config_path)?;
        println!("Wrote default configuration to {}", self.config_path.display());
        Ok(())
    }

    pub async fn handle_simulate(&self, options: SimulationOptions) -> Result<()> {
        let report = run_simulation(&self.config, options)
            .await
            .context("Simulation failed")?;

        println!("{}", "=".repeat(60));
        println!("{:^60}", "LINK SIMULATION");
        println!("{}", "=".repeat(60));
        println!("Messages sent:      {}", report.messages_sent);
        println!("Messages delivered: {}", report.messages_delivered);
        println!("Telemetry packets:  {}", report.packets_streamed);
        println!("{}", "-".repeat(60));
        let diagnostics = serde_json::to_string_pretty(&report.diagnostics)
            .context("Failed to format diagnostics")?;
        println!("{}", diagnostics);
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value })
    }
}
