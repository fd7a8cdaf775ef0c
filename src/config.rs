//! Monitor configuration.
//!
//! Settings are layered: an optional TOML/JSON file, then `PVWATCH_*`
//! environment variables, then command-line flags (applied by the
//! binary on top of the loaded value).
//!
//! ```toml
//! channels = ["TEST:HEARTBEAT", "TEST:COUNTER"]
//! prefix = ""
//! clock_offset = 0.0
//! data_file = "run.csv"
//! skew_warning = "1s"
//! skew_error = "5s"
//! status_interval = "60s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::channel::{channels_from_names, Channel};
use crate::engine::EngineSettings;
use crate::error::{MonitorError, Result};
use crate::sink::{resolve_path, DEFAULT_FLUSH_EVERY};
use crate::skew::SkewThresholds;

/// Environment variable prefix, e.g. `PVWATCH_CLOCK_OFFSET=-2.5`.
pub const ENV_PREFIX: &str = "PVWATCH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Channel names, without the prefix.
    pub channels: Vec<String>,
    /// File listing one channel name per line. Exclusive with `channels`.
    pub channel_file: Option<PathBuf>,
    pub prefix: String,
    /// Seconds added to source timestamps. May be negative.
    pub clock_offset: f64,
    pub data_file: Option<PathBuf>,
    /// Directory relative data files are placed in.
    pub data_dir: PathBuf,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub skew_warning: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub skew_error: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub status_interval: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "crate::duration::deserialize")]
    pub transport_timeout: Duration,
    pub flush_every: usize,
    pub summary_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let skew = SkewThresholds::default();
        Self {
            channels: Vec::new(),
            channel_file: None,
            prefix: String::new(),
            clock_offset: 0.0,
            data_file: None,
            data_dir: PathBuf::from("data"),
            verbose: false,
            log_file: None,
            skew_warning: skew.warning,
            skew_error: skew.error,
            status_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            transport_timeout: Duration::from_secs(5),
            flush_every: DEFAULT_FLUSH_EVERY,
            summary_file: None,
        }
    }
}

impl MonitorConfig {
    /// Load from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(MonitorError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("channels"),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<MonitorConfig>())
            .map_err(|e| MonitorError::Configuration(e.to_string()))
    }

    /// Check settings that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        self.skew_thresholds()?;
        if !self.clock_offset.is_finite() {
            return Err(MonitorError::Configuration(
                "clock offset must be a finite number of seconds".to_string(),
            ));
        }
        if self.status_interval.is_zero() {
            return Err(MonitorError::Configuration(
                "status interval must be greater than zero".to_string(),
            ));
        }
        if self.transport_timeout.is_zero() {
            return Err(MonitorError::Configuration(
                "transport timeout must be greater than zero".to_string(),
            ));
        }
        if self.flush_every == 0 {
            return Err(MonitorError::Configuration(
                "flush_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn skew_thresholds(&self) -> Result<SkewThresholds> {
        SkewThresholds::new(self.skew_warning, self.skew_error)
    }

    /// Build the channel list, applying the prefix once.
    ///
    /// Names come either from `channels` or from `channel_file`, never
    /// both, and at least one is required.
    pub fn resolve_channels(&self) -> Result<Vec<Channel>> {
        let names = match (&self.channel_file, self.channels.is_empty()) {
            (Some(_), false) => {
                return Err(MonitorError::Configuration(
                    "specify channels either on the command line or with --file, not both"
                        .to_string(),
                ))
            }
            (Some(path), true) => load_channel_file(path)?,
            (None, _) => self.channels.clone(),
        };

        if names.is_empty() {
            return Err(MonitorError::Configuration(
                "no channels specified".to_string(),
            ));
        }
        Ok(channels_from_names(&self.prefix, &names))
    }

    /// Resolved CSV path, if a data file was requested.
    pub fn data_path(&self) -> Option<PathBuf> {
        self.data_file
            .as_deref()
            .map(|path| resolve_path(path, &self.data_dir))
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        self.validate()?;
        Ok(EngineSettings {
            clock_offset: self.clock_offset,
            skew: self.skew_thresholds()?,
            data_file: self.data_path(),
            flush_every: self.flush_every,
            status_interval: self.status_interval,
            connect_timeout: self.connect_timeout,
            transport_timeout: self.transport_timeout,
            summary_file: self.summary_file.clone(),
        })
    }
}

/// Read channel names from a file: one per line, blank lines and `#`
/// comments skipped.
pub fn load_channel_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MonitorError::Configuration(format!(
            "cannot read channel file {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
