use crate::handler::WaitOptions;
use crate::timeout::TimeoutPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from procwatch.toml.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub timeouts: TimeoutsConfig,
    pub output: OutputConfig,
    pub kill: KillConfig,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Wall-clock limit from start to finish.
    pub total_secs: Option<f64>,
    /// Longest allowed gap between output lines.
    pub idle_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub store: bool,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KillConfig {
    /// Wait between the soft and the hard kill.
    pub grace_ms: u64,
    /// Kill descendants too.
    pub tree: bool,
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A timeout was negative, NaN or too large.
    InvalidTimeout { field: &'static str, value: f64 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidTimeout { field, value } => {
                write!(f, "invalid timeout {} = {}", field, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidTimeout { .. } => None,
        }
    }
}

// --- Default implementations ---

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            store: true,
            log_file: None,
        }
    }
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            grace_ms: 3000,
            tree: true,
        }
    }
}

/// Load config from `path`. A missing file yields the defaults; a file that
/// exists but does not parse is an error.
pub fn load_config(path: &Path) -> Result<MonitorConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(MonitorConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let config: MonitorConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.timeout_policy()?;
    Ok(config)
}

fn to_duration(field: &'static str, secs: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    match secs {
        None => Ok(None),
        Some(value) => Duration::try_from_secs_f64(value)
            .map(Some)
            .map_err(|_| ConfigError::InvalidTimeout { field, value }),
    }
}

impl MonitorConfig {
    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, ConfigError> {
        Ok(TimeoutPolicy::new(
            to_duration("total_secs", self.timeouts.total_secs)?,
            to_duration("idle_secs", self.timeouts.idle_secs)?,
        ))
    }

    /// Resolve into options for `ProcessHandler::wait_for_finish`.
    pub fn wait_options(&self) -> Result<WaitOptions, ConfigError> {
        Ok(WaitOptions {
            timeouts: self.timeout_policy()?,
            store_output: self.output.store,
            log_file: self.output.log_file.clone(),
            kill_grace: Duration::from_millis(self.kill.grace_ms),
        })
    }
}
