use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DEFAULT_NAMESPACE, Namespace};

pub const CONFIG_ENV: &str = "APPLET_HOST_CONFIG";
pub const NAMESPACE_ENV: &str = "APPLET_HOST_NAMESPACE";
pub const CALL_TIMEOUT_ENV: &str = "APPLET_HOST_CALL_TIMEOUT_MS";
pub const PLACEMENT_HINT_ENV: &str = "APPLET_HOST_PLACEMENT_HINT";

const DEFAULT_CALL_TIMEOUT_MS: u64 = 25_000;
const DEFAULT_EVENT_CAPACITY: usize = 64;
pub const MAX_EVENT_CAPACITY: usize = 65_536;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Toml(value.to_string())
    }
}

/// Applet host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Dotted prefix of applet services and interfaces.
    pub namespace: String,
    /// Deadline for every bus round-trip, activation included.
    pub call_timeout_ms: u64,
    /// Passed to applet factories when hosts do not supply one.
    pub placement_hint: i32,
    /// Queued events per subscriber before it is reported as falling behind.
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            placement_hint: 0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl HostConfig {
    /// `<config dir>/applet-host/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        BaseDirs::new().map(|base| base.config_dir().join("applet-host").join("config.toml"))
    }

    /// Loads defaults, then the config file, then environment overrides.
    ///
    /// An explicit path (argument or `APPLET_HOST_CONFIG`) must exist; the
    /// default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(namespace) = lookup(NAMESPACE_ENV) {
            self.namespace = namespace.trim().to_string();
        }
        if let Some(timeout) = lookup(CALL_TIMEOUT_ENV) {
            self.call_timeout_ms = timeout.trim().parse().map_err(|err| ConfigError::InvalidValue {
                key: CALL_TIMEOUT_ENV,
                reason: format!("{err}"),
            })?;
        }
        if let Some(hint) = lookup(PLACEMENT_HINT_ENV) {
            self.placement_hint = hint.trim().parse().map_err(|err| ConfigError::InvalidValue {
                key: PLACEMENT_HINT_ENV,
                reason: format!("{err}"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let namespace_ok = !self.namespace.is_empty()
            && self.namespace.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            });
        if !namespace_ok {
            return Err(ConfigError::InvalidValue {
                key: "namespace",
                reason: format!("'{}' is not a dotted bus name", self.namespace),
            });
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "call_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if !(1..=MAX_EVENT_CAPACITY).contains(&self.event_capacity) {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity",
                reason: format!("must be between 1 and {MAX_EVENT_CAPACITY}"),
            });
        }
        Ok(())
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.namespace.clone())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
