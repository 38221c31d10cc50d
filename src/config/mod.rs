//! Proxy configuration, read from a TOML file.
//!
//! Every field is optional; anything left out takes its default:
//!
//! ```toml
//! port = 8080
//! read_timeout = 10    # seconds
//! write_timeout = 10   # seconds
//!
//! [backend]
//! host = ":80"         # `name`, `name:port`, or `:port` for this machine
//! scheme = "http"
//! timeout = 30         # seconds
//!
//! [cache]
//! default_ttl = 3600   # seconds
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Command line of the `cachet` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "cachet")]
#[command(about = "HTTP caching reverse proxy")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "CACHET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Listen port, overriding the configuration file
    #[arg(long, short, env = "CACHET_PORT")]
    pub port: Option<u16>,

    /// Log level for the proxy's own events (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Resolves the effective configuration.
    ///
    /// A missing file at the default path means "run with defaults"; a
    /// missing file the user named explicitly is an error.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = if !self.config.exists() && self.config == Path::new(DEFAULT_CONFIG_PATH) {
            info!(path = %self.config.display(), "no configuration file, using defaults");
            Config::default()
        } else {
            Config::from_toml(&self.config)?
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    /// Seconds a client connection may take to deliver its next request.
    pub read_timeout: u64,
    /// Seconds any single write to a client may take.
    pub write_timeout: u64,
    pub backend: BackendConfig,
    pub cache: CacheConfig,
}

/// Where requests are forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub scheme: String,
    /// Seconds allowed for connecting and receiving the response head, and
    /// for each read of the response body.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL in seconds for responses that declare none.
    pub default_ttl: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: 10,
            write_timeout: 10,
            backend: BackendConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: ":80".to_owned(),
            scheme: "http".to_owned(),
            timeout: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { default_ttl: 3600 }
    }
}

impl Config {
    /// Loads and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid TOML for this schema, and
    /// [`ConfigError::Invalid`] if [`validate`](Self::validate) rejects it.
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values a file could not have rejected by type alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend.scheme.eq_ignore_ascii_case("http") {
            return Err(ConfigError::Invalid(format!(
                "backend scheme `{}` is not supported, only `http` is",
                self.backend.scheme
            )));
        }
        let host = self.backend.host.trim();
        if host.is_empty() || host == ":" {
            return Err(ConfigError::Invalid("backend host is empty".to_owned()));
        }
        if self.backend.timeout == 0 {
            return Err(ConfigError::Invalid(
                "backend timeout must be at least one second".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl)
    }
}
