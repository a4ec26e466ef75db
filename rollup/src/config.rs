//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
//!
//! Configuration is YAML. Every field has a default, an empty document is a
//! valid configuration:
//!
//! ```yaml
//! retention_seconds: 60
//! expire_seconds: 300
//! mode: sum
//! ingest:
//!   binding_addr: "0.0.0.0:15555"
//! sink:
//!   file:
//!     path: /var/lib/rollup/out.txt
//! telemetry:
//!   prometheus_addr: "127.0.0.1:9000"
//! ```
use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use rollup_window::{Mode, Width, window};
use serde::Deserialize;

use crate::{ingest, sink};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The retention interval does not form a valid window width.
    #[error("Invalid retention: {0}")]
    Retention(#[from] window::Error),
    /// Windows would expire before their first flush.
    #[error("expire_seconds ({expire}) must not be smaller than retention_seconds ({retention})")]
    ExpireBeforeRetention {
        /// Configured expiry horizon
        expire: u64,
        /// Configured retention interval
        retention: u64,
    },
    /// The ingest server must admit at least one connection.
    #[error("ingest.max_connections must be greater than zero")]
    NoConnections,
    /// The ingest server must admit at least one byte per line.
    #[error("ingest.max_line_length must be greater than zero")]
    NoLineLength,
}

fn default_retention() -> u64 {
    60
}

fn default_expire() -> u64 {
    300
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Width of every window and the period between flushes, in seconds.
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    /// Age, in seconds, past which a window is discarded.
    #[serde(default = "default_expire")]
    pub expire_seconds: u64,
    /// The aggregation applied to each window.
    #[serde(default)]
    pub mode: Mode,
    /// The line protocol listener.
    #[serde(default)]
    pub ingest: ingest::Config,
    /// Where aggregated lines go.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub sink: sink::Config,
    /// Export of the relay's own metrics, disabled when absent.
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retention_seconds: default_retention(),
            expire_seconds: default_expire(),
            mode: Mode::default(),
            ingest: ingest::Config::default(),
            sink: sink::Config::default(),
            telemetry: None,
        }
    }
}

/// Configuration for the relay's own telemetry
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// Address to serve prometheus metrics on.
    pub prometheus_addr: SocketAddr,
}

impl Config {
    /// Parse a configuration from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not describe a `Config`. Values are
    /// not validated, see [`Config::validate`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        // serde_yaml rejects an empty document, treat it as all defaults.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Check the configuration for values the relay cannot run with,
    /// returning the window width on success.
    ///
    /// # Errors
    ///
    /// Returns an error if the retention is zero, the expiry horizon is
    /// shorter than the retention or the ingest limits are zero.
    pub fn validate(&self) -> Result<Width, Error> {
        let width = Width::from_secs(self.retention_seconds)?;
        if self.expire_seconds < self.retention_seconds {
            return Err(Error::ExpireBeforeRetention {
                expire: self.expire_seconds,
                retention: self.retention_seconds,
            });
        }
        if self.ingest.max_connections == 0 {
            return Err(Error::NoConnections);
        }
        if self.ingest.max_line_length == 0 {
            return Err(Error::NoLineLength);
        }
        Ok(width)
    }
}
