//! Construction parameters of an events exporter.
//!
//! An exporter needs to know which relay it speaks for and how often it closes
//! a window. Everything else about the surrounding service is configured
//! elsewhere.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The relay id is empty and would match no snapshot row.
    #[error("relay_id must not be empty")]
    EmptyRelayId,
    /// A zero flush interval would spin the flush task.
    #[error("flush_interval_milliseconds must be greater than zero")]
    ZeroFlushInterval,
}

/// Default flush interval, one minute.
#[must_use]
pub fn default_flush_interval_milliseconds() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration of one events exporter.
pub struct Config {
    /// Identifier of the relay this exporter reports for. Snapshot rows tagged
    /// with any other id are ignored.
    pub relay_id: String,
    /// Milliseconds between window flushes.
    #[serde(default = "default_flush_interval_milliseconds")]
    pub flush_interval_milliseconds: u64,
}

impl Config {
    /// Configuration for `relay_id` with the default flush interval.
    #[must_use]
    pub fn new(relay_id: impl Into<String>) -> Self {
        Self {
            relay_id: relay_id.into(),
            flush_interval_milliseconds: default_flush_interval_milliseconds(),
        }
    }

    /// Replace the flush interval.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_milliseconds = interval.as_millis() as u64;
        self
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not deserialize or does not
    /// validate, see [`Config::validate`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants deserialization cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyRelayId`] or [`Error::ZeroFlushInterval`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.relay_id.is_empty() {
            return Err(Error::EmptyRelayId);
        }
        if self.flush_interval_milliseconds == 0 {
            return Err(Error::ZeroFlushInterval);
        }
        Ok(())
    }

    /// The flush interval as a [`Duration`].
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_milliseconds)
    }
}
