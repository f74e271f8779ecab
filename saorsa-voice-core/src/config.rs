//! Call configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read the file
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Not valid JSON for [`CallConfig`]
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Parsed but unusable
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server entry without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Per-orchestrator call configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// How long a session may take to reach `Connected`
    #[serde(rename = "connect_timeout_secs", with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Extra publish attempts after a failed signaling send
    pub delivery_retries: u32,
    /// Capacity of the call event broadcast channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            connect_timeout: Duration::from_secs(30),
            delivery_retries: 1,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Parse and validate a JSON document; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the values are unusable
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error describing the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(ConfigError::Invalid(
                "ice server entries need at least one url".to_string(),
            ));
        }
        Ok(())
    }

    /// Total publish attempts per signaling message
    #[must_use]
    pub fn delivery_attempts(&self) -> u32 {
        self.delivery_retries.saturating_add(1)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
