//! Configuration types for the avlink-stream crate
//!
//! This module defines the per-device tuning knobs of a session: how long a
//! request may wait for its reply, how often subscriptions are re-asserted,
//! how long to wait after connecting before the device is considered ready,
//! and how inbound bytes are split into lines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Telnet "interpret as command" byte that starts a negotiation sequence
pub const TELNET_IAC: u8 = 0xFF;

/// How raw transport chunks are split into frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    /// Bytes that terminate a line; any one of them ends the current line
    /// Default: carriage return and line feed
    pub delimiters: Vec<u8>,

    /// First byte of an out-of-band negotiation sequence
    /// Default: 0xFF (telnet IAC)
    pub negotiation_marker: u8,

    /// Fixed length of a negotiation sequence, marker included
    /// Default: 3
    pub negotiation_len: usize,

    /// Exact line the device sends when it is ready; falls back to the
    /// grammar's banner when unset
    /// Default: None
    pub banner: Option<String>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiters: vec![b'\r', b'\n'],
            negotiation_marker: TELNET_IAC,
            negotiation_len: 3,
            banner: None,
        }
    }
}

/// Configuration for a [`crate::Session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long an in-flight request waits for its response
    /// Default: 20 seconds
    pub response_timeout: Duration,

    /// Interval between blind re-assertions of every live subscription
    /// Default: 600 seconds (10 minutes)
    pub resubscribe_interval: Duration,

    /// Delay after the link comes up before the device is considered ready
    /// Default: 3 seconds
    pub init_delay: Duration,

    /// Line framing
    pub framing: FramingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(20),
            resubscribe_interval: Duration::from_secs(600), // 10 minutes
            init_delay: Duration::from_secs(3),
            framing: FramingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a new SessionConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout.is_zero() {
            return Err(StreamError::Configuration(
                "Response timeout must be greater than 0".to_string(),
            ));
        }

        if self.resubscribe_interval.is_zero() {
            return Err(StreamError::Configuration(
                "Resubscribe interval must be greater than 0".to_string(),
            ));
        }

        if self.framing.delimiters.is_empty() {
            return Err(StreamError::Configuration(
                "At least one line delimiter is required".to_string(),
            ));
        }

        if self.framing.negotiation_len == 0 {
            return Err(StreamError::Configuration(
                "Negotiation sequence length must be greater than 0".to_string(),
            ));
        }

        if self.framing.delimiters.contains(&self.framing.negotiation_marker) {
            return Err(StreamError::Configuration(
                "Negotiation marker cannot also be a line delimiter".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_resubscribe_interval(mut self, interval: Duration) -> Self {
        self.resubscribe_interval = interval;
        self
    }

    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.framing.banner = Some(banner.into());
        self
    }

    pub fn with_delimiters(mut self, delimiters: impl Into<Vec<u8>>) -> Self {
        self.framing.delimiters = delimiters.into();
        self
    }
}

/// Per-device settings as stored in a device settings file
///
/// Every field is optional; missing fields keep the [`SessionConfig`] defaults.
///
/// ```rust
/// use avlink_stream::DeviceSettings;
///
/// let settings = DeviceSettings::from_json(r#"{ "response_timeout_secs": 5 }"#)?;
/// let config = settings.into_config()?;
/// assert_eq!(config.response_timeout.as_secs(), 5);
/// assert_eq!(config.init_delay.as_secs(), 3);
/// # Ok::<(), avlink_stream::StreamError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSettings {
    pub response_timeout_secs: Option<u64>,
    pub resubscribe_interval_secs: Option<u64>,
    pub init_delay_secs: Option<u64>,
    pub banner: Option<String>,
}

impl DeviceSettings {
    /// Parse settings from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StreamError::Configuration(format!("Invalid device settings: {e}")))
    }

    /// Apply the settings on top of the defaults and validate the result
    pub fn into_config(self) -> Result<SessionConfig> {
        let mut config = SessionConfig::default();

        if let Some(secs) = self.response_timeout_secs {
            config.response_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.resubscribe_interval_secs {
            config.resubscribe_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.init_delay_secs {
            config.init_delay = Duration::from_secs(secs);
        }
        config.framing.banner = self.banner;

        config.validate()?;
        Ok(config)
    }
}
