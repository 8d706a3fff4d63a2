//! Configuration types for the device session core.

use crate::error::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Cloud assistant endpoint settings.
    pub connection: ConnectionConfig,
    /// Reconnect policy tuning.
    pub reconnect: ReconnectConfig,
    /// Pre-connect provisioning endpoint.
    pub provision: ProvisionConfig,
    /// Default audio parameters advertised in the hello greeting.
    /// The server's hello response overrides these per session.
    pub audio: AudioParams,
}

/// Cloud assistant WebSocket endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server hostname.
    pub host: String,
    /// WebSocket path.
    pub path: String,
    /// Server port.
    pub port: u16,
    /// Whether to use TLS (`wss://`).
    pub tls: bool,
    /// Bearer access token sent in the connect headers.
    pub access_token: String,
    /// Protocol version header value.
    pub protocol_version: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "api.tenclass.net".to_owned(),
            path: "/xiaozhi/v1/".to_owned(),
            port: 443,
            tls: true,
            access_token: "test-token".to_owned(),
            protocol_version: 1,
        }
    }
}

/// Reconnect policy tuning.
///
/// All timings are in milliseconds so tests can shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum connection attempts per `reconnect()` call.
    pub max_attempts: u32,
    /// Minimum interval between `reconnect()` calls.
    pub cooldown_ms: u64,
    /// How long to wait for the server handshake after a successful
    /// transport connect.
    pub handshake_timeout_ms: u64,
    /// Base delay between failed attempts.
    pub retry_delay_base_ms: u64,
    /// Additional delay per attempt already made.
    pub retry_delay_increment_ms: u64,
    /// Settle time after closing a lingering connection handle.
    pub close_settle_ms: u64,
    /// How long the wake-word path polls for a connection before giving up.
    pub wakeword_connect_wait_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            cooldown_ms: 5_000,
            handshake_timeout_ms: 50_000,
            retry_delay_base_ms: 1_000,
            retry_delay_increment_ms: 200,
            close_settle_ms: 500,
            wakeword_connect_wait_ms: 2_000,
        }
    }
}

/// Pre-connect HTTP provisioning endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Activation endpoint URL.
    pub url: String,
    /// Delay between provisioning retries in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            url: "https://api.tenclass.net/xiaozhi/ota/".to_owned(),
            retry_delay_ms: 1_000,
        }
    }
}

/// Negotiated audio stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Opus frame duration in milliseconds.
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_duration: 60,
        }
    }
}

impl DeviceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| DeviceError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save(&self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DeviceError::Config(format!("cannot create config dir: {e}")))?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| DeviceError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, text)
            .map_err(|e| DeviceError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(self.clone())
    }

    /// Load from the default path, falling back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only when an existing file fails to parse.
    pub fn load_or_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Default configuration file location (`<config dir>/edgetalk/config.toml`).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("edgetalk").join("config.toml"))
}
