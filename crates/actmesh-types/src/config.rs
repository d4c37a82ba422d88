//! Transport configuration.
//!
//! All fields have defaults, so an empty TOML document is a valid config.
//! Call [`TransportConfig::validate`] (done by [`TransportConfig::from_toml_str`])
//! before handing a config to a listener or client.

use crate::error::{ConfigError, PatternError};
use crate::pattern::PinSet;
use crate::serde_compat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 22_222;
/// Default port for listeners and clients.
pub const DEFAULT_PORT: u16 = 10101;
/// Default HTTP route for action requests.
pub const DEFAULT_PATH: &str = "/act";
/// Maximum single frame size (16 MB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Transport kind for a listener or client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed frames over a long-lived TCP socket.
    Tcp,
    /// One envelope per HTTP POST exchange.
    #[default]
    #[serde(alias = "web")]
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Which loop-guard checks are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub own_message: bool,
    pub message_loop: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            own_message: true,
            message_loop: true,
        }
    }
}

/// Which enabled checks only warn instead of rejecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarnConfig {
    pub own_message: bool,
    pub message_loop: bool,
}

/// A listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// HTTP route (ignored for TCP).
    pub path: String,
    /// Patterns this listener exposes; empty exposes everything.
    #[serde(deserialize_with = "serde_compat::one_or_many")]
    pub pin: Vec<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            pin: Vec::new(),
        }
    }
}

impl ListenConfig {
    pub fn tcp(port: u16) -> Self {
        Self {
            kind: TransportKind::Tcp,
            port,
            ..Self::default()
        }
    }

    pub fn http(port: u16) -> Self {
        Self {
            kind: TransportKind::Http,
            port,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin.push(pin.into());
        self
    }

    pub fn pins(&self) -> Result<PinSet, PatternError> {
        PinSet::parse_all(&self.pin)
    }
}

/// A client endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    /// HTTP route (ignored for TCP).
    pub path: String,
    /// Patterns forwarded to this peer; empty forwards everything.
    #[serde(deserialize_with = "serde_compat::one_or_many")]
    pub pin: Vec<String>,
    /// Per-client timeout; falls back to [`TransportConfig::timeout_ms`].
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            pin: Vec::new(),
            timeout_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn tcp(port: u16) -> Self {
        Self {
            kind: TransportKind::Tcp,
            port,
            ..Self::default()
        }
    }

    pub fn http(port: u16) -> Self {
        Self {
            kind: TransportKind::Http,
            port,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin.push(pin.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn pins(&self) -> Result<PinSet, PatternError> {
        PinSet::parse_all(&self.pin)
    }

    /// `host:port` of the remote listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Top-level transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default per-call timeout.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// Correlation sweep period; bounds how late a timeout may fire.
    pub sweep_interval_ms: u64,
    /// How long `close` waits for in-flight work before forcing errors.
    pub close_grace_ms: u64,
    pub max_frame_bytes: u32,
    pub check: CheckConfig,
    pub warn: WarnConfig,
    pub listen: Vec<ListenConfig>,
    pub client: Vec<ClientConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            sweep_interval_ms: 20,
            close_grace_ms: 0,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            check: CheckConfig::default(),
            warn: WarnConfig::default(),
            listen: Vec::new(),
            client: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout must be greater than 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be greater than 0".into(),
            ));
        }
        for listen in &self.listen {
            listen.pins()?;
        }
        for client in &self.client {
            client.pins()?;
            if client.timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "client {} timeout must be greater than 0",
                    client.address()
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Effective timeout for calls made through `client`.
    pub fn client_timeout(&self, client: &ClientConfig) -> Duration {
        Duration::from_millis(client.timeout_ms.unwrap_or(self.timeout_ms))
    }
}
