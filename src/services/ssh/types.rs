//! SSH tunnel configuration and status types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default SSH port used when the settings leave it out.
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// SSH tunnel settings attached to a database connection.
///
/// Only private-key authentication is supported. `password` exists so a
/// settings file that carries one can be rejected with a clear error instead
/// of silently ignoring it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SshTunnelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bastion hostname
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Path to the private key; `~/` and relative paths are resolved
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Fixed local port; when absent the next free port from the base is used
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl SshTunnelConfig {
    /// Create an enabled tunnel configuration using a private key.
    pub fn with_private_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port,
            username: username.into(),
            private_key: Some(private_key.into()),
            passphrase: None,
            password: None,
            local_port: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_url(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

impl fmt::Debug for SshTunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTunnelConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Snapshot returned by `TunnelManager::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

/// Tunnel lifecycle states broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    Connecting,
    Connected { local_port: u16 },
    Failed { error: String },
    Closed,
}

impl TunnelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected { .. })
    }
}
