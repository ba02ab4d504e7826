//! Settings types shared between the settings store and the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::services::ssh::SshTunnelConfig;

/// A saved MySQL connection.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConnectionConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Schema to introspect
    pub database: String,
    #[serde(default)]
    pub ssh_config: Option<SshTunnelConfig>,
}

impl DatabaseConnectionConfig {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port,
            user: user.into(),
            password: String::new(),
            database: database.into(),
            ssh_config: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_ssh(mut self, ssh: SshTunnelConfig) -> Self {
        self.ssh_config = Some(ssh);
        self
    }

    /// The SSH settings, only when tunneling is switched on.
    pub fn enabled_ssh(&self) -> Option<&SshTunnelConfig> {
        self.ssh_config.as_ref().filter(|ssh| ssh.enabled)
    }

    pub fn uses_ssh_tunnel(&self) -> bool {
        self.enabled_ssh().is_some()
    }
}

impl fmt::Debug for DatabaseConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnectionConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssh_config", &self.ssh_config)
            .finish()
    }
}

/// Credentials for the LLM backends. Which fields matter depends on the
/// backend selected by the model id.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelCredentials {
    /// Anthropic API key (direct backend)
    #[serde(default)]
    pub api_key: String,
    /// OAuth access token for Vertex AI. When empty, `gcloud` is asked.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl fmt::Debug for ModelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCredentials")
            .field("api_key", &(!self.api_key.is_empty()).then_some("<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub model: String,
    #[serde(default)]
    pub credentials: ModelCredentials,
    /// Lower the per-request output budget below the model's capacity
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-7-sonnet-latest".to_string(),
            credentials: ModelCredentials::default(),
            max_tokens: None,
        }
    }
}

/// Tunables for timeouts, coalescing and tunnel ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeOptions {
    pub request_timeout_secs: u64,
    pub coalesce_min_chars: usize,
    pub coalesce_max_delay_ms: u64,
    pub tunnel_base_port: u16,
    pub tunnel_connect_timeout_secs: u64,
    pub db_connect_timeout_secs: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            coalesce_min_chars: 48,
            coalesce_max_delay_ms: 120,
            tunnel_base_port: 3307,
            tunnel_connect_timeout_secs: 15,
            db_connect_timeout_secs: 10,
        }
    }
}

impl RuntimeOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn coalesce_max_delay(&self) -> Duration {
        Duration::from_millis(self.coalesce_max_delay_ms)
    }

    pub fn tunnel_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_connect_timeout_secs)
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }
}

/// On-disk layout of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub databases: Vec<DatabaseConnectionConfig>,
    #[serde(default)]
    pub ai_config: ModelConfig,
    #[serde(default)]
    pub runtime: RuntimeOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: default_language(),
            databases: Vec::new(),
            ai_config: ModelConfig::default(),
            runtime: RuntimeOptions::default(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}
