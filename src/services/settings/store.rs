//! JSON settings file with secrets in the system keyring.

use anyhow::{Context, Result};
use keyring::Entry;
use std::env;
use std::path::{Path, PathBuf};

use super::SettingsStore;
use super::types::{DatabaseConnectionConfig, ModelConfig, RuntimeOptions, Settings};

/// Keyring service name for all stored secrets
const KEYRING_SERVICE: &str = "sqlwizard";
const API_KEY_ENTRY: &str = "llm-api-key";

/// Settings loaded from `~/.sqlwizard/settings.json`.
///
/// Secrets left empty in the file are looked up in the keyring:
/// database passwords under the connection id, key passphrases under
/// `ssh:<connection id>` and the LLM API key under `llm-api-key`
/// (falling back to `ANTHROPIC_API_KEY`).
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl JsonSettingsStore {
    /// Load from the default location. A missing file yields defaults.
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path()?)
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid settings file {}", path.display()))?
        } else {
            tracing::info!("No settings file at {}, using defaults", path.display());
            Settings::default()
        };

        Ok(Self { path, settings })
    }

    pub fn default_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".sqlwizard").join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Add or replace a connection and persist the file.
    pub fn upsert_connection(&mut self, config: DatabaseConnectionConfig) -> Result<()> {
        match self.settings.databases.iter_mut().find(|db| db.id == config.id) {
            Some(existing) => *existing = config,
            None => self.settings.databases.push(config),
        }
        self.save()
    }

    pub fn remove_connection(&mut self, id: &str) -> Result<()> {
        self.settings.databases.retain(|db| db.id != id);
        let _ = delete_secret(id);
        let _ = delete_secret(&passphrase_entry(id));
        self.save()
    }

    pub fn set_model_config(&mut self, config: ModelConfig) -> Result<()> {
        self.settings.ai_config = config;
        self.save()
    }

    pub fn set_language(&mut self, language: impl Into<String>) -> Result<()> {
        self.settings.language = language.into();
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.settings)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write settings file {}", self.path.display()))
    }

    // ========== Keyring Methods ==========

    pub fn store_database_password(connection_id: &str, password: &str) -> Result<()> {
        store_secret(connection_id, password)
    }

    pub fn store_key_passphrase(connection_id: &str, passphrase: &str) -> Result<()> {
        store_secret(&passphrase_entry(connection_id), passphrase)
    }

    pub fn store_api_key(api_key: &str) -> Result<()> {
        store_secret(API_KEY_ENTRY, api_key)
    }
}

impl SettingsStore for JsonSettingsStore {
    fn connection(&self, id: &str) -> Option<DatabaseConnectionConfig> {
        let mut config = self.settings.databases.iter().find(|db| db.id == id)?.clone();

        if config.password.is_empty() {
            if let Some(stored) = get_secret(&config.id) {
                config.password = stored;
            }
        }

        if let Some(ssh) = config.ssh_config.as_mut() {
            if ssh.passphrase.is_none() {
                ssh.passphrase = get_secret(&passphrase_entry(id));
            }
        }

        Some(config)
    }

    fn model_config(&self) -> ModelConfig {
        let mut config = self.settings.ai_config.clone();
        if config.credentials.api_key.is_empty() {
            if let Some(key) = get_secret(API_KEY_ENTRY).or_else(|| env::var("ANTHROPIC_API_KEY").ok())
            {
                config.credentials.api_key = key;
            }
        }
        config
    }

    fn locale(&self) -> String {
        self.settings.language.clone()
    }

    fn runtime(&self) -> RuntimeOptions {
        self.settings.runtime.clone()
    }
}

fn passphrase_entry(connection_id: &str) -> String {
    format!("ssh:{}", connection_id)
}

fn get_secret(entry: &str) -> Option<String> {
    Entry::new(KEYRING_SERVICE, entry)
        .ok()
        .and_then(|e| e.get_password().ok())
}

fn store_secret(entry: &str, secret: &str) -> Result<()> {
    Entry::new(KEYRING_SERVICE, entry)
        .context("Failed to create keyring entry")?
        .set_password(secret)
        .context("Failed to store secret in keyring")
}

fn delete_secret(entry: &str) -> Result<()> {
    if let Ok(entry) = Entry::new(KEYRING_SERVICE, entry) {
        let _ = entry.delete_credential();
    }
    Ok(())
}
