//! Settings collaborator: connections, model configuration and locale.
//!
//! The pipeline only sees the [`SettingsStore`] trait. [`JsonSettingsStore`]
//! is the bundled implementation: a JSON file under `~/.sqlwizard` with
//! secrets kept in the system keyring.

mod store;
mod types;

pub use store::JsonSettingsStore;
pub use types::{
    DatabaseConnectionConfig, ModelConfig, ModelCredentials, RuntimeOptions, Settings,
};

/// Read-only view of user settings consumed by the orchestrator.
pub trait SettingsStore: Send + Sync {
    fn connection(&self, id: &str) -> Option<DatabaseConnectionConfig>;
    fn model_config(&self) -> ModelConfig;
    fn locale(&self) -> String;
    fn runtime(&self) -> RuntimeOptions {
        RuntimeOptions::default()
    }
}

/// Settings held in memory; used by tests and by hosts that manage their own
/// persistence.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub Settings);

impl SettingsStore for StaticSettings {
    fn connection(&self, id: &str) -> Option<DatabaseConnectionConfig> {
        self.0.databases.iter().find(|db| db.id == id).cloned()
    }

    fn model_config(&self) -> ModelConfig {
        self.0.ai_config.clone()
    }

    fn locale(&self) -> String {
        self.0.language.clone()
    }

    fn runtime(&self) -> RuntimeOptions {
        self.0.runtime.clone()
    }
}
