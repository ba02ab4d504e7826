pub mod database;
pub mod generation;
pub mod llm;
pub mod prompt;
pub mod settings;
pub mod ssh;

pub use database::{DatabaseManager, DatabaseSchema, Endpoint};
pub use generation::{
    GenerationEvent, GenerationPhase, GenerationRequest, GenerationResult, Orchestrator,
};
pub use llm::{LlmGateway, OutputSink};
pub use prompt::{CompiledPrompt, ResponseLanguage};
pub use settings::{JsonSettingsStore, SettingsStore, StaticSettings};
pub use ssh::TunnelManager;
