//! Static catalogue of supported models and the backend each one uses.

use serde::Serialize;

use crate::error::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Anthropic Messages API
    Anthropic,
    /// Claude served from Vertex AI
    VertexClaude,
    /// Gemini on Vertex AI
    VertexGemini,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Anthropic => "anthropic",
            BackendKind::VertexClaude => "vertex-claude",
            BackendKind::VertexGemini => "vertex-gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    /// Identifier stored in settings
    pub id: &'static str,
    pub display_name: &'static str,
    /// Model name sent to the provider
    pub api_model: &'static str,
    pub backend: BackendKind,
    /// Output token capacity
    pub max_tokens: u32,
}

const fn model(
    id: &'static str,
    display_name: &'static str,
    api_model: &'static str,
    backend: BackendKind,
    max_tokens: u32,
) -> ModelSpec {
    ModelSpec {
        id,
        display_name,
        api_model,
        backend,
        max_tokens,
    }
}

static MODELS: &[ModelSpec] = &[
    model(
        "claude-sonnet-4-20250514",
        "Claude Sonnet 4 (2025-05-14)",
        "claude-sonnet-4-20250514",
        BackendKind::Anthropic,
        64000,
    ),
    model(
        "claude-3-7-sonnet-20250219",
        "Claude 3.7 Sonnet (2025-02-19)",
        "claude-3-7-sonnet-20250219",
        BackendKind::Anthropic,
        16384,
    ),
    model(
        "claude-3-5-sonnet-20241022",
        "Claude 3.5 Sonnet (2024-10-22)",
        "claude-3-5-sonnet-20241022",
        BackendKind::Anthropic,
        8192,
    ),
    model(
        "claude-3-7-sonnet-latest",
        "Claude 3.7 Sonnet (latest)",
        "claude-3-7-sonnet-latest",
        BackendKind::Anthropic,
        16384,
    ),
    model(
        "claude-3-5-sonnet-latest",
        "Claude 3.5 Sonnet (latest)",
        "claude-3-5-sonnet-latest",
        BackendKind::Anthropic,
        8192,
    ),
    model(
        "vertex-claude-sonnet-4",
        "Claude Sonnet 4 on Vertex AI",
        "claude-sonnet-4@20250514",
        BackendKind::VertexClaude,
        64000,
    ),
    model(
        "vertex-claude-3-7-sonnet",
        "Claude 3.7 Sonnet on Vertex AI",
        "claude-3-7-sonnet@20250219",
        BackendKind::VertexClaude,
        16384,
    ),
    model(
        "vertex-claude-3-5-sonnet",
        "Claude 3.5 Sonnet v2 on Vertex AI",
        "claude-3-5-sonnet-v2@20241022",
        BackendKind::VertexClaude,
        8192,
    ),
    model(
        "vertex-gemini-1.5-flash",
        "Gemini 1.5 Flash on Vertex AI",
        "gemini-1.5-flash-001",
        BackendKind::VertexGemini,
        8192,
    ),
    model(
        "vertex-gemini-1.5-pro",
        "Gemini 1.5 Pro on Vertex AI",
        "gemini-1.5-pro-002",
        BackendKind::VertexGemini,
        8192,
    ),
];

/// Look a model up by its settings id. Unknown ids are rejected rather than
/// mapped to a default.
pub fn resolve(model_id: &str) -> Result<&'static ModelSpec, GenerationError> {
    MODELS
        .iter()
        .find(|m| m.id == model_id)
        .ok_or_else(|| GenerationError::UnsupportedModel(model_id.to_string()))
}

pub fn available_models() -> &'static [ModelSpec] {
    MODELS
}
