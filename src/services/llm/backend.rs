//! Provider backends. The model id selects a variant once; everything past
//! that point goes through the variant.

use serde_json::{Value, json};
use smol::process::Command;

use super::decode::{
    EventDecoder, anthropic_message_text, decode_anthropic_event, decode_gemini_event,
    gemini_message_text,
};
use super::models::{BackendKind, ModelSpec};
use super::transport::HttpRequest;
use crate::error::{ConfigurationError, GenerationError, WizardError};
use crate::services::settings::ModelCredentials;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const DEFAULT_VERTEX_LOCATION: &str = "us-central1";

/// Where a Vertex AI access token comes from.
#[derive(Clone)]
pub enum TokenSource {
    Static(String),
    /// `gcloud auth print-access-token`
    Gcloud,
}

#[derive(Clone)]
pub struct VertexTarget {
    pub project_id: String,
    pub location: String,
    pub token: TokenSource,
}

#[derive(Clone)]
pub enum Backend {
    Anthropic { api_key: String },
    VertexClaude(VertexTarget),
    VertexGemini(VertexTarget),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Backend {
    pub fn for_model(spec: &ModelSpec, credentials: &ModelCredentials) -> Result<Self, WizardError> {
        match spec.backend {
            BackendKind::Anthropic => {
                if credentials.api_key.trim().is_empty() {
                    return Err(GenerationError::Authentication {
                        backend: BackendKind::Anthropic.name(),
                        status: None,
                        message: "API key is not configured".to_string(),
                    }
                    .into());
                }
                Ok(Backend::Anthropic {
                    api_key: credentials.api_key.trim().to_string(),
                })
            }
            BackendKind::VertexClaude => Ok(Backend::VertexClaude(vertex_target(credentials)?)),
            BackendKind::VertexGemini => Ok(Backend::VertexGemini(vertex_target(credentials)?)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Anthropic { .. } => BackendKind::Anthropic,
            Backend::VertexClaude(_) => BackendKind::VertexClaude,
            Backend::VertexGemini(_) => BackendKind::VertexGemini,
        }
    }

    /// Only Gemini streams tiny fragments often enough to be worth merging.
    pub fn coalesces(&self) -> bool {
        matches!(self, Backend::VertexGemini(_))
    }

    pub(crate) fn decoder(&self) -> EventDecoder {
        match self {
            Backend::Anthropic { .. } | Backend::VertexClaude(_) => decode_anthropic_event,
            Backend::VertexGemini(_) => decode_gemini_event,
        }
    }

    pub(crate) async fn build_request(
        &self,
        spec: &ModelSpec,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        stream: bool,
    ) -> Result<HttpRequest, GenerationError> {
        let backend = self.name();
        match self {
            Backend::Anthropic { api_key } => {
                let mut body = anthropic_body(system_prompt, user_prompt, max_tokens, stream);
                body["model"] = json!(spec.api_model);
                Ok(HttpRequest {
                    backend,
                    url: ANTHROPIC_URL.to_string(),
                    headers: vec![
                        ("x-api-key", api_key.clone()),
                        ("anthropic-version", ANTHROPIC_VERSION.to_string()),
                    ],
                    body,
                })
            }
            Backend::VertexClaude(target) => {
                let mut body = anthropic_body(system_prompt, user_prompt, max_tokens, stream);
                body["anthropic_version"] = json!(VERTEX_ANTHROPIC_VERSION);
                let method = if stream { "streamRawPredict" } else { "rawPredict" };
                Ok(HttpRequest {
                    backend,
                    url: target.model_url("anthropic", spec.api_model, method),
                    headers: vec![(
                        "authorization",
                        format!("Bearer {}", target.token.access_token(backend).await?),
                    )],
                    body,
                })
            }
            Backend::VertexGemini(target) => {
                let method = if stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                Ok(HttpRequest {
                    backend,
                    url: target.model_url("google", spec.api_model, method),
                    headers: vec![(
                        "authorization",
                        format!("Bearer {}", target.token.access_token(backend).await?),
                    )],
                    body: json!({
                        "systemInstruction": { "parts": [{ "text": system_prompt }] },
                        "contents": [{ "role": "user", "parts": [{ "text": user_prompt }] }],
                        "generationConfig": { "maxOutputTokens": max_tokens },
                    }),
                })
            }
        }
    }

    /// Text of a complete, non-streamed response.
    pub(crate) fn message_text(&self, body: &Value) -> Option<String> {
        match self {
            Backend::Anthropic { .. } | Backend::VertexClaude(_) => anthropic_message_text(body),
            Backend::VertexGemini(_) => gemini_message_text(body),
        }
    }
}

fn anthropic_body(system_prompt: &str, user_prompt: &str, max_tokens: u32, stream: bool) -> Value {
    json!({
        "max_tokens": max_tokens,
        "system": system_prompt,
        "messages": [{ "role": "user", "content": user_prompt }],
        "stream": stream,
    })
}

fn vertex_target(credentials: &ModelCredentials) -> Result<VertexTarget, ConfigurationError> {
    let project_id = credentials
        .project_id
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigurationError::Invalid("Vertex AI project id is not configured".into()))?;

    let location = credentials
        .location
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_VERTEX_LOCATION);

    let token = match credentials.access_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => TokenSource::Static(token.to_string()),
        _ => TokenSource::Gcloud,
    };

    Ok(VertexTarget {
        project_id: project_id.to_string(),
        location: location.to_string(),
        token,
    })
}

impl VertexTarget {
    fn model_url(&self, publisher: &str, model: &str, method: &str) -> String {
        format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/{publisher}/models/{model}:{method}",
            loc = self.location,
            project = self.project_id,
        )
    }
}

impl TokenSource {
    async fn access_token(&self, backend: &'static str) -> Result<String, GenerationError> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Gcloud => {
                let auth_error = |message: String| GenerationError::Authentication {
                    backend,
                    status: None,
                    message,
                };

                let output = Command::new("gcloud")
                    .args(["auth", "print-access-token"])
                    .output()
                    .await
                    .map_err(|e| auth_error(format!("failed to run gcloud: {}", e)))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(auth_error(format!(
                        "gcloud auth print-access-token failed: {}",
                        stderr.trim()
                    )));
                }

                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if token.is_empty() {
                    return Err(auth_error("gcloud returned an empty access token".to_string()));
                }
                Ok(token)
            }
        }
    }
}
