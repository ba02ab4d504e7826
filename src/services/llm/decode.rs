//! Wire decoding for provider responses: server-sent event lines, per-backend
//! event payloads, and HTTP error bodies.

use serde::Deserialize;
use serde_json::Value;

use crate::error::GenerationError;

/// One normalized event from a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Done,
}

/// Decodes one SSE `data:` payload into an event, or `None` for events that
/// carry no text.
pub(crate) type EventDecoder = fn(&str, &'static str) -> Result<Option<StreamEvent>, GenerationError>;

/// The payload of an SSE `data:` line.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).trim_end_matches('\r'))
}

fn parse_json(data: &str, backend: &'static str) -> Result<Value, GenerationError> {
    serde_json::from_str(data).map_err(|e| GenerationError::MalformedResponse {
        backend,
        detail: format!("{}: {}", e, truncate(data, 200)),
    })
}

/// Anthropic Messages streaming events, shared by the direct API and Vertex AI.
pub(crate) fn decode_anthropic_event(
    data: &str,
    backend: &'static str,
) -> Result<Option<StreamEvent>, GenerationError> {
    if data.trim() == "[DONE]" {
        return Ok(Some(StreamEvent::Done));
    }

    let event = parse_json(data, backend)?;
    match event["type"].as_str() {
        Some("content_block_delta") => Ok(event["delta"]["text"]
            .as_str()
            .filter(|text| !text.is_empty())
            .map(|text| StreamEvent::Text(text.to_string()))),
        Some("message_stop") => Ok(Some(StreamEvent::Done)),
        Some("error") => Err(error_from_body(backend, None, &event)),
        Some(_) => Ok(None),
        None => Err(GenerationError::MalformedResponse {
            backend,
            detail: format!("event without a type: {}", truncate(data, 200)),
        }),
    }
}

#[derive(Deserialize)]
struct GeminiChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

/// Gemini `streamGenerateContent?alt=sse` chunks. The stream ends when the
/// connection closes.
pub(crate) fn decode_gemini_event(
    data: &str,
    backend: &'static str,
) -> Result<Option<StreamEvent>, GenerationError> {
    let value = parse_json(data, backend)?;
    if value.get("error").is_some() {
        return Err(error_from_body(backend, None, &value));
    }

    let chunk: GeminiChunk =
        serde_json::from_value(value).map_err(|e| GenerationError::MalformedResponse {
            backend,
            detail: e.to_string(),
        })?;

    let text: String = chunk
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| content.parts.iter().filter_map(|p| p.text.as_deref()).collect())
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(StreamEvent::Text(text)))
}

/// Text of a complete, non-streamed Anthropic message.
pub(crate) fn anthropic_message_text(body: &Value) -> Option<String> {
    let text: String = body["content"]
        .as_array()?
        .iter()
        .filter_map(|block| block["text"].as_str())
        .collect();
    Some(text)
}

/// Text of a complete, non-streamed Gemini response.
pub(crate) fn gemini_message_text(body: &Value) -> Option<String> {
    let chunk: GeminiChunk = serde_json::from_value(body.clone()).ok()?;
    let content = chunk.candidates.into_iter().next()?.content?;
    Some(content.parts.into_iter().filter_map(|p| p.text).collect())
}

/// Map a non-success HTTP status and its body to a categorized error.
pub(crate) fn status_error(
    backend: &'static str,
    status: u16,
    retry_after: Option<u64>,
    body: &str,
) -> GenerationError {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            let mut err = error_from_body(backend, Some(status), &value);
            if let GenerationError::RateLimited {
                retry_after: slot, ..
            } = &mut err
            {
                *slot = slot.or(retry_after);
            }
            err
        }
        Err(_) => categorize(
            backend,
            Some(status),
            "",
            retry_after,
            if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                truncate(body, 300)
            },
        ),
    }
}

/// Both providers nest the message under `error.message`.
fn error_from_body(backend: &'static str, status: Option<u16>, body: &Value) -> GenerationError {
    let error = &body["error"];
    let kind = error["type"]
        .as_str()
        .or_else(|| error["status"].as_str())
        .unwrap_or_default();
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| truncate(&body.to_string(), 300));
    categorize(backend, status, kind, None, message)
}

fn categorize(
    backend: &'static str,
    status: Option<u16>,
    kind: &str,
    retry_after: Option<u64>,
    message: String,
) -> GenerationError {
    let kind = kind.to_ascii_lowercase();
    match status {
        Some(401 | 403) => GenerationError::Authentication {
            backend,
            status,
            message,
        },
        Some(429) => GenerationError::RateLimited {
            backend,
            retry_after,
            message,
        },
        _ if kind.contains("auth") || kind.contains("permission") => {
            GenerationError::Authentication {
                backend,
                status,
                message,
            }
        }
        _ if kind.contains("rate_limit") || kind.contains("resource_exhausted") => {
            GenerationError::RateLimited {
                backend,
                retry_after,
                message,
            }
        }
        Some(status) => GenerationError::Api {
            backend,
            status,
            message,
        },
        // Error events inside an otherwise successful stream
        None => GenerationError::Api {
            backend,
            status: 200,
            message: if kind.is_empty() {
                message
            } else {
                format!("{}: {}", kind, message)
            },
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
