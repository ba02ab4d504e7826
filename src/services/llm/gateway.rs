use std::time::{Duration, Instant};

use super::backend::Backend;
use super::models::{self, ModelSpec};
use super::sink::OutputSink;
use super::stream::{DeliveryPolicy, deliver};
use super::transport::{self, HttpClient, HttpRequest};
use crate::cancel::CancellationToken;
use crate::error::{GenerationError, WizardError};
use crate::services::prompt::CompiledPrompt;
use crate::services::settings::{ModelConfig, RuntimeOptions};

const TEST_PROMPT: &str = "Hello";
const TEST_MAX_TOKENS: u32 = 10;

/// Result of one streamed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub backend: &'static str,
    pub model: String,
    /// Text delivered to the sink
    pub text: String,
    /// Unmodified provider text
    pub raw: String,
    /// The request timed out after some text had been received
    pub partial: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub request_timeout: Duration,
    pub coalesce_min_chars: usize,
    pub coalesce_max_delay: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from(&RuntimeOptions::default())
    }
}

impl From<&RuntimeOptions> for GatewayOptions {
    fn from(runtime: &RuntimeOptions) -> Self {
        Self {
            request_timeout: runtime.request_timeout(),
            coalesce_min_chars: runtime.coalesce_min_chars,
            coalesce_max_delay: runtime.coalesce_max_delay(),
        }
    }
}

/// Dispatches compiled prompts to the backend selected by the model id.
#[derive(Debug, Clone, Default)]
pub struct LlmGateway {
    options: GatewayOptions,
    http: HttpClient,
}

impl LlmGateway {
    pub fn new(options: GatewayOptions) -> Self {
        Self {
            options,
            http: HttpClient::default(),
        }
    }

    /// Resolve the model and its backend without touching the network.
    fn prepare(config: &ModelConfig) -> Result<(&'static ModelSpec, Backend, u32), WizardError> {
        let spec = models::resolve(&config.model)?;
        let backend = Backend::for_model(spec, &config.credentials)?;
        let max_tokens = config
            .max_tokens
            .map_or(spec.max_tokens, |limit| limit.clamp(1, spec.max_tokens));
        Ok((spec, backend, max_tokens))
    }

    /// Stream a generation into `sink`. Fragments are forwarded as they
    /// arrive with code fences removed.
    pub async fn generate(
        &self,
        config: &ModelConfig,
        prompt: &CompiledPrompt,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutput, WizardError> {
        let (spec, backend, max_tokens) = Self::prepare(config)?;
        let started = Instant::now();

        tracing::info!(
            "Generating with {} via {} (max_tokens={})",
            spec.id,
            backend.name(),
            max_tokens
        );

        let request = cancel
            .run_until_cancelled(backend.build_request(
                spec,
                &prompt.system_prompt,
                &prompt.user_prompt,
                max_tokens,
                true,
            ))
            .await
            .ok_or(GenerationError::Cancelled)??;

        self.stream(spec, &backend, request, sink, cancel, started)
            .await
            .map_err(Into::into)
    }

    async fn stream(
        &self,
        spec: &ModelSpec,
        backend: &Backend,
        request: HttpRequest,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<GenerationOutput, GenerationError> {
        let client = self.http.get(backend.name()).await?;
        // Aborts the request when this function returns
        let stream = transport::spawn_stream(
            client,
            request,
            backend.decoder(),
            self.options.request_timeout,
        )?;

        let policy = DeliveryPolicy {
            backend: backend.name(),
            timeout: self.options.request_timeout,
            coalesce: backend
                .coalesces()
                .then_some((self.options.coalesce_min_chars, self.options.coalesce_max_delay)),
        };

        let delivered = deliver(stream.events(), sink, &policy, cancel).await?;
        let elapsed = started.elapsed();

        tracing::info!(
            "{} finished in {:.1}s: {} fragments{}",
            backend.name(),
            elapsed.as_secs_f64(),
            delivered.fragments,
            if delivered.partial { " (partial)" } else { "" }
        );

        Ok(GenerationOutput {
            backend: backend.name(),
            model: spec.id.to_string(),
            text: delivered.text,
            raw: delivered.raw,
            partial: delivered.partial,
            elapsed,
        })
    }

    /// Minimal non-streaming round trip to validate the model settings.
    pub async fn test_connection(&self, config: &ModelConfig) -> Result<(), WizardError> {
        let (spec, backend, _) = Self::prepare(config)?;
        let request = backend
            .build_request(spec, "", TEST_PROMPT, TEST_MAX_TOKENS, false)
            .await?;

        let client = self.http.get(backend.name()).await?;
        let body = transport::send_json(client, request, self.options.request_timeout).await?;
        if backend.message_text(&body).is_none() {
            return Err(GenerationError::MalformedResponse {
                backend: backend.name(),
                detail: "response did not contain a message".to_string(),
            }
            .into());
        }

        tracing::info!("Connection test for {} succeeded", spec.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::sink::MemorySink;
    use crate::services::settings::ModelCredentials;

    fn prompt() -> CompiledPrompt {
        CompiledPrompt {
            system_prompt: "system".to_string(),
            user_prompt: "user".to_string(),
        }
    }

    #[test]
    fn test_unsupported_model_fails_before_network() {
        smol::block_on(async {
            let gateway = LlmGateway::default();
            let config = ModelConfig {
                model: "not-a-model".to_string(),
                credentials: ModelCredentials {
                    api_key: "sk-test".to_string(),
                    ..Default::default()
                },
                max_tokens: None,
            };
            let sink = MemorySink::new();

            let err = gateway
                .generate(&config, &prompt(), &sink, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                WizardError::Generation(GenerationError::UnsupportedModel(_))
            ));
            assert!(sink.fragments().await.is_empty());

            let err = gateway.test_connection(&config).await.unwrap_err();
            assert!(matches!(
                err,
                WizardError::Generation(GenerationError::UnsupportedModel(_))
            ));
        });
    }

    #[test]
    fn test_token_budget_follows_model_table() {
        let mut config = ModelConfig {
            model: "claude-3-5-sonnet-20241022".to_string(),
            credentials: ModelCredentials {
                api_key: "sk-test".to_string(),
                ..Default::default()
            },
            max_tokens: None,
        };
        let (_, _, max_tokens) = LlmGateway::prepare(&config).unwrap();
        assert_eq!(max_tokens, 8192);

        config.max_tokens = Some(100_000);
        assert_eq!(LlmGateway::prepare(&config).unwrap().2, 8192);

        config.max_tokens = Some(2048);
        assert_eq!(LlmGateway::prepare(&config).unwrap().2, 2048);
    }

    #[test]
    fn test_cancelled_before_request() {
        smol::block_on(async {
            let config = ModelConfig {
                model: "claude-3-7-sonnet-latest".to_string(),
                credentials: ModelCredentials {
                    api_key: "sk-test".to_string(),
                    ..Default::default()
                },
                max_tokens: None,
            };
            let cancel = CancellationToken::new();
            cancel.cancel();

            let err = LlmGateway::default()
                .generate(&config, &prompt(), &MemorySink::new(), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                WizardError::Generation(GenerationError::Cancelled)
            ));
        });
    }
}
