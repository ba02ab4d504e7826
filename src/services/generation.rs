//! Generation orchestrator: connection id in, streamed SQL out.
//!
//! Each call walks `Idle -> Connecting -> SchemaReady -> Prompting ->
//! Streaming -> Done | Failed` and broadcasts every transition. Connections
//! and tunnels opened here stay open until `disconnect` or `shutdown`.

use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::{ConfigurationError, GenerationError, WizardError};
use crate::services::database::{DatabaseManager, DatabaseSchema, Endpoint};
use crate::services::llm::{GatewayOptions, LlmGateway, OutputSink};
use crate::services::prompt;
use crate::services::settings::{DatabaseConnectionConfig, ModelConfig, SettingsStore};
use crate::services::ssh::TunnelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationPhase {
    Idle,
    Connecting,
    SchemaReady,
    Prompting,
    Streaming,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationEvent {
    pub request_id: Uuid,
    pub connection_id: String,
    pub phase: GenerationPhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub connection_id: String,
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(connection_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            prompt: prompt.into(),
        }
    }
}

/// Terminal summary. The streamed text in the sink is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub request_id: Uuid,
    pub sql: String,
    pub explanation: String,
    pub model: String,
    pub partial: bool,
    pub elapsed: Duration,
}

pub struct Orchestrator {
    settings: Arc<dyn SettingsStore>,
    tunnels: TunnelManager,
    databases: DatabaseManager,
    gateway: LlmGateway,
    events_tx: Sender<GenerationEvent>,
    events_rx: Receiver<GenerationEvent>,
}

impl Orchestrator {
    /// Build with the system ssh connector and timeouts from the settings.
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        let runtime = settings.runtime();
        let tunnels = TunnelManager::new()
            .with_base_port(runtime.tunnel_base_port)
            .with_connect_timeout(runtime.tunnel_connect_timeout());
        Self::with_tunnel_manager(settings, tunnels)
    }

    pub fn with_tunnel_manager(settings: Arc<dyn SettingsStore>, tunnels: TunnelManager) -> Self {
        let runtime = settings.runtime();
        let (events_tx, events_rx) = async_channel::bounded(256);
        Self {
            databases: DatabaseManager::new().with_connect_timeout(runtime.db_connect_timeout()),
            gateway: LlmGateway::new(GatewayOptions::from(&runtime)),
            settings,
            tunnels,
            events_tx,
            events_rx,
        }
    }

    /// Phase transitions of every generation
    pub fn subscribe(&self) -> Receiver<GenerationEvent> {
        self.events_rx.clone()
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn databases(&self) -> &DatabaseManager {
        &self.databases
    }

    fn emit(&self, request_id: Uuid, connection_id: &str, phase: GenerationPhase) {
        tracing::debug!("Generation {} for {}: {:?}", request_id, connection_id, phase);
        let _ = self.events_tx.try_send(GenerationEvent {
            request_id,
            connection_id: connection_id.to_string(),
            phase,
            at: Utc::now(),
        });
    }

    fn connection_config(&self, connection_id: &str) -> Result<DatabaseConnectionConfig, ConfigurationError> {
        self.settings
            .connection(connection_id)
            .ok_or_else(|| ConfigurationError::UnknownConnection(connection_id.to_string()))
    }

    /// Where the driver should connect: the config's own host and port, or
    /// the local end of its (possibly shared) tunnel.
    pub async fn resolve_endpoint(
        &self,
        config: &DatabaseConnectionConfig,
    ) -> Result<Endpoint, WizardError> {
        if !config.uses_ssh_tunnel() {
            return Ok(Endpoint::direct(config));
        }
        let port = self.tunnels.open_tunnel(config).await?;
        Ok(Endpoint::local(port))
    }

    /// Open (or reuse) the database connection for `connection_id`.
    pub async fn connect(&self, connection_id: &str) -> Result<Endpoint, WizardError> {
        let config = self.connection_config(connection_id)?;
        let endpoint = self.resolve_endpoint(&config).await?;
        self.databases.connect(&config, &endpoint).await?;
        Ok(endpoint)
    }

    /// Connect if needed and return the (cached) schema.
    pub async fn schema(&self, connection_id: &str) -> Result<Arc<DatabaseSchema>, WizardError> {
        self.connect(connection_id).await?;
        Ok(self.databases.fetch_schema(connection_id).await?)
    }

    /// Close the connection, drop its cached schema, and release its tunnel.
    pub async fn disconnect(&self, connection_id: &str) {
        self.databases.disconnect(connection_id).await;
        self.tunnels.close_tunnel(connection_id).await;
    }

    /// Generate SQL for `request`, streaming it into `sink`.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, WizardError> {
        let request_id = Uuid::new_v4();
        let id = request.connection_id.as_str();
        self.emit(request_id, id, GenerationPhase::Idle);

        let result = self.run(request_id, request, sink, cancel).await;
        match &result {
            Ok(done) => {
                self.emit(request_id, id, GenerationPhase::Done);
                tracing::info!(
                    "Generation {} finished in {:.2}s",
                    request_id,
                    done.elapsed.as_secs_f64()
                );
            }
            Err(e) => {
                self.emit(request_id, id, GenerationPhase::Failed);
                tracing::error!("Generation {} failed: {}", request_id, e);
            }
        }
        result
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: &GenerationRequest,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, WizardError> {
        let id = request.connection_id.as_str();

        self.emit(request_id, id, GenerationPhase::Connecting);
        cancel
            .run_until_cancelled(self.connect(id))
            .await
            .ok_or(WizardError::Cancelled)??;

        let schema = cancel
            .run_until_cancelled(self.databases.fetch_schema(id))
            .await
            .ok_or(WizardError::Cancelled)??;
        self.emit(request_id, id, GenerationPhase::SchemaReady);

        self.respond(request_id, request, &schema, sink, cancel).await
    }

    /// Prompting and Streaming for an already fetched schema.
    async fn respond(
        &self,
        request_id: Uuid,
        request: &GenerationRequest,
        schema: &DatabaseSchema,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, WizardError> {
        let id = request.connection_id.as_str();

        self.emit(request_id, id, GenerationPhase::Prompting);
        let compiled = prompt::compile(schema, &request.prompt, &self.settings.locale());

        self.emit(request_id, id, GenerationPhase::Streaming);
        if let Err(e) = sink.open().await {
            tracing::warn!("Failed to open output: {:#}", e);
        }

        let output = self
            .gateway
            .generate(&self.settings.model_config(), &compiled, sink, cancel)
            .await
            .map_err(|e| match e {
                WizardError::Generation(GenerationError::Cancelled) => WizardError::Cancelled,
                other => other,
            })?;

        let mut explanation = format!(
            "Query has been generated and displayed in the editor.\n\n[AI Response Time: {:.2} seconds]",
            output.elapsed.as_secs_f64()
        );
        if output.partial {
            explanation.push_str("\n[Response was cut off by the request timeout]");
        }

        Ok(GenerationResult {
            request_id,
            sql: output.text,
            explanation,
            model: output.model,
            partial: output.partial,
            elapsed: output.elapsed,
        })
    }

    /// Validate model settings with a minimal request. Uses the stored
    /// configuration when `config` is `None`.
    pub async fn test_model_connection(&self, config: Option<&ModelConfig>) -> Result<(), WizardError> {
        match config {
            Some(config) => self.gateway.test_connection(config).await,
            None => self.gateway.test_connection(&self.settings.model_config()).await,
        }
    }

    /// Authenticate against the bastion without opening a tunnel.
    pub async fn test_ssh_connection(&self, config: &DatabaseConnectionConfig) -> Result<(), WizardError> {
        self.tunnels.test_connection(config).await
    }

    /// Connect, run `SELECT 1`, and release everything that was opened for
    /// the test. An existing tunnel for the same id is reused and kept.
    pub async fn test_database_connection(
        &self,
        config: &DatabaseConnectionConfig,
    ) -> Result<(), WizardError> {
        if !config.uses_ssh_tunnel() {
            self.databases
                .test_connection(config, &Endpoint::direct(config))
                .await?;
            return Ok(());
        }

        if let Some(port) = self.tunnels.local_port(&config.id).await {
            self.databases
                .test_connection(config, &Endpoint::local(port))
                .await?;
            return Ok(());
        }

        let mut probe = config.clone();
        probe.id = format!("{}#test-{}", config.id, Uuid::new_v4());
        let port = self.tunnels.open_tunnel(&probe).await?;
        let result = self
            .databases
            .test_connection(&probe, &Endpoint::local(port))
            .await;
        self.tunnels.close_tunnel(&probe.id).await;
        result.map_err(Into::into)
    }

    /// Close every pool, then every tunnel. Never fails.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.databases.close_all().await;
        self.tunnels.close_all().await;
    }
}
