//! Categorized errors surfaced to callers of the generation pipeline.
//!
//! Components use `anyhow` internally and convert at their boundary into one
//! of the categories below, so nothing leaves the orchestrator uncategorized.

use std::time::Duration;
use thiserror::Error;

/// Top-level error returned by the orchestrator.
#[derive(Debug, Error)]
pub enum WizardError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("Operation cancelled")]
    Cancelled,
}

impl WizardError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            WizardError::Configuration(e) => e.to_string(),
            WizardError::Connectivity(e) => e.user_message(),
            WizardError::Introspection(e) => e.to_string(),
            WizardError::Generation(e) => e.user_message(),
            WizardError::Cancelled => "Generation was stopped".to_string(),
        }
    }
}

/// Missing or invalid connection/model configuration. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown database connection '{0}'")]
    UnknownConnection(String),
    #[error("SSH tunnel is disabled for connection '{0}'")]
    SshDisabled(String),
    #[error("SSH private key is required; password authentication is not supported")]
    MissingPrivateKey,
    #[error("Could not determine the home directory to expand '{0}'")]
    NoHomeDirectory(String),
    #[error("Local port {0} is already used by another tunnel")]
    PortInUse(u16),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// What went wrong while reaching the database or the bastion host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityKind {
    Timeout,
    Refused,
    HostNotFound,
    AccessDenied,
    UnknownDatabase,
    SshAuthFailed,
    KeyRead,
    Other,
}

impl ConnectivityKind {
    fn guidance(&self) -> &'static str {
        match self {
            ConnectivityKind::Timeout => {
                "The connection timed out. Check the host, port and any firewall in between."
            }
            ConnectivityKind::Refused => {
                "The connection was refused. Make sure the server is running and the port is correct."
            }
            ConnectivityKind::HostNotFound => "The host name could not be resolved.",
            ConnectivityKind::AccessDenied => {
                "Access denied. Check the database user name and password."
            }
            ConnectivityKind::UnknownDatabase => "The database (schema) name does not exist.",
            ConnectivityKind::SshAuthFailed => {
                "SSH authentication failed. Check the SSH user, private key and passphrase."
            }
            ConnectivityKind::KeyRead => {
                "The SSH private key file could not be read. Check the key path and permissions."
            }
            ConnectivityKind::Other => "Could not connect to the database.",
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {detail}")]
pub struct ConnectivityError {
    pub kind: ConnectivityKind,
    pub detail: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl ConnectivityError {
    pub fn new(kind: ConnectivityKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn user_message(&self) -> String {
        format!("{} ({})", self.kind.guidance(), self.detail)
    }
}

/// Schema fetch failed after a successful connection.
#[derive(Debug, Error)]
#[error("Failed to fetch database schema: {source}")]
pub struct IntrospectionError {
    #[source]
    pub source: anyhow::Error,
}

/// Provider-side failure while generating.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Unsupported model '{0}'")]
    UnsupportedModel(String),
    #[error("{backend}: authentication failed ({status:?}): {message}")]
    Authentication {
        backend: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("{backend}: rate limit exceeded: {message}")]
    RateLimited {
        backend: &'static str,
        retry_after: Option<u64>,
        message: String,
    },
    #[error("{backend}: API error ({status}): {message}")]
    Api {
        backend: &'static str,
        status: u16,
        message: String,
    },
    #[error("{backend}: malformed response: {detail}")]
    MalformedResponse {
        backend: &'static str,
        detail: String,
    },
    #[error("{backend}: network error: {detail}")]
    Network {
        backend: &'static str,
        detail: String,
    },
    #[error("{backend}: request timed out after {after:?}")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },
    #[error("{backend}: no content received from API")]
    EmptyResponse { backend: &'static str },
    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn user_message(&self) -> String {
        match self {
            GenerationError::Authentication { .. } => {
                format!("{} - Authentication failed. Please check your API key.", self)
            }
            GenerationError::RateLimited {
                retry_after: Some(secs),
                ..
            } => format!(
                "{} - Rate limit exceeded. Please try again in {} seconds.",
                self, secs
            ),
            GenerationError::RateLimited { .. } => {
                format!("{} - Rate limit exceeded. Please try again later.", self)
            }
            GenerationError::Timeout { .. } => {
                format!("{} - The model took too long to respond.", self)
            }
            _ => self.to_string(),
        }
    }

    /// The backend name the error originated from, when known.
    pub fn backend(&self) -> Option<&'static str> {
        match self {
            GenerationError::Authentication { backend, .. }
            | GenerationError::RateLimited { backend, .. }
            | GenerationError::Api { backend, .. }
            | GenerationError::MalformedResponse { backend, .. }
            | GenerationError::Network { backend, .. }
            | GenerationError::Timeout { backend, .. }
            | GenerationError::EmptyResponse { backend } => Some(backend),
            GenerationError::UnsupportedModel(_) | GenerationError::Cancelled => None,
        }
    }
}
