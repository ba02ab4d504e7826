//! Schema-aware MySQL query generation.
//!
//! [`Orchestrator`] ties the pieces together: it opens an SSH tunnel when the
//! connection asks for one, introspects the schema, compiles a prompt and
//! streams the model's SQL into an [`OutputSink`].

pub mod cancel;
pub mod error;
pub mod services;

pub use cancel::CancellationToken;
pub use error::{
    ConfigurationError, ConnectivityError, ConnectivityKind, GenerationError, IntrospectionError,
    WizardError,
};
pub use services::{GenerationRequest, GenerationResult, Orchestrator, OutputSink};
pub use services::ssh;
