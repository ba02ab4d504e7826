//! The secure-session seam used by the tunnel manager.
//!
//! A [`SessionConnector`] authenticates against the bastion and yields a
//! [`SecureSession`]; the session opens one [`ForwardedChannel`] per local
//! connection accepted by the tunnel listener.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::types::SshTunnelConfig;
use crate::error::ConnectivityError;

/// Everything a connector needs to reach the bastion.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub connection_id: String,
    pub ssh: SshTunnelConfig,
    /// Resolved, already-validated private key path
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
}

/// A byte stream to the remote endpoint, carried over the secure session.
pub struct ForwardedChannel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Keeps whatever backs the channel (a child process, a socket) alive
    _guard: Option<Box<dyn Send>>,
}

impl ForwardedChannel {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            _guard: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    /// Split into reader, writer and the guard that must outlive them.
    #[allow(clippy::type_complexity)]
    pub(super) fn into_parts(
        self,
    ) -> (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
        Option<Box<dyn Send>>,
    ) {
        (self.reader, self.writer, self._guard)
    }
}

#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Open a channel to `host:port` as seen from the bastion.
    async fn open_channel(&self, host: &str, port: u16) -> anyhow::Result<ForwardedChannel>;

    /// Tear the session down. Must not fail; problems are logged.
    async fn close(&self);
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        target: &SessionTarget,
    ) -> Result<Arc<dyn SecureSession>, ConnectivityError>;

    /// Authenticate once without keeping the session.
    async fn probe(&self, target: &SessionTarget) -> Result<(), ConnectivityError> {
        let session = self.connect(target).await?;
        session.close().await;
        Ok(())
    }
}
