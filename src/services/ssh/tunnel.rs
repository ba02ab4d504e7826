//! A live tunnel: a local listener whose connections are forwarded through
//! a secure session to the database endpoint.

use async_lock::Mutex;
use futures::AsyncWriteExt;
use smol::net::{TcpListener, TcpStream};
use smol::Task;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use super::session::SecureSession;

/// An established tunnel owned by the tunnel manager.
pub struct ActiveTunnel {
    connection_id: String,
    local_port: u16,
    session: Arc<dyn SecureSession>,
    accept_task: Mutex<Option<Task<()>>>,
}

impl ActiveTunnel {
    /// Start accepting on `listener`, forwarding each connection to
    /// `remote_host:remote_port` through `session`.
    pub fn start(
        connection_id: String,
        listener: TcpListener,
        local_port: u16,
        session: Arc<dyn SecureSession>,
        remote_host: String,
        remote_port: u16,
    ) -> Self {
        let accept_task = smol::spawn(accept_loop(
            connection_id.clone(),
            listener,
            session.clone(),
            remote_host,
            remote_port,
        ));

        Self {
            connection_id,
            local_port,
            session,
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Local address to hand to the database driver.
    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    /// Stop the listener, then the session. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            // Cancelling the task drops the listener and releases the port
            task.cancel().await;
            self.session.close().await;
            tracing::info!(
                "SSH tunnel for {} on port {} closed",
                self.connection_id,
                self.local_port
            );
        }
    }
}

async fn accept_loop(
    connection_id: String,
    listener: TcpListener,
    session: Arc<dyn SecureSession>,
    remote_host: String,
    remote_port: u16,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("Tunnel {}: new connection from {}", connection_id, peer);
                let session = session.clone();
                let host = remote_host.clone();
                let id = connection_id.clone();
                smol::spawn(async move {
                    if let Err(e) = forward_connection(stream, session, &host, remote_port).await
                    {
                        tracing::warn!("Tunnel {}: forwarding failed: {:#}", id, e);
                    }
                })
                .detach();
            }
            Err(e) => {
                tracing::warn!("Tunnel {}: accept failed: {}", connection_id, e);
                smol::Timer::after(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Pump bytes both ways until either side finishes. Errors only close this
/// one local connection.
async fn forward_connection(
    local: TcpStream,
    session: Arc<dyn SecureSession>,
    remote_host: &str,
    remote_port: u16,
) -> anyhow::Result<()> {
    let channel = match session.open_channel(remote_host, remote_port).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = local.shutdown(Shutdown::Both);
            return Err(e);
        }
    };
    let (remote_reader, mut remote_writer, _guard) = channel.into_parts();

    tracing::debug!("Forwarding connection to {}:{}", remote_host, remote_port);

    let local_reader = local.clone();
    let mut local_writer = local.clone();

    let upstream = async {
        let copied = futures::io::copy(local_reader, &mut remote_writer).await;
        let _ = remote_writer.close().await;
        copied
    };
    let downstream = async { futures::io::copy(remote_reader, &mut local_writer).await };

    let result = smol::future::race(upstream, downstream).await;
    let _ = local.shutdown(Shutdown::Both);
    result?;
    Ok(())
}
