//! Secure sessions backed by the system `ssh` binary.
//!
//! The session is an `ssh -M -N` control master. Every forwarded connection
//! is an `ssh -S <socket> -W host:port` client multiplexed over it, so a
//! failing channel only takes down its own child process. Using the system
//! binary keeps the user's `~/.ssh/config`, known_hosts and ProxyJump setup.

use async_lock::Mutex;
use async_trait::async_trait;
use futures::StreamExt;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::session::{ForwardedChannel, SecureSession, SessionConnector, SessionTarget};
use super::types::{DEFAULT_SSH_PORT, SshTunnelConfig};
use crate::error::{ConnectivityError, ConnectivityKind};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Connects by spawning the system `ssh` binary.
#[derive(Debug, Clone, Default)]
pub struct SystemSshConnector;

impl SystemSshConnector {
    pub fn new() -> Self {
        Self
    }

    fn base_command(
        target: &SessionTarget,
        temp_dir: &tempfile::TempDir,
    ) -> Result<Command, ConnectivityError> {
        let ssh = &target.ssh;
        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());

        cmd.args(["-o", "StrictHostKeyChecking=accept-new"]);
        cmd.args(["-o", "IdentitiesOnly=yes"]);
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            target.connect_timeout.as_secs().max(1)
        ));
        cmd.arg("-i").arg(&target.key_path);

        if ssh.port != DEFAULT_SSH_PORT {
            cmd.arg("-p").arg(ssh.port.to_string());
        }

        match &ssh.passphrase {
            Some(passphrase) if !passphrase.is_empty() => {
                #[cfg(unix)]
                setup_askpass(&mut cmd, temp_dir, passphrase)?;
                #[cfg(not(unix))]
                {
                    let _ = (temp_dir, passphrase);
                    tracing::warn!(
                        "Key passphrases are only supported on Unix; relying on ssh-agent"
                    );
                }
                cmd.args(["-o", "BatchMode=no"]);
            }
            _ => {
                let _ = temp_dir;
                cmd.args(["-o", "BatchMode=yes"]);
            }
        }

        Ok(cmd)
    }
}

#[async_trait]
impl SessionConnector for SystemSshConnector {
    async fn connect(
        &self,
        target: &SessionTarget,
    ) -> Result<Arc<dyn SecureSession>, ConnectivityError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("sqlwizard-ssh-")
            .tempdir()
            .map_err(|e| other_error("Failed to create temp directory", e.into()))?;
        let socket_path = temp_dir.path().join("ctl.sock");

        let mut cmd = Self::base_command(target, &temp_dir)?;
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.arg("-N");
        cmd.args(["-o", "ExitOnForwardFailure=yes"]);
        cmd.args(["-o", "ServerAliveInterval=15"]);
        cmd.args(["-o", "ServerAliveCountMax=3"]);

        #[cfg(unix)]
        {
            cmd.arg("-M").arg("-S").arg(&socket_path);
            cmd.args(["-o", "ControlPersist=no"]);
        }

        cmd.arg(target.ssh.ssh_url());

        tracing::info!(
            "Starting SSH session: {} (connection {})",
            target.ssh.ssh_url(),
            target.connection_id
        );

        let mut process = cmd
            .spawn()
            .map_err(|e| other_error("Failed to spawn ssh process", e.into()))?;

        let stderr_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        if let Some(stderr) = process.stderr.take() {
            let sink = stderr_lines.clone();
            let url = target.ssh.ssh_url();
            smol::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!("ssh {}: {}", url, line);
                    sink.lock().await.push(line);
                }
            })
            .detach();
        }

        let deadline = Instant::now() + target.connect_timeout + Duration::from_secs(2);
        loop {
            if let Ok(Some(status)) = process.try_status() {
                // Let the stderr reader drain before classifying
                smol::Timer::after(Duration::from_millis(50)).await;
                let stderr = stderr_lines.lock().await.join("\n");
                let kind = classify_ssh_stderr(&stderr);
                return Err(ConnectivityError::new(
                    kind,
                    format!(
                        "ssh to {}:{} exited with {}: {}",
                        target.ssh.host,
                        target.ssh.port,
                        status,
                        stderr.trim()
                    ),
                ));
            }

            if session_ready(&target.ssh, &socket_path).await {
                break;
            }

            if Instant::now() >= deadline {
                let _ = process.kill();
                return Err(ConnectivityError::new(
                    ConnectivityKind::Timeout,
                    format!(
                        "SSH session to {}:{} not ready after {:?}",
                        target.ssh.host, target.ssh.port, target.connect_timeout
                    ),
                ));
            }

            smol::Timer::after(Duration::from_millis(200)).await;
        }

        tracing::info!("SSH session established: {}", target.ssh.ssh_url());

        Ok(Arc::new(SystemSshSession {
            ssh: target.ssh.clone(),
            key_path: target.key_path.clone(),
            socket_path,
            process: Mutex::new(Some(process)),
            _temp_dir: temp_dir,
        }))
    }

    /// Authenticate with `ssh ... exit 0` instead of holding a master open.
    async fn probe(&self, target: &SessionTarget) -> Result<(), ConnectivityError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("sqlwizard-ssh-test-")
            .tempdir()
            .map_err(|e| other_error("Failed to create temp directory", e.into()))?;

        let mut cmd = Self::base_command(target, &temp_dir)?;
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.arg(target.ssh.ssh_url()).arg("exit").arg("0");

        tracing::debug!("Testing SSH connection: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|e| other_error("Failed to execute ssh test command", e.into()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConnectivityError::new(
                classify_ssh_stderr(&stderr),
                format!(
                    "SSH connection test failed (exit {}): {}",
                    output.status,
                    stderr.trim()
                ),
            ))
        }
    }
}

/// A running control master.
struct SystemSshSession {
    ssh: SshTunnelConfig,
    #[cfg_attr(unix, allow(dead_code))]
    key_path: std::path::PathBuf,
    #[cfg_attr(not(unix), allow(dead_code))]
    socket_path: std::path::PathBuf,
    process: Mutex<Option<Child>>,
    _temp_dir: tempfile::TempDir,
}

#[async_trait]
impl SecureSession for SystemSshSession {
    async fn open_channel(&self, host: &str, port: u16) -> anyhow::Result<ForwardedChannel> {
        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        #[cfg(unix)]
        cmd.arg("-S").arg(&self.socket_path);

        #[cfg(not(unix))]
        {
            cmd.args(["-o", "BatchMode=yes"]);
            cmd.arg("-i").arg(&self.key_path);
            if self.ssh.port != DEFAULT_SSH_PORT {
                cmd.arg("-p").arg(self.ssh.port.to_string());
            }
        }

        cmd.arg("-W").arg(format!("{}:{}", host, port));
        cmd.arg(self.ssh.ssh_url());

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("ssh channel has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ssh channel has no stdout"))?;

        Ok(ForwardedChannel::new(stdout, stdin).with_guard(child))
    }

    async fn close(&self) {
        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };

        tracing::debug!("Shutting down SSH session to {}", self.ssh.ssh_url());

        #[cfg(unix)]
        {
            let _ = Command::new("ssh")
                .arg("-S")
                .arg(&self.socket_path)
                .args(["-O", "exit"])
                .arg(self.ssh.ssh_url())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            // SIGTERM in case the control command did not reach the master
            unsafe {
                libc::kill(process.id() as i32, libc::SIGTERM);
            }
            smol::Timer::after(Duration::from_millis(100)).await;
        }

        if matches!(process.try_status(), Ok(None)) {
            let _ = process.kill();
        }
        let _ = process.status().await;

        tracing::info!("SSH session to {} shut down", self.ssh.ssh_url());
    }
}

/// Whether the control master accepts requests yet.
#[cfg(unix)]
async fn session_ready(ssh: &SshTunnelConfig, socket_path: &std::path::Path) -> bool {
    if !socket_path.exists() {
        return false;
    }
    Command::new("ssh")
        .arg("-S")
        .arg(socket_path)
        .args(["-O", "check"])
        .arg(ssh.ssh_url())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Without a control socket the best signal is that ssh stays up.
#[cfg(not(unix))]
async fn session_ready(_ssh: &SshTunnelConfig, _socket_path: &std::path::Path) -> bool {
    smol::Timer::after(Duration::from_millis(800)).await;
    true
}

/// Write a private askpass script that prints the key passphrase.
#[cfg(unix)]
fn setup_askpass(
    cmd: &mut Command,
    temp_dir: &tempfile::TempDir,
    secret: &str,
) -> Result<(), ConnectivityError> {
    let askpass_path = temp_dir.path().join("askpass.sh");
    let script = format!("#!/bin/sh\necho '{}'\n", secret.replace('\'', "'\"'\"'"));

    std::fs::write(&askpass_path, script)
        .and_then(|_| {
            let mut perms = std::fs::metadata(&askpass_path)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(&askpass_path, perms)
        })
        .map_err(|e| other_error("Failed to write askpass script", e.into()))?;

    cmd.env("SSH_ASKPASS", &askpass_path);
    cmd.env("SSH_ASKPASS_REQUIRE", "force");
    cmd.env("DISPLAY", ":0");
    Ok(())
}

fn other_error(context: &str, source: anyhow::Error) -> ConnectivityError {
    ConnectivityError::new(ConnectivityKind::Other, format!("{}: {}", context, source))
        .with_source(source)
}

/// Map ssh's stderr to a connectivity category.
pub fn classify_ssh_stderr(stderr: &str) -> ConnectivityKind {
    let text = stderr.to_lowercase();

    const AUTH: &[&str] = &[
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no supported authentication",
        "host key verification failed",
        "incorrect passphrase",
    ];
    const KEY: &[&str] = &["load key", "invalid format", "bad permissions"];
    const HOST: &[&str] = &[
        "could not resolve hostname",
        "name or service not known",
        "nodename nor servname",
    ];

    if KEY.iter().any(|p| text.contains(p)) {
        ConnectivityKind::KeyRead
    } else if AUTH.iter().any(|p| text.contains(p)) {
        ConnectivityKind::SshAuthFailed
    } else if HOST.iter().any(|p| text.contains(p)) {
        ConnectivityKind::HostNotFound
    } else if text.contains("connection refused") {
        ConnectivityKind::Refused
    } else if text.contains("timed out") {
        ConnectivityKind::Timeout
    } else {
        ConnectivityKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ssh_stderr() {
        assert_eq!(
            classify_ssh_stderr("deploy@bastion: Permission denied (publickey)."),
            ConnectivityKind::SshAuthFailed
        );
        assert_eq!(
            classify_ssh_stderr("ssh: Could not resolve hostname nowhere: Name or service not known"),
            ConnectivityKind::HostNotFound
        );
        assert_eq!(
            classify_ssh_stderr("ssh: connect to host 10.0.0.1 port 22: Connection refused"),
            ConnectivityKind::Refused
        );
        assert_eq!(
            classify_ssh_stderr("ssh: connect to host 10.0.0.1 port 22: Operation timed out"),
            ConnectivityKind::Timeout
        );
        assert_eq!(
            classify_ssh_stderr("Load key \"/k\": invalid format"),
            ConnectivityKind::KeyRead
        );
        assert_eq!(classify_ssh_stderr("something odd"), ConnectivityKind::Other);
    }
}
