//! SSH Tunnel Test Binary
//!
//! Exercises `TunnelManager` against a real bastion and MySQL server.
//!
//! Configure with environment variables:
//!   SSH_HOST, SSH_PORT, SSH_USER, SSH_KEY
//!   MYSQL_HOST, MYSQL_PORT, MYSQL_USER, MYSQL_PASSWORD, MYSQL_DATABASE
//!
//! Run with:
//!   cargo run --bin test_ssh_tunnel

use anyhow::{Context, Result, ensure};
use sqlwizard::services::database::{DatabaseManager, Endpoint};
use sqlwizard::services::settings::DatabaseConnectionConfig;
use sqlwizard::ssh::{SshTunnelConfig, TunnelManager, TunnelState};
use std::time::Duration;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_port(name: &str, default: u16) -> Result<u16> {
    match std::env::var(name) {
        Ok(v) => v.parse().with_context(|| format!("{} is not a port: {}", name, v)),
        Err(_) => Ok(default),
    }
}

fn connection(id: &str) -> Result<DatabaseConnectionConfig> {
    let ssh = SshTunnelConfig::with_private_key(
        env_or("SSH_HOST", "127.0.0.1"),
        env_port("SSH_PORT", 2222)?,
        env_or("SSH_USER", "testuser"),
        env_or("SSH_KEY", "~/.ssh/id_ed25519"),
    );
    Ok(DatabaseConnectionConfig::new(
        id,
        env_or("MYSQL_HOST", "mysql"),
        env_port("MYSQL_PORT", 3306)?,
        env_or("MYSQL_USER", "root"),
        env_or("MYSQL_DATABASE", "testdb"),
    )
    .with_password(env_or("MYSQL_PASSWORD", "root"))
    .with_ssh(ssh))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_ssh_tunnel=debug".parse()?)
                .add_directive("sqlwizard=debug".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    println!("━━━ SSH Tunnel Test Suite (System SSH) ━━━\n");

    smol::block_on(async {
        println!("━━━ Test 1: SSH Authentication ━━━");
        test_ssh_connection().await?;

        println!("\n━━━ Test 2: Tunnel + Introspection ━━━");
        test_tunnel_with_introspection().await?;

        println!("\n━━━ Test 3: Concurrent Opens Share One Tunnel ━━━");
        test_shared_tunnel().await?;

        println!("\n━━━ Test 4: State Events ━━━");
        test_state_events().await?;

        println!("\nAll tests passed");
        Ok(())
    })
}

async fn test_ssh_connection() -> Result<()> {
    let config = connection("auth")?;
    TunnelManager::new().test_connection(&config).await?;
    println!("  ✓ Authenticated against the bastion");
    Ok(())
}

async fn test_tunnel_with_introspection() -> Result<()> {
    let tunnels = TunnelManager::new();
    let databases = DatabaseManager::new();
    let config = connection("introspect")?;

    let port = tunnels.open_tunnel(&config).await?;
    println!("  → Tunnel listening on 127.0.0.1:{}", port);

    databases.connect(&config, &Endpoint::local(port)).await?;
    println!("  ✓ sqlx connected through tunnel");

    let schema = databases.fetch_schema(&config.id).await?;
    println!(
        "  ✓ {} tables, {} relationships",
        schema.tables.len(),
        schema.relationships.len()
    );

    databases.disconnect(&config.id).await;
    tunnels.close_tunnel(&config.id).await;

    smol::Timer::after(Duration::from_millis(200)).await;
    let probe = smol::net::TcpStream::connect(("127.0.0.1", port)).await;
    ensure!(probe.is_err(), "local port {} still accepting after close", port);
    println!("  ✓ Tunnel closed (port {} released)", port);
    Ok(())
}

async fn test_shared_tunnel() -> Result<()> {
    let tunnels = TunnelManager::new();
    let config = connection("shared")?;

    let (a, b) = futures::join!(tunnels.open_tunnel(&config), tunnels.open_tunnel(&config));
    let (a, b) = (a?, b?);
    ensure!(a == b, "concurrent opens returned {} and {}", a, b);
    println!("  ✓ Both callers got port {}", a);

    tunnels.close_all().await;
    ensure!(!tunnels.status(&config.id).await.connected);
    println!("  ✓ close_all released everything");
    Ok(())
}

async fn test_state_events() -> Result<()> {
    let tunnels = TunnelManager::new();
    let events = tunnels.subscribe();
    let config = connection("events")?;

    tunnels.open_tunnel(&config).await?;
    tunnels.close_tunnel(&config.id).await;

    let mut states = Vec::new();
    while let Ok((_, state)) = events.try_recv() {
        states.push(state);
    }
    ensure!(
        matches!(
            states.as_slice(),
            [TunnelState::Connecting, TunnelState::Connected { .. }, TunnelState::Closed]
        ),
        "unexpected states: {:?}",
        states
    );
    println!("  ✓ Connecting -> Connected -> Closed");
    Ok(())
}
