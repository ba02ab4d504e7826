use anyhow::Context;
use async_lock::RwLock;
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPoolOptions};
use sqlx::MySqlPool;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use super::cache::SchemaCache;
use super::types::DatabaseSchema;
use crate::error::{ConnectivityError, ConnectivityKind, IntrospectionError};
use crate::services::settings::DatabaseConnectionConfig;

const ER_DBACCESS_DENIED: u16 = 1044;
const ER_ACCESS_DENIED: u16 = 1045;
const ER_BAD_DB: u16 = 1049;

/// Where the driver should connect: the configured host or a tunnel's local end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn local(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// The config's own host and port.
    pub fn direct(config: &DatabaseConnectionConfig) -> Self {
        Self::new(config.host.clone(), config.port)
    }
}

/// Open MySQL pools keyed by connection id, plus their cached schemas.
pub struct DatabaseManager {
    pools: RwLock<HashMap<String, MySqlPool>>,
    schemas: SchemaCache,
    connect_timeout: Duration,
}

impl DatabaseManager {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            schemas: SchemaCache::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn connect_options(config: &DatabaseConnectionConfig, endpoint: &Endpoint) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&config.user)
            .database(&config.database);
        if !config.password.is_empty() {
            options = options.password(&config.password);
        }
        options
    }

    async fn open_pool(
        &self,
        config: &DatabaseConnectionConfig,
        endpoint: &Endpoint,
        max_connections: u32,
    ) -> Result<MySqlPool, ConnectivityError> {
        MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(Self::connect_options(config, endpoint))
            .await
            .map_err(|e| {
                let mut err = connectivity_error(e);
                err.detail = format!("{}:{}: {}", endpoint.host, endpoint.port, err.detail);
                err
            })
    }

    /// Open a pool for `config` at `endpoint`. An existing pool for the same
    /// id is reused.
    pub async fn connect(
        &self,
        config: &DatabaseConnectionConfig,
        endpoint: &Endpoint,
    ) -> Result<(), ConnectivityError> {
        if self.is_connected(&config.id).await {
            return Ok(());
        }

        let pool = self.open_pool(config, endpoint, 5).await?;
        tracing::info!(
            "Connected to database {} at {}:{}",
            config.id,
            endpoint.host,
            endpoint.port
        );

        let mut pools = self.pools.write().await;
        if let Some(previous) = pools.insert(config.id.clone(), pool) {
            // Lost a race with another connect for the same id
            previous.close().await;
        }
        Ok(())
    }

    /// Close the pool and drop the cached schema. No-op when not connected.
    pub async fn disconnect(&self, connection_id: &str) {
        let pool = self.pools.write().await.remove(connection_id);
        self.schemas.evict(connection_id).await;
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!("Disconnected from database {}", connection_id);
        }
    }

    pub async fn close_all(&self) {
        let pools: Vec<(String, MySqlPool)> = self.pools.write().await.drain().collect();
        self.schemas.clear().await;
        futures::future::join_all(pools.iter().map(|(_, pool)| pool.close())).await;
    }

    pub async fn is_connected(&self, connection_id: &str) -> bool {
        self.pools.read().await.contains_key(connection_id)
    }

    async fn pool(&self, connection_id: &str) -> Option<MySqlPool> {
        self.pools.read().await.get(connection_id).cloned()
    }

    /// Cached schema for a connected database, introspecting on first use.
    pub async fn fetch_schema(
        &self,
        connection_id: &str,
    ) -> Result<Arc<DatabaseSchema>, IntrospectionError> {
        self.schemas
            .get_or_fetch(connection_id, move || async move {
                let pool = self
                    .pool(connection_id)
                    .await
                    .with_context(|| format!("No connection found for database {}", connection_id))?;
                let schema = self.introspect(&pool).await?;
                tracing::info!(
                    "Loaded schema for {}: {} tables, {} relationships",
                    connection_id,
                    schema.tables.len(),
                    schema.relationships.len()
                );
                Ok::<_, anyhow::Error>(schema)
            })
            .await
            .map_err(|source| IntrospectionError { source })
    }

    /// Connect once, run `SELECT 1`, and close again.
    pub async fn test_connection(
        &self,
        config: &DatabaseConnectionConfig,
        endpoint: &Endpoint,
    ) -> Result<(), ConnectivityError> {
        let pool = self.open_pool(config, endpoint, 1).await?;
        let result = sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(connectivity_error);
        pool.close().await;
        result.map(|_| ())
    }
}

impl Default for DatabaseManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a driver error into a user-facing connectivity category.
pub fn connectivity_kind(err: &sqlx::Error) -> ConnectivityKind {
    match err {
        sqlx::Error::PoolTimedOut => ConnectivityKind::Timeout,
        sqlx::Error::Database(db) => match db.try_downcast_ref::<MySqlDatabaseError>() {
            Some(e) if matches!(e.number(), ER_ACCESS_DENIED | ER_DBACCESS_DENIED) => {
                ConnectivityKind::AccessDenied
            }
            Some(e) if e.number() == ER_BAD_DB => ConnectivityKind::UnknownDatabase,
            _ => ConnectivityKind::Other,
        },
        sqlx::Error::Io(io) => match io.kind() {
            ErrorKind::TimedOut => ConnectivityKind::Timeout,
            ErrorKind::ConnectionRefused => ConnectivityKind::Refused,
            _ => classify_message(&io.to_string()),
        },
        other => classify_message(&other.to_string()),
    }
}

fn classify_message(message: &str) -> ConnectivityKind {
    let lower = message.to_lowercase();
    if lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("no such host")
    {
        ConnectivityKind::HostNotFound
    } else if lower.contains("timed out") {
        ConnectivityKind::Timeout
    } else if lower.contains("connection refused") {
        ConnectivityKind::Refused
    } else if lower.contains("access denied") {
        ConnectivityKind::AccessDenied
    } else if lower.contains("unknown database") {
        ConnectivityKind::UnknownDatabase
    } else {
        ConnectivityKind::Other
    }
}

fn connectivity_error(err: sqlx::Error) -> ConnectivityError {
    let kind = connectivity_kind(&err);
    ConnectivityError::new(kind, err.to_string()).with_source(err.into())
}
