//! Connection registry.
//!
//! Maps logical connection names ("primary", "secondary", ...) to
//! configuration and hands out live connection handles. The registry is
//! the single source of truth for which connections exist; pools are
//! created lazily per name and shared across all handles for that name.

use crate::config::{ConnectionConfig, ConnectionInfo, DatabaseSettings};
use crate::db::connection::{DbConnection, DbPool};
use crate::db::coordinator::TransactionCoordinator;
use crate::db::schema::{self, TableInfo};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry of named database connections.
///
/// Owns its settings outright: changing the default connection mutates this
/// registry only, never process-wide state. The default switch provides no
/// isolation against concurrent readers and is meant for startup-time
/// configuration, not for runtime use under load.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<HashMap<String, ConnectionConfig>>,
    default: Arc<RwLock<String>>,
    pools: Arc<RwLock<HashMap<String, DbPool>>>,
}

impl ConnectionRegistry {
    /// Create a registry from validated settings.
    pub fn new(settings: DatabaseSettings) -> DbResult<Self> {
        settings.validate()?;
        Ok(Self {
            connections: Arc::new(settings.connections),
            default: Arc::new(RwLock::new(settings.default)),
            pools: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve an optional name to a configured connection name.
    ///
    /// Fails with a configuration error before any pool or connection work
    /// happens, so a typo never triggers an acquisition attempt.
    async fn resolve(&self, name: Option<&str>) -> DbResult<String> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.default.read().await.clone(),
        };
        if self.connections.contains_key(&name) {
            Ok(name)
        } else {
            Err(DbError::configuration(format!(
                "connection '{name}' is not configured"
            )))
        }
    }

    /// Get or lazily create the pool for a resolved connection name.
    async fn pool(&self, name: &str) -> DbResult<DbPool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(name) {
                return Ok(pool.clone());
            }
        }

        let config = self.connections.get(name).ok_or_else(|| {
            DbError::configuration(format!("connection '{name}' is not configured"))
        })?;

        let mut pools = self.pools.write().await;
        // Re-check under the write lock: another task may have won the race.
        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }
        let pool = DbPool::from_config(config)?;
        debug!(connection = %name, driver = %pool.driver(), "created connection pool");
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// Acquire a connection handle by logical name (default when `None`).
    pub async fn connection(&self, name: Option<&str>) -> DbResult<DbConnection> {
        let name = self.resolve(name).await?;
        let pool = self.pool(&name).await?;
        pool.acquire().await
    }

    /// Acquire a connection and wrap it in a transaction coordinator.
    ///
    /// The coordinator owns the handle for its lifetime; create one per
    /// logical request or job.
    pub async fn coordinator(&self, name: Option<&str>) -> DbResult<TransactionCoordinator> {
        let name = self.resolve(name).await?;
        let pool = self.pool(&name).await?;
        let conn = pool.acquire().await?;
        Ok(TransactionCoordinator::new(name, conn))
    }

    /// Change the connection used when callers omit a name.
    ///
    /// Fails with a configuration error when `name` is not configured.
    /// Subsequent default-resolving calls observe the change immediately.
    pub async fn set_default_connection(&self, name: &str) -> DbResult<()> {
        if !self.connections.contains_key(name) {
            return Err(DbError::configuration(format!(
                "connection '{name}' is not configured"
            )));
        }
        let mut default = self.default.write().await;
        info!(from = %default, to = %name, "default connection changed");
        *default = name.to_string();
        Ok(())
    }

    /// The current default connection name.
    pub async fn default_connection(&self) -> String {
        self.default.read().await.clone()
    }

    /// Probe a connection for liveness. Returns false on any failure,
    /// including an unknown name; never errors.
    pub async fn test_connection(&self, name: Option<&str>) -> bool {
        match self.connection(name).await {
            Ok(mut conn) => conn.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Connection metadata for diagnostics: pure configuration lookup, no
    /// connection is established. Missing sub-fields render as "unknown".
    pub async fn connection_info(&self, name: Option<&str>) -> DbResult<ConnectionInfo> {
        let name = self.resolve(name).await?;
        let config = self.connections.get(&name).ok_or_else(|| {
            DbError::configuration(format!("connection '{name}' is not configured"))
        })?;
        Ok(ConnectionInfo::from_config(&name, config))
    }

    /// Check whether a table exists on the named connection.
    pub async fn table_exists(&self, table: &str, name: Option<&str>) -> DbResult<bool> {
        let mut conn = self.connection(name).await?;
        schema::table_exists(&mut conn, table).await
    }

    /// Fetch column and index listings for a table on the named connection.
    pub async fn table_info(&self, table: &str, name: Option<&str>) -> DbResult<TableInfo> {
        let mut conn = self.connection(name).await?;
        schema::table_info(&mut conn, table).await
    }

    /// Close all pools. Outstanding handles stay usable until dropped.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (name, pool) in pools.drain() {
            info!(connection = %name, "closing connection pool");
            pool.close().await;
        }
    }
}
