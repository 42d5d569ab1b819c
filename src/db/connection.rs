//! Driver-specific pools and connection handles.
//!
//! Database-specific pools (MySqlPool, PgPool, SqlitePool) are wrapped in
//! enums so the rest of the crate dispatches on one type. A [`DbConnection`]
//! is a single handle checked out of a pool; a transaction coordinator owns
//! one for its whole lifetime so transaction state never leaks across
//! callers sharing the pool.

use crate::config::{ConnectionConfig, Driver};
use crate::error::{DbError, DbResult};
use sqlx::pool::PoolConnection;
use sqlx::{
    Connection, MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool,
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    postgres::{PgConnectOptions, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;
use std::time::Duration;

/// Database-specific connection pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    /// Create a pool for the given configuration.
    ///
    /// Pools are created lazily: no connection is established until a
    /// handle is first acquired.
    pub fn from_config(config: &ConnectionConfig) -> DbResult<Self> {
        let url = config.connect_url()?;
        let pool_opts = &config.pool;
        let is_sqlite = config.driver == Driver::Sqlite;
        let acquire_timeout = Duration::from_secs(pool_opts.acquire_timeout_or_default());
        let idle_timeout = Some(Duration::from_secs(pool_opts.idle_timeout_or_default()));

        match config.driver {
            Driver::Mysql => {
                let mut options = MySqlConnectOptions::from_str(&url).map_err(|e| {
                    DbError::configuration(format!("invalid MySQL connection settings: {e}"))
                })?;
                options = options.charset(config.charset.as_deref().unwrap_or("utf8mb4"));
                if let Some(collation) = &config.collation {
                    options = options.collation(collation);
                }
                let pool = MySqlPoolOptions::new()
                    .min_connections(pool_opts.min_connections_or_default())
                    .max_connections(pool_opts.max_connections_or_default(is_sqlite))
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(pool_opts.test_before_acquire_or_default())
                    .connect_lazy_with(options);
                Ok(DbPool::MySql(pool))
            }
            Driver::Postgres => {
                let options = PgConnectOptions::from_str(&url).map_err(|e| {
                    DbError::configuration(format!("invalid PostgreSQL connection settings: {e}"))
                })?;
                let pool = PgPoolOptions::new()
                    .min_connections(pool_opts.min_connections_or_default())
                    .max_connections(pool_opts.max_connections_or_default(is_sqlite))
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(pool_opts.test_before_acquire_or_default())
                    .connect_lazy_with(options);
                Ok(DbPool::Postgres(pool))
            }
            Driver::Sqlite => {
                let options = SqliteConnectOptions::from_str(&url)
                    .map_err(|e| {
                        DbError::configuration(format!("invalid SQLite connection settings: {e}"))
                    })?
                    .create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .min_connections(pool_opts.min_connections_or_default())
                    .max_connections(pool_opts.max_connections_or_default(is_sqlite))
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(pool_opts.test_before_acquire_or_default())
                    .connect_lazy_with(options);
                Ok(DbPool::Sqlite(pool))
            }
        }
    }

    /// Get the driver for this pool.
    pub fn driver(&self) -> Driver {
        match self {
            DbPool::MySql(_) => Driver::Mysql,
            DbPool::Postgres(_) => Driver::Postgres,
            DbPool::Sqlite(_) => Driver::Sqlite,
        }
    }

    /// Check a connection handle out of the pool.
    pub async fn acquire(&self) -> DbResult<DbConnection> {
        match self {
            DbPool::MySql(pool) => Ok(DbConnection::MySql(pool.acquire().await?)),
            DbPool::Postgres(pool) => Ok(DbConnection::Postgres(pool.acquire().await?)),
            DbPool::Sqlite(pool) => Ok(DbConnection::Sqlite(pool.acquire().await?)),
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }
}

/// A single connection handle checked out of a pool.
///
/// Returned to the pool on drop. While a transaction is open on a handle it
/// must not be shared with another coordinator; the coordinator enforces
/// this by owning the handle exclusively.
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

impl DbConnection {
    /// Get the driver for this connection.
    pub fn driver(&self) -> Driver {
        match self {
            DbConnection::MySql(_) => Driver::Mysql,
            DbConnection::Postgres(_) => Driver::Postgres,
            DbConnection::Sqlite(_) => Driver::Sqlite,
        }
    }

    /// Execute a raw statement, returning the number of affected rows.
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        let rows_affected = match self {
            DbConnection::MySql(conn) => {
                sqlx::query(sql).execute(&mut **conn).await?.rows_affected()
            }
            DbConnection::Postgres(conn) => {
                sqlx::query(sql).execute(&mut **conn).await?.rows_affected()
            }
            DbConnection::Sqlite(conn) => {
                sqlx::query(sql).execute(&mut **conn).await?.rows_affected()
            }
        };
        Ok(rows_affected)
    }

    /// Fetch a single integer scalar, for counts and existence checks.
    pub async fn fetch_scalar_i64(&mut self, sql: &str) -> DbResult<i64> {
        let value = match self {
            DbConnection::MySql(conn) => {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_one(&mut **conn)
                    .await?
            }
            DbConnection::Postgres(conn) => {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_one(&mut **conn)
                    .await?
            }
            DbConnection::Sqlite(conn) => {
                sqlx::query_scalar::<_, i64>(sql)
                    .fetch_one(&mut **conn)
                    .await?
            }
        };
        Ok(value)
    }

    /// Liveness probe against the underlying server.
    pub async fn ping(&mut self) -> DbResult<()> {
        match self {
            DbConnection::MySql(conn) => conn.ping().await?,
            DbConnection::Postgres(conn) => conn.ping().await?,
            DbConnection::Sqlite(conn) => conn.ping().await?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("driver", &self.driver())
            .finish_non_exhaustive()
    }
}
