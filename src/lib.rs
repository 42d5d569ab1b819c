//! Data-access core for the asset audit platform.
//!
//! Two cooperating pieces: a [`ConnectionRegistry`] resolving logical
//! connection names to live handles, and a [`TransactionCoordinator`]
//! owning transaction lifecycle for one acquired connection - nesting via
//! savepoints, batch composition, and retry-with-backoff execution.
//! Repositories and services wrap their multi-step persistence in
//! [`TransactionCoordinator::transaction`]; everything above that
//! (resolvers, controllers, mail) lives outside this crate.
//!
//! ```no_run
//! use audit_db::{ConnectionConfig, ConnectionRegistry, DatabaseSettings, DbResult};
//!
//! # async fn example() -> DbResult<()> {
//! let settings = DatabaseSettings::single("primary", ConnectionConfig::sqlite("audit.db"));
//! let registry = ConnectionRegistry::new(settings)?;
//! let mut tx = registry.coordinator(None).await?;
//! tx.transaction(|tx| {
//!     Box::pin(async move {
//!         tx.connection()
//!             .execute("UPDATE assets SET status = 'audited'")
//!             .await
//!     })
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;

pub use config::{ConnectionConfig, ConnectionInfo, DatabaseSettings, Driver, PoolOptions};
pub use db::{
    BatchOperation, ConnectionRegistry, DbConnection, DbPool, RetryPolicy, TableInfo,
    TransactionCoordinator,
};
pub use error::{DbError, DbResult};
