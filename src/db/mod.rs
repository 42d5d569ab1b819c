//! Database access layer.
//!
//! - Named connection registry with lazily-created pools
//! - Transaction coordination (savepoint nesting, batches, retries)
//! - Schema introspection

pub mod connection;
pub mod coordinator;
pub mod registry;
pub mod schema;

pub use connection::{DbConnection, DbPool};
pub use coordinator::{BatchOperation, RetryPolicy, TransactionCoordinator};
pub use registry::ConnectionRegistry;
pub use schema::TableInfo;
