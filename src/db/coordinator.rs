//! Transaction coordination for a single acquired connection.
//!
//! A [`TransactionCoordinator`] owns one connection handle for its lifetime
//! and tracks transaction depth and savepoints on it. Nested transactions
//! are emulated with `SAVEPOINT` / `RELEASE SAVEPOINT` / `ROLLBACK TO
//! SAVEPOINT` statements, so an inner failure unwinds only to its own
//! savepoint and leaves the outer transaction alive.
//!
//! One coordinator serves one logical request or job. The `&mut self`
//! methods make concurrent mutation of the depth counter and savepoint
//! stack unrepresentable; share work across tasks by giving each task its
//! own coordinator, not by sharing one.

use crate::db::connection::DbConnection;
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry configuration for [`TransactionCoordinator::query_with_retry`].
///
/// The delay before the attempt following failed attempt `n` is
/// `base_delay * 2^n`, so with the defaults the delays are 200ms and 400ms.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

    /// Default delays with a custom attempt budget.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }
}

/// One step of a [`TransactionCoordinator::batch`] call.
pub type BatchOperation<T> =
    Box<dyn for<'c> FnOnce(&'c mut TransactionCoordinator) -> BoxFuture<'c, DbResult<T>> + Send>;

/// Transaction lifecycle manager for one connection.
pub struct TransactionCoordinator {
    conn: DbConnection,
    /// Logical connection name, for diagnostics only.
    name: String,
    depth: u32,
    savepoints: Vec<String>,
}

impl TransactionCoordinator {
    /// Wrap an acquired connection. The coordinator owns the handle until
    /// [`into_connection`](Self::into_connection) releases it.
    pub fn new(name: impl Into<String>, conn: DbConnection) -> Self {
        Self {
            conn,
            name: name.into(),
            depth: 0,
            savepoints: Vec::new(),
        }
    }

    /// The logical connection name this coordinator was created for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct access to the underlying connection, for running queries
    /// inside a unit of work.
    pub fn connection(&mut self) -> &mut DbConnection {
        &mut self.conn
    }

    /// True iff a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Current transaction depth: top-level plus savepoint transactions
    /// not yet matched by a commit or rollback. Callers use this to detect
    /// re-entrancy before deciding whether to nest.
    pub fn transaction_level(&self) -> u32 {
        self.depth
    }

    /// Begin a transaction.
    ///
    /// With a savepoint name, issues `SAVEPOINT <name>` and pushes it on
    /// the stack. Without one, issues a genuine `BEGIN` when no transaction
    /// is active; when one already is, only the depth bookkeeping moves.
    /// Depth increments exactly once per successful call.
    pub async fn begin(&mut self, savepoint: Option<&str>) -> DbResult<()> {
        match savepoint {
            Some(name) => {
                validate_savepoint_name(name)?;
                self.conn
                    .execute(&format!("SAVEPOINT {name}"))
                    .await
                    .map_err(|e| {
                        DbError::transaction_with(format!("failed to create savepoint '{name}'"), e)
                    })?;
                self.savepoints.push(name.to_string());
            }
            None if self.depth == 0 => {
                self.conn
                    .execute("BEGIN")
                    .await
                    .map_err(|e| DbError::transaction_with("failed to begin transaction", e))?;
            }
            None => {}
        }
        self.depth += 1;
        debug!(connection = %self.name, depth = self.depth, "transaction begun");
        Ok(())
    }

    /// Commit the innermost transaction.
    ///
    /// Releases the most recent savepoint when one is on the stack; issues
    /// a genuine `COMMIT` when leaving the top level; a bare nested level
    /// (begun without a savepoint) only moves the bookkeeping. Fails
    /// without touching depth when no transaction is active.
    pub async fn commit(&mut self) -> DbResult<()> {
        if self.depth == 0 {
            return Err(DbError::transaction("no active transaction"));
        }
        if let Some(name) = self.savepoints.last().cloned() {
            self.conn
                .execute(&format!("RELEASE SAVEPOINT {name}"))
                .await
                .map_err(|e| {
                    DbError::transaction_with(format!("failed to release savepoint '{name}'"), e)
                })?;
            self.savepoints.pop();
        } else if self.depth == 1 {
            self.conn
                .execute("COMMIT")
                .await
                .map_err(|e| DbError::transaction_with("failed to commit transaction", e))?;
        }
        self.depth -= 1;
        debug!(connection = %self.name, depth = self.depth, "transaction committed");
        Ok(())
    }

    /// Roll back the innermost transaction, or to an explicitly named
    /// savepoint.
    ///
    /// With an explicit name the statement targets that savepoint and the
    /// stack is left untouched (the caller picked the target). Otherwise
    /// the top savepoint is popped and rolled back to; with an empty stack
    /// a genuine `ROLLBACK` is issued when leaving the top level, while a
    /// bare nested level only moves the bookkeeping. Fails without touching
    /// depth when no transaction is active.
    pub async fn rollback(&mut self, savepoint: Option<&str>) -> DbResult<()> {
        if self.depth == 0 {
            return Err(DbError::transaction("no active transaction"));
        }
        if let Some(name) = savepoint {
            validate_savepoint_name(name)?;
            self.conn
                .execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .await
                .map_err(|e| {
                    DbError::transaction_with(
                        format!("failed to roll back to savepoint '{name}'"),
                        e,
                    )
                })?;
        } else if let Some(name) = self.savepoints.last().cloned() {
            self.conn
                .execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .await
                .map_err(|e| {
                    DbError::transaction_with(
                        format!("failed to roll back to savepoint '{name}'"),
                        e,
                    )
                })?;
            self.savepoints.pop();
        } else if self.depth == 1 {
            self.conn
                .execute("ROLLBACK")
                .await
                .map_err(|e| DbError::transaction_with("failed to roll back transaction", e))?;
        }
        self.depth -= 1;
        debug!(connection = %self.name, depth = self.depth, "transaction rolled back");
        Ok(())
    }

    /// Run a unit of work inside a transaction.
    ///
    /// This is the primary entry point: repositories never call
    /// begin/commit/rollback directly in the common path. The unit of work
    /// receives the coordinator, so it can run queries through
    /// [`connection`](Self::connection) and nest further `transaction`
    /// calls; nesting begins a generated savepoint, and an inner failure
    /// rolls back only to it.
    ///
    /// On failure the transaction is rolled back and the original cause is
    /// wrapped in a transaction error; if the rollback itself also fails,
    /// both failures are carried (see [`DbError::rollback_failure`]).
    pub async fn transaction<T, F>(&mut self, work: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut TransactionCoordinator) -> BoxFuture<'c, DbResult<T>>,
    {
        let savepoint = (self.depth > 0).then(|| format!("sp_{}", self.depth));
        self.begin(savepoint.as_deref()).await?;
        match work(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(cause) => match self.rollback(None).await {
                Ok(()) => Err(DbError::rolled_back(cause)),
                Err(rollback_err) => Err(DbError::rollback_failed(cause, rollback_err)),
            },
        }
    }

    /// Alias of [`transaction`](Self::transaction), kept for callers of the
    /// original repository API. The semantics are identical.
    #[deprecated(note = "use `transaction`")]
    pub async fn atomic<T, F>(&mut self, work: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut TransactionCoordinator) -> BoxFuture<'c, DbResult<T>>,
    {
        self.transaction(work).await
    }

    /// Run a sequence of operations inside one transaction, strictly in
    /// order, collecting results in the same order. The first failing
    /// operation aborts the whole batch: later operations never run and
    /// earlier effects are rolled back.
    pub async fn batch<T>(&mut self, operations: Vec<BatchOperation<T>>) -> DbResult<Vec<T>>
    where
        T: Send,
    {
        let savepoint = (self.depth > 0).then(|| format!("sp_{}", self.depth));
        self.begin(savepoint.as_deref()).await?;

        let mut results = Vec::with_capacity(operations.len());
        let mut failure = None;
        for operation in operations {
            match operation(&mut *self).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                self.commit().await?;
                Ok(results)
            }
            Some(cause) => match self.rollback(None).await {
                Ok(()) => Err(DbError::rolled_back(cause)),
                Err(rollback_err) => Err(DbError::rollback_failed(cause, rollback_err)),
            },
        }
    }

    /// Execute a query with bounded retries and exponential backoff.
    ///
    /// Attempts are independent: no transaction is opened around them, so a
    /// unit of work that writes must be idempotent. The delay between
    /// attempts blocks only the calling task. After the final failed
    /// attempt the last cause is wrapped in a database error stating the
    /// attempt count.
    pub async fn query_with_retry<T, F>(&mut self, policy: RetryPolicy, work: F) -> DbResult<T>
    where
        F: for<'c> Fn(&'c mut DbConnection) -> BoxFuture<'c, DbResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = DbError::database("query was never attempted");
        for attempt in 1..=max_attempts {
            match work(&mut self.conn).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        connection = %self.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "query attempt failed"
                    );
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(DbError::retries_exhausted(max_attempts, last_error))
    }

    /// Release the underlying connection for reuse.
    ///
    /// This is the reuse boundary: it fails while a transaction is still
    /// active, so a leaked depth can never silently corrupt a handle that
    /// goes back into circulation. Dropping a coordinator mid-transaction
    /// instead returns a dirty handle to the pool - always drive
    /// transactions to completion or release through this method.
    pub fn into_connection(self) -> DbResult<DbConnection> {
        if self.depth > 0 {
            warn!(
                connection = %self.name,
                depth = self.depth,
                "connection released with an open transaction"
            );
            return Err(DbError::transaction(format!(
                "transaction still active at depth {}",
                self.depth
            )));
        }
        Ok(self.conn)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("savepoints", &self.savepoints)
            .finish_non_exhaustive()
    }
}

/// Savepoint names are interpolated into SQL verbatim, so they are
/// restricted to identifier characters.
fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DbError::transaction(format!(
            "invalid savepoint name '{name}'"
        )))
    }
}
