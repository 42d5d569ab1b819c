//! Transaction coordinator tests against in-memory SQLite.
//!
//! SQLite shares the savepoint SQL dialect this crate issues, so the full
//! lifecycle (nesting, batch abort, retry) is exercised without a server.

use audit_db::{
    BatchOperation, ConnectionConfig, ConnectionRegistry, DatabaseSettings, DbError, DbResult,
    RetryPolicy, TransactionCoordinator,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Capture the crate's lifecycle logs when RUST_LOG is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn coordinator_with_table() -> TransactionCoordinator {
    init_tracing();
    let settings = DatabaseSettings::single("primary", ConnectionConfig::sqlite(":memory:"));
    let registry = ConnectionRegistry::new(settings).unwrap();
    let mut tx = registry.coordinator(None).await.unwrap();
    tx.connection()
        .execute("CREATE TABLE audit_log (id INTEGER PRIMARY KEY AUTOINCREMENT, entry TEXT NOT NULL)")
        .await
        .unwrap();
    tx
}

async fn count_entries(tx: &mut TransactionCoordinator) -> i64 {
    tx.connection()
        .fetch_scalar_i64("SELECT COUNT(*) FROM audit_log")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let mut tx = coordinator_with_table().await;
    let rows = tx
        .transaction(|tx| {
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('created asset')")
                    .await
            })
        })
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(tx.transaction_level(), 0);
    assert_eq!(count_entries(&mut tx).await, 1);
}

#[tokio::test]
async fn test_transaction_rolls_back_on_failure() {
    let mut tx = coordinator_with_table().await;
    let result: DbResult<()> = tx
        .transaction(|tx| {
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('doomed')")
                    .await?;
                Err(DbError::database("validation failed"))
            })
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    // Rollback succeeded, so only the original cause is carried.
    assert!(err.rollback_failure().is_none());
    assert!(std::error::Error::source(&err).is_some());
    assert_eq!(tx.transaction_level(), 0);
    assert_eq!(count_entries(&mut tx).await, 0);
}

#[tokio::test]
async fn test_nested_transaction_commit_uses_savepoints() {
    let mut tx = coordinator_with_table().await;
    tx.transaction(|tx| {
        Box::pin(async move {
            tx.connection()
                .execute("INSERT INTO audit_log (entry) VALUES ('outer')")
                .await?;
            assert_eq!(tx.transaction_level(), 1);
            tx.transaction(|tx| {
                Box::pin(async move {
                    tx.connection()
                        .execute("INSERT INTO audit_log (entry) VALUES ('inner')")
                        .await?;
                    assert_eq!(tx.transaction_level(), 2);
                    Ok(())
                })
            })
            .await?;
            // The inner commit released a savepoint; the outer transaction
            // must still be open.
            assert!(tx.in_transaction());
            assert_eq!(tx.transaction_level(), 1);
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(count_entries(&mut tx).await, 2);
}

#[tokio::test]
async fn test_nested_transaction_failure_leaves_outer_alive() {
    let mut tx = coordinator_with_table().await;
    tx.transaction(|tx| {
        Box::pin(async move {
            tx.connection()
                .execute("INSERT INTO audit_log (entry) VALUES ('outer')")
                .await?;
            let inner: DbResult<()> = tx
                .transaction(|tx| {
                    Box::pin(async move {
                        tx.connection()
                            .execute("INSERT INTO audit_log (entry) VALUES ('inner')")
                            .await?;
                        Err(DbError::database("inner failure"))
                    })
                })
                .await;
            assert!(inner.is_err());
            // Only the savepoint was rolled back: outer work survives.
            assert!(tx.in_transaction());
            assert_eq!(tx.transaction_level(), 1);
            let visible = tx
                .connection()
                .fetch_scalar_i64("SELECT COUNT(*) FROM audit_log")
                .await?;
            assert_eq!(visible, 1);
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(count_entries(&mut tx).await, 1);
}

#[tokio::test]
#[allow(deprecated)]
async fn test_atomic_is_a_transaction_alias() {
    let mut tx = coordinator_with_table().await;
    let result: DbResult<()> = tx
        .atomic(|tx| {
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('doomed')")
                    .await?;
                Err(DbError::database("nope"))
            })
        })
        .await;
    assert!(matches!(result.unwrap_err(), DbError::Transaction { .. }));
    assert_eq!(count_entries(&mut tx).await, 0);
}

#[tokio::test]
async fn test_rollback_to_explicit_savepoint() {
    let mut tx = coordinator_with_table().await;
    tx.begin(None).await.unwrap();
    tx.connection()
        .execute("INSERT INTO audit_log (entry) VALUES ('kept')")
        .await
        .unwrap();
    tx.begin(Some("before_risky")).await.unwrap();
    tx.connection()
        .execute("INSERT INTO audit_log (entry) VALUES ('discarded')")
        .await
        .unwrap();
    assert_eq!(count_entries(&mut tx).await, 2);

    tx.rollback(Some("before_risky")).await.unwrap();
    assert_eq!(tx.transaction_level(), 1);
    assert_eq!(count_entries(&mut tx).await, 1);
}

#[tokio::test]
async fn test_batch_collects_results_in_order() {
    let mut tx = coordinator_with_table().await;
    let ops: Vec<BatchOperation<u64>> = vec![
        Box::new(|tx| {
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('first')")
                    .await
            })
        }),
        Box::new(|tx| {
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('second'), ('third')")
                    .await
            })
        }),
    ];
    let results = tx.batch(ops).await.unwrap();
    assert_eq!(results, vec![1, 2]);
    assert_eq!(tx.transaction_level(), 0);
    assert_eq!(count_entries(&mut tx).await, 3);
}

#[tokio::test]
async fn test_batch_failure_aborts_whole_batch() {
    let mut tx = coordinator_with_table().await;
    let third_ran = Arc::new(AtomicBool::new(false));
    let third_flag = Arc::clone(&third_ran);

    let ops: Vec<BatchOperation<u64>> = vec![
        Box::new(|tx| {
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('first')")
                    .await
            })
        }),
        Box::new(|_tx| Box::pin(async { Err(DbError::database("second operation failed")) })),
        Box::new(move |tx| {
            third_flag.store(true, Ordering::SeqCst);
            Box::pin(async move {
                tx.connection()
                    .execute("INSERT INTO audit_log (entry) VALUES ('third')")
                    .await
            })
        }),
    ];

    let err = tx.batch(ops).await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert!(std::error::Error::source(&err).is_some());
    assert!(!third_ran.load(Ordering::SeqCst));
    assert_eq!(tx.transaction_level(), 0);
    assert_eq!(count_entries(&mut tx).await, 0);
}

#[tokio::test]
async fn test_query_with_retry_exhausts_attempts() {
    let mut tx = coordinator_with_table().await;
    let calls = Arc::new(AtomicU32::new(0));
    let calls_probe = Arc::clone(&calls);
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
    };

    let result: DbResult<i64> = tx
        .query_with_retry(policy, move |conn| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                conn.fetch_scalar_i64("SELECT COUNT(*) FROM no_such_table")
                    .await
            })
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(calls_probe.load(Ordering::SeqCst), 3);
    assert_eq!(err.attempts(), Some(3));
    assert!(err.to_string().contains("3 attempts"));
}

#[tokio::test]
async fn test_query_with_retry_recovers_after_transient_failure() {
    let mut tx = coordinator_with_table().await;
    let calls = Arc::new(AtomicU32::new(0));
    let calls_probe = Arc::clone(&calls);
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
    };

    let value = tx
        .query_with_retry(policy, move |conn| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DbError::database("transient failure"))
                } else {
                    conn.fetch_scalar_i64("SELECT 7").await
                }
            })
        })
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(calls_probe.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_query_with_retry_backs_off_between_attempts() {
    let mut tx = coordinator_with_table().await;
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(20),
    };
    let started = Instant::now();

    let result: DbResult<i64> = tx
        .query_with_retry(policy, |conn| {
            Box::pin(async move {
                conn.fetch_scalar_i64("SELECT COUNT(*) FROM no_such_table")
                    .await
            })
        })
        .await;

    assert!(result.is_err());
    // One delay of base_delay * 2^1 between the two attempts.
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn test_query_with_retry_does_not_open_transaction() {
    let mut tx = coordinator_with_table().await;
    let policy = RetryPolicy::with_max_attempts(1);
    tx.query_with_retry(policy, |conn| {
        Box::pin(async move {
            conn.execute("INSERT INTO audit_log (entry) VALUES ('direct')")
                .await
        })
    })
    .await
    .unwrap();
    assert!(!tx.in_transaction());
    assert_eq!(count_entries(&mut tx).await, 1);
}
