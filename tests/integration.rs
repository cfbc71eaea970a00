//! Integration tests for ysql-pool
//!
//! These tests require a running TLS-enabled Postgres or YugabyteDB instance.
//! The server certificate must chain to the root in `POSTGRES_ROOT_CERT`.
//!
//! Run with: cargo test --test integration -- --ignored --nocapture

use futures::FutureExt;
use std::time::Duration;
use ysql_pool::{
    resolve, CertSource, ConnectionParams, Context, Error, ExecutionResult, Pool, PoolConfig,
    RetryPolicy, TxState, Value,
};

/// Helper to connect to the test database
async fn connect_test_pool(max_size: usize) -> ysql_pool::Result<Pool> {
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "yugabyte".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "yugabyte".to_string());
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5433".to_string());
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "yugabyte".to_string());
    let cert = std::env::var("POSTGRES_ROOT_CERT").unwrap_or_else(|_| "config/root.crt".into());

    let params = ConnectionParams::new(host, db, user)
        .port(port)
        .password(password)
        .root_cert(CertSource::Path(cert.into()))
        .application_name("ysql-pool-tests");
    let descriptor = resolve(&params).await?;
    Pool::connect(descriptor, PoolConfig::new().max_size(max_size).min_size(1)).await
}

async fn create_accounts(pool: &Pool, ctx: &Context, table: &str) {
    pool.execute_count(ctx, &format!("DROP TABLE IF EXISTS {}", table), &[])
        .await
        .expect("drop table");
    pool.execute_count(
        ctx,
        &format!(
            "CREATE TABLE {} (id int PRIMARY KEY, name varchar, balance int)",
            table
        ),
        &[],
    )
    .await
    .expect("create table");
    pool.execute_count(
        ctx,
        &format!(
            "INSERT INTO {} VALUES (1, 'Jessica', 10000), (2, 'John', 9000)",
            table
        ),
        &[],
    )
    .await
    .expect("insert rows");
}

async fn balances(pool: &Pool, ctx: &Context, table: &str) -> (i64, i64) {
    let rows = pool
        .query(
            ctx,
            &format!("SELECT balance FROM {} ORDER BY id", table),
            &[],
        )
        .await
        .expect("select balances");
    (
        rows[0].get::<i64, _>(0usize).unwrap(),
        rows[1].get::<i64, _>(0usize).unwrap(),
    )
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_connect_and_query() {
    println!("Test: connect and query");

    let pool = connect_test_pool(4).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(10));

    let row = pool
        .query_one(&ctx, "SELECT $1::int + 1 AS n, $2::text AS s", &[Value::from(41), Value::from("hi")])
        .await
        .expect("query");
    assert_eq!(row.get::<i64, _>("n").unwrap(), 42);
    assert_eq!(row.get::<String, _>("s").unwrap(), "hi");

    assert_eq!(pool.status().in_use, 0);
    pool.shutdown(Duration::from_secs(5)).await;
    println!("  Query round-trip: ✓");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_cursor_releases_connection_when_exhausted() {
    let pool = connect_test_pool(1).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(10));

    let result = pool
        .execute(&ctx, "SELECT generate_series(1, 100) AS n", &[])
        .await
        .expect("execute");
    let ExecutionResult::Rows(mut cursor) = result else {
        panic!("expected rows");
    };
    assert_eq!(pool.status().in_use, 1);

    let mut count = 0;
    while let Some(row) = cursor.next(&ctx).await.expect("row") {
        count += 1;
        assert_eq!(row.get::<i64, _>("n").unwrap(), count);
    }
    assert_eq!(count, 100);
    assert_eq!(cursor.command_tag(), Some("SELECT 100"));
    assert_eq!(pool.status().in_use, 0);

    pool.shutdown(Duration::from_secs(5)).await;
    println!("  Cursor released connection: ✓");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_server_error_is_classified() {
    let pool = connect_test_pool(2).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(10));

    let err = pool
        .query(&ctx, "SELECT * FROM definitely_missing_table", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.as_str()), Some("42P01"));
    assert!(!err.is_serialization_conflict());

    // The connection survives a statement error
    pool.query(&ctx, "SELECT 1", &[]).await.expect("pool still usable");
    pool.shutdown(Duration::from_secs(5)).await;
    println!("  Server error classified: ✓");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_transfer_is_atomic() {
    println!("Test: transfer 800 from Jessica to John");

    let pool = connect_test_pool(4).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(30));
    create_accounts(&pool, &ctx, "it_transfer").await;

    let mut tx = pool.begin(&ctx).await.expect("begin");
    tx.execute_count(
        &ctx,
        "UPDATE it_transfer SET balance = balance - $1 WHERE name = $2",
        &[Value::from(800), Value::from("Jessica")],
    )
    .await
    .expect("debit");

    // Outside readers see the old pair until commit
    assert_eq!(balances(&pool, &ctx, "it_transfer").await, (10000, 9000));

    tx.execute_count(
        &ctx,
        "UPDATE it_transfer SET balance = balance + $1 WHERE name = $2",
        &[Value::from(800), Value::from("John")],
    )
    .await
    .expect("credit");
    tx.commit(&ctx).await.expect("commit");
    assert_eq!(tx.state(), TxState::Committed);

    assert_eq!(balances(&pool, &ctx, "it_transfer").await, (9200, 9800));

    pool.execute_count(&ctx, "DROP TABLE it_transfer", &[])
        .await
        .unwrap();
    pool.shutdown(Duration::from_secs(5)).await;
    println!("  Balances 9200/9800: ✓");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_execute_after_commit_is_rejected() {
    let pool = connect_test_pool(2).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(10));

    let mut tx = pool.begin(&ctx).await.expect("begin");
    tx.commit(&ctx).await.expect("commit");

    let err = tx.execute(&ctx, "SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::TransactionClosed {
            state: TxState::Committed
        }
    ));
    let err = tx.commit(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::TransactionClosed { .. }));

    // Rollback after commit is a no-op, and so is a second one
    tx.rollback(&ctx).await.expect("rollback after commit");
    tx.rollback(&ctx).await.expect("second rollback");
    assert_eq!(pool.status().in_use, 0);

    pool.shutdown(Duration::from_secs(5)).await;
    println!("  Terminal transaction rejects statements: ✓");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_statement_error_keeps_transaction_open() {
    let pool = connect_test_pool(2).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(10));

    let mut tx = pool.begin(&ctx).await.expect("begin");
    let err = tx
        .execute(&ctx, "SELECT * FROM definitely_missing_table", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Db(_)));
    assert_eq!(tx.state(), TxState::Open);

    // The server rolls the failed block back on COMMIT
    let err = tx.commit(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::TransactionAborted), "got {err:?}");
    assert_eq!(tx.state(), TxState::CommitFailed);
    assert_eq!(pool.status().in_use, 0);

    pool.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_dropped_transaction_rolls_back() {
    let pool = connect_test_pool(1).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(30));
    create_accounts(&pool, &ctx, "it_dropped").await;

    {
        let mut tx = pool.begin(&ctx).await.expect("begin");
        tx.execute_count(
            &ctx,
            "UPDATE it_dropped SET balance = 0 WHERE id = $1",
            &[Value::from(1)],
        )
        .await
        .expect("update");
    }

    // The single connection is back once the background rollback finishes
    assert_eq!(balances(&pool, &ctx, "it_dropped").await, (10000, 9000));

    pool.execute_count(&ctx, "DROP TABLE it_dropped", &[])
        .await
        .unwrap();
    pool.shutdown(Duration::from_secs(5)).await;
    println!("  Dropped transaction rolled back: ✓");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_transaction_helper_commits() {
    let pool = connect_test_pool(2).await.expect("connect");
    let ctx = Context::with_timeout(Duration::from_secs(30));
    create_accounts(&pool, &ctx, "it_helper").await;

    let moved = pool
        .transaction(&ctx, &RetryPolicy::default(), |tx, ctx| {
            async move {
                let debited = tx
                    .execute_count(
                        ctx,
                        "UPDATE it_helper SET balance = balance - 800 WHERE id = 1",
                        &[],
                    )
                    .await?;
                tx.execute_count(
                    ctx,
                    "UPDATE it_helper SET balance = balance + 800 WHERE id = 2",
                    &[],
                )
                .await?;
                Ok::<_, Error>(debited)
            }
            .boxed()
        })
        .await
        .expect("transaction");

    assert_eq!(moved, 1);
    assert_eq!(balances(&pool, &ctx, "it_helper").await, (9200, 9800));

    pool.execute_count(&ctx, "DROP TABLE it_helper", &[])
        .await
        .unwrap();
    pool.shutdown(Duration::from_secs(5)).await;
}
