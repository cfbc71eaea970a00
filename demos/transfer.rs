//! Transfer demo against a live cluster
//!
//! Creates the DemoAccount table, moves 800 from Jessica to John inside a
//! retried transaction and prints the balances before and after.
//!
//! Configured from the environment (`DB_HOST`, `DB_PORT`, `DB_NAME`,
//! `DB_USER`, `DB_PASSWORD`, `DB_ROOT_CERT`, ...):
//!
//! ```bash
//! DB_HOST=127.0.0.1 DB_PORT=5433 DB_ROOT_CERT=/path/to/root.crt \
//!   RUST_LOG=ysql_pool=debug cargo run --example transfer
//! ```

use futures::FutureExt;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use ysql_pool::{resolve, Context, Pool, RetryPolicy, Settings, Value};

const TRANSFER_AMOUNT: i64 = 800;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let descriptor = resolve(&settings.connection).await?;
    let pool = Pool::connect(descriptor, settings.pool).await?;
    let ctx = Context::with_timeout(Duration::from_secs(30));

    pool.execute_count(&ctx, "DROP TABLE IF EXISTS DemoAccount", &[])
        .await?;
    pool.execute_count(
        &ctx,
        "CREATE TABLE DemoAccount (
            id int PRIMARY KEY,
            name varchar,
            age int,
            country varchar,
            balance int
        )",
        &[],
    )
    .await?;
    let inserted = pool
        .execute_count(
            &ctx,
            "INSERT INTO DemoAccount VALUES
                (1, 'Jessica', 28, 'USA', 10000),
                (2, 'John', 28, 'Canada', 9000)",
            &[],
        )
        .await?;
    println!(">>>> Created table DemoAccount ({} rows)", inserted);

    print_accounts(&pool, &ctx).await?;

    pool.transaction(&ctx, &RetryPolicy::default(), |tx, ctx| {
        async move {
            tx.execute_count(
                ctx,
                "UPDATE DemoAccount SET balance = balance - $1 WHERE name = $2",
                &[Value::from(TRANSFER_AMOUNT), Value::from("Jessica")],
            )
            .await?;
            tx.execute_count(
                ctx,
                "UPDATE DemoAccount SET balance = balance + $1 WHERE name = $2",
                &[Value::from(TRANSFER_AMOUNT), Value::from("John")],
            )
            .await?;
            Ok::<_, ysql_pool::Error>(())
        }
        .boxed()
    })
    .await?;
    println!(">>>> Transferred {} between accounts", TRANSFER_AMOUNT);

    print_accounts(&pool, &ctx).await?;

    pool.execute_count(&ctx, "DROP TABLE IF EXISTS DemoAccount", &[])
        .await?;
    pool.close().await;
    Ok(())
}

async fn print_accounts(pool: &Pool, ctx: &Context) -> ysql_pool::Result<()> {
    let rows = pool
        .query(
            ctx,
            "SELECT name, age, country, balance FROM DemoAccount ORDER BY id",
            &[],
        )
        .await?;
    println!(">>>> Selecting accounts:");
    for row in rows {
        let name: String = row.get("name")?;
        let age: i64 = row.get("age")?;
        let country: String = row.get("country")?;
        let balance: i64 = row.get("balance")?;
        println!(
            "name = {}, age = {}, country = {}, balance = {}",
            name, age, country, balance
        );
    }
    Ok(())
}
