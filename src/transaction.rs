//! Transactions on a dedicated pooled connection
//!
//! A [`Transaction`] holds one checked-out connection from `BEGIN` until it
//! reaches a terminal state. Statement errors leave it open so the caller can
//! decide between rolling back and carrying on; only a broken connection ends
//! it early.

use crate::connection::{rows_affected, Connection, ConnectionState, Response, TransactionStatus};
use crate::context::{Context, Interrupted};
use crate::executor::{record_outcome, statement_fields};
use crate::metrics::{counters, labels};
use crate::pool::{PgConnectionManager, Pool, PooledConnection};
use crate::sink::{LogFields, LogSink};
use crate::types::{ExecutionResult, Row, RowCursor, Value};
use crate::{Error, Result};
use futures::future::BoxFuture;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bound on the ROLLBACK issued when a connection is handed back mid-transaction
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Statements may be executed
    Open,
    /// COMMIT succeeded
    Committed,
    /// Rolled back explicitly, or abandoned after the connection broke
    RolledBack,
    /// COMMIT failed; the server did not apply the transaction
    CommitFailed,
}

impl TxState {
    /// Whether no further statements are accepted
    pub fn is_terminal(self) -> bool {
        self != TxState::Open
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Open => write!(f, "open"),
            TxState::Committed => write!(f, "committed"),
            TxState::RolledBack => write!(f, "rolled back"),
            TxState::CommitFailed => write!(f, "commit failed"),
        }
    }
}

/// SQL isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// READ COMMITTED
    ReadCommitted,
    /// REPEATABLE READ (snapshot isolation on YugabyteDB)
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for [`Pool::begin_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Isolation level; the server default when `None`
    pub isolation: Option<IsolationLevel>,
    /// Start a READ ONLY transaction
    pub read_only: bool,
}

impl TransactionOptions {
    /// Server defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Start read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn begin_statement(&self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        if self.read_only {
            sql.push_str(" READ ONLY");
        }
        sql
    }
}

/// Retry schedule for [`Pool::transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` total attempts and default delays
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the first backoff
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff ceiling
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// Exponential in `attempt`, capped at `max_delay`, with the upper half
    /// jittered so concurrent losers of a conflict do not retry in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let ceiling_us = ceiling.as_micros() as u64;
        if ceiling_us < 2 {
            return ceiling;
        }
        let jittered = rand::thread_rng().gen_range(ceiling_us / 2..=ceiling_us);
        Duration::from_micros(jittered)
    }
}

/// An open database transaction
///
/// Obtained from [`Pool::begin`]. Dropping an open transaction rolls it back
/// in the background and returns the connection to the pool.
pub struct Transaction {
    conn: Option<PooledConnection<PgConnectionManager>>,
    state: TxState,
    sink: Arc<dyn LogSink>,
    started: Instant,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("conn", &self.conn)
            .finish()
    }
}

impl Transaction {
    /// Current state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Whether statements can still be executed
    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    /// Run one statement inside the transaction
    ///
    /// On a statement error the transaction stays [`TxState::Open`]. If the
    /// context fires mid-exchange the connection is retired, the transaction
    /// becomes [`TxState::RolledBack`] and the interruption is returned.
    pub async fn execute(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<ExecutionResult<'_>> {
        self.ensure_open()?;
        self.sink
            .info("Executing SQL Query (Tx)", &statement_fields(sql, params));

        let started = Instant::now();
        let outcome = {
            let sink = self.sink.clone();
            let conn = self.conn_mut()?;
            ctx.run(async move {
                resync(conn, &*sink).await?;
                conn.query_portal(sql, params).await
            })
            .await
        };
        let response = self.settle(outcome);
        record_outcome(&*self.sink, sql, started, response.as_ref().err());

        match response? {
            Response::Rows(columns) => Ok(ExecutionResult::Rows(RowCursor::borrowed(
                self.conn_mut()?,
                columns,
            ))),
            Response::Complete { tag } => Ok(ExecutionResult::RowCount(rows_affected(&tag))),
        }
    }

    /// Run a query and collect every row
    pub async fn query(&mut self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = match self.execute(ctx, sql, params).await? {
            ExecutionResult::Rows(cursor) => cursor.all(ctx).await,
            ExecutionResult::RowCount(_) => Ok(Vec::new()),
        };
        self.after_cursor(rows)
    }

    /// Run a query expected to return exactly one row
    pub async fn query_one(&mut self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Row> {
        let mut rows = self.query(ctx, sql, params).await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(Error::Column("query returned no rows".into())),
            n => Err(Error::Column(format!("expected one row, got {}", n))),
        }
    }

    /// Run a statement and return the number of rows it affected
    pub async fn execute_count(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let count = self.execute(ctx, sql, params).await?.row_count(ctx).await;
        self.after_cursor(count)
    }

    /// Commit and release the connection
    ///
    /// The connection is released whether or not COMMIT succeeds. A COMMIT
    /// the server answers with ROLLBACK, because an earlier statement failed,
    /// is reported as [`Error::TransactionAborted`].
    pub async fn commit(&mut self, ctx: &Context) -> Result<()> {
        self.ensure_open()?;

        let outcome = {
            let sink = self.sink.clone();
            let conn = self.conn_mut()?;
            ctx.run(async move {
                resync(conn, &*sink).await?;
                conn.simple_command("COMMIT").await
            })
            .await
        };

        let result = match outcome {
            Ok(Ok(tag)) if tag == "ROLLBACK" => Err(Error::TransactionAborted),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(interrupted) => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.mark_broken();
                }
                Err(interrupted.into())
            }
        };

        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => {
                self.state = TxState::Committed;
                counters::transaction_finished(labels::OUTCOME_COMMITTED);
                tracing::debug!(elapsed_ms, "transaction committed");
            }
            Err(e) => {
                self.state = TxState::CommitFailed;
                counters::transaction_finished(labels::OUTCOME_COMMIT_FAILED);
                if e.is_serialization_conflict() {
                    counters::serialization_conflict();
                }
                self.sink.error(
                    "transaction commit failed",
                    &LogFields::new()
                        .with("error", e.to_string())
                        .with("elapsed_ms", elapsed_ms),
                );
            }
        }

        self.release().await;
        result
    }

    /// Roll back and release the connection
    ///
    /// A no-op returning `Ok(())` once the transaction is no longer open.
    pub async fn rollback(&mut self, ctx: &Context) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.ensure_open().is_err() {
            // Connection broke earlier; the server already discarded the transaction
            return Ok(());
        }

        let outcome = {
            let sink = self.sink.clone();
            let conn = self.conn_mut()?;
            ctx.run(async move {
                resync(conn, &*sink).await?;
                conn.simple_command("ROLLBACK").await
            })
            .await
        };

        self.state = TxState::RolledBack;
        counters::transaction_finished(labels::OUTCOME_ROLLED_BACK);

        let mut conn = self.conn.take();
        let result = match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(interrupted) => Err(interrupted.into()),
        };
        if let Err(e) = &result {
            if let Some(conn) = conn.as_mut() {
                conn.discard();
            }
            self.sink.warn(
                "rollback failed; connection retired",
                &LogFields::new().with("error", e.to_string()),
            );
        }
        drop(conn);
        result
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(Error::TransactionClosed { state: self.state }),
        }
    }

    /// Fail on a terminal transaction; abandon one whose connection broke
    fn ensure_open(&mut self) -> Result<()> {
        if self.state == TxState::Open && self.conn.as_deref().map_or(true, Connection::is_broken) {
            self.abandon();
        }
        match self.state {
            TxState::Open => Ok(()),
            state => Err(Error::TransactionClosed { state }),
        }
    }

    fn settle<T>(&mut self, outcome: std::result::Result<Result<T>, Interrupted>) -> Result<T> {
        match outcome {
            Ok(result) => self.after_cursor(result),
            Err(interrupted) => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.mark_broken();
                }
                self.abandon();
                Err(interrupted.into())
            }
        }
    }

    fn after_cursor<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_serialization_conflict() {
                counters::serialization_conflict();
            }
            if self.conn.as_deref().map_or(false, Connection::is_broken) {
                self.abandon();
            }
        }
        result
    }

    /// Give up on the transaction and retire its connection
    fn abandon(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.discard();
        }
        if self.state == TxState::Open {
            self.state = TxState::RolledBack;
            counters::transaction_finished(labels::OUTCOME_ROLLED_BACK);
            self.sink.warn(
                "transaction abandoned; connection retired",
                &LogFields::new().with("elapsed_ms", self.started.elapsed().as_millis() as u64),
            );
        }
    }

    /// Hand the connection back, closing any transaction block the server still has open
    async fn release(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if !conn.is_broken() && conn.transaction_status() != TransactionStatus::Idle {
            let outcome = tokio::time::timeout(RESET_TIMEOUT, conn.simple_command("ROLLBACK")).await;
            if !matches!(outcome, Ok(Ok(_))) {
                conn.discard();
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxState::Open {
            return;
        }
        self.state = TxState::RolledBack;
        counters::transaction_finished(labels::OUTCOME_ROLLED_BACK);

        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if conn.is_broken() {
            conn.discard();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("rolling back dropped transaction");
                handle.spawn(async move {
                    let reset = async {
                        if conn.state() == ConnectionState::ReadingResults {
                            conn.drain().await?;
                        }
                        conn.simple_command("ROLLBACK").await
                    };
                    let outcome = tokio::time::timeout(RESET_TIMEOUT, reset).await;
                    if !matches!(outcome, Ok(Ok(_))) {
                        conn.discard();
                    }
                });
            }
            Err(_) => conn.discard(),
        }
    }
}

/// Finish a result set an earlier cursor left unread
///
/// A server error inside the abandoned result set belongs to that earlier
/// statement; it is logged and the connection kept, since it is back in sync.
async fn resync(conn: &mut Connection, sink: &dyn LogSink) -> Result<()> {
    if conn.state() != ConnectionState::ReadingResults {
        return Ok(());
    }
    match conn.drain().await {
        Ok(()) => Ok(()),
        Err(e) if !conn.is_broken() => {
            sink.warn(
                "unread result set ended with an error",
                &LogFields::new().with("error", e.to_string()),
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl Pool<PgConnectionManager> {
    /// Start a transaction with the server's default isolation level
    pub async fn begin(&self, ctx: &Context) -> Result<Transaction> {
        self.begin_with(ctx, TransactionOptions::default()).await
    }

    /// Start a transaction with explicit options
    ///
    /// On failure the connection goes back to the pool (or is retired if the
    /// failure left it unusable).
    pub async fn begin_with(&self, ctx: &Context, options: TransactionOptions) -> Result<Transaction> {
        let mut conn = self.acquire(ctx).await?;
        let statement = options.begin_statement();

        match ctx.run(conn.simple_command(&statement)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.sink().error(
                    "failed to begin transaction",
                    &LogFields::new().with("error", e.to_string()),
                );
                return Err(e);
            }
            Err(interrupted) => {
                conn.mark_broken();
                return Err(interrupted.into());
            }
        }

        tracing::debug!(%statement, "transaction started");
        Ok(Transaction {
            conn: Some(conn),
            state: TxState::Open,
            sink: self.sink().clone(),
            started: Instant::now(),
        })
    }

    /// Run `body` in a transaction, re-running it from BEGIN on serialization conflicts
    ///
    /// `body` returning `Ok` commits; returning `Err` rolls back. When the
    /// body or the commit fails with [`Error::SerializationConflict`] the
    /// whole transaction is retried after a backoff, up to
    /// `policy.max_attempts` attempts in total. Any other error is returned
    /// immediately.
    ///
    /// ```no_run
    /// # async fn example(pool: ysql_pool::Pool, ctx: ysql_pool::Context) -> ysql_pool::Result<()> {
    /// use futures::FutureExt;
    /// use ysql_pool::{RetryPolicy, Value};
    ///
    /// pool.transaction(&ctx, &RetryPolicy::default(), |tx, ctx| {
    ///     async move {
    ///         tx.execute_count(ctx, "UPDATE DemoAccount SET balance = balance - $1 WHERE id = $2",
    ///             &[Value::from(800), Value::from(1)]).await?;
    ///         tx.execute_count(ctx, "UPDATE DemoAccount SET balance = balance + $1 WHERE id = $2",
    ///             &[Value::from(800), Value::from(2)]).await?;
    ///         Ok::<_, ysql_pool::Error>(())
    ///     }
    ///     .boxed()
    /// })
    /// .await
    /// # }
    /// ```
    pub async fn transaction<T, F>(&self, ctx: &Context, policy: &RetryPolicy, mut body: F) -> Result<T>
    where
        F: for<'t> FnMut(&'t mut Transaction, &'t Context) -> BoxFuture<'t, Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let mut tx = self.begin(ctx).await?;
            let result = match body(&mut tx, ctx).await {
                Ok(value) => tx.commit(ctx).await.map(|()| value),
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback(ctx).await {
                        self.sink().warn(
                            "rollback after failed transaction body failed",
                            &LogFields::new().with("error", rollback_err.to_string()),
                        );
                    }
                    Err(e)
                }
            };
            drop(tx);

            match result {
                Err(e) if e.is_serialization_conflict() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    counters::transaction_retry();
                    self.sink().warn(
                        "serialization conflict, retrying transaction",
                        &LogFields::new()
                            .with("attempt", attempt)
                            .with("max_attempts", policy.max_attempts)
                            .with("delay_ms", delay.as_millis() as u64)
                            .with("error", e.to_string()),
                    );
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
