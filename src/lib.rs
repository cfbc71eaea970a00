//! ysql-pool: a pooled, TLS-secured client layer for distributed SQL databases
//! that speak the Postgres v3 wire protocol (YugabyteDB YSQL, vanilla Postgres).
//!
//! The crate is organised around four pieces:
//!
//! * [`resolve`] turns raw [`ConnectionParams`] into an immutable
//!   [`ConnectionDescriptor`]: the host is pinned to an IPv4 address while the
//!   original name stays the TLS server name.
//! * [`pool`] owns a bounded set of physical connections with acquire/release
//!   discipline, background maintenance and a shutdown drain.
//! * [`executor`] runs single statements on pool-acquired connections, with
//!   masked parameter logging.
//! * [`transaction`] implements the Begin/Execute/Commit/Rollback state
//!   machine and the serialization-conflict retry helper.
//!
//! ```no_run
//! # async fn example() -> ysql_pool::Result<()> {
//! use ysql_pool::{resolve, Context, Pool, PoolConfig, Settings, Value};
//!
//! let settings = Settings::from_env()?;
//! let descriptor = resolve(&settings.connection).await?;
//! let pool = Pool::connect(descriptor, settings.pool).await?;
//!
//! let ctx = Context::with_timeout(std::time::Duration::from_secs(5));
//! let rows = pool
//!     .query(&ctx, "SELECT name, balance FROM DemoAccount WHERE country = $1", &[Value::from("USA")])
//!     .await?;
//! for row in rows {
//!     let name: String = row.get("name")?;
//!     let balance: i64 = row.get("balance")?;
//!     println!("{name}: {balance}");
//! }
//!
//! pool.shutdown(std::time::Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod resolve;
pub mod sink;
pub mod transaction;
pub mod types;

pub use config::{CertSource, ConnectionParams, PoolConfig, Settings};
pub use context::{CancelHandle, Context};
pub use error::{DbError, Error, ResolutionError, Result, SqlState};
pub use pool::{ManageConnection, PgConnectionManager, Pool, PoolBuilder, PoolStatus, PooledConnection};
pub use resolve::{resolve, ConnectionDescriptor};
pub use sink::{FieldValue, LogFields, LogSink, MemorySink, TracingSink};
pub use transaction::{IsolationLevel, RetryPolicy, Transaction, TransactionOptions, TxState};
pub use types::{Column, ExecutionResult, FromValue, Row, RowCursor, Value};
