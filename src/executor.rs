//! Single statements outside a transaction
//!
//! Each call acquires one connection for its own duration and runs the
//! statement exactly once through the extended protocol, with positional
//! (`$1`, `$2`, ...) parameters. There is no implicit retry.

use crate::connection::{rows_affected, Response};
use crate::context::Context;
use crate::metrics::{counters, histograms, labels};
use crate::pool::{PgConnectionManager, Pool};
use crate::sink::{LogFields, LogSink};
use crate::types::{ExecutionResult, Row, RowCursor, Value};
use crate::{Error, Result};
use std::time::Instant;

/// Strings longer than this many characters are masked in logs
pub const MASK_THRESHOLD: usize = 8;

/// Characters of a masked string kept in logs
const MASK_PREFIX: usize = 3;

/// Render parameters for logging
///
/// A string longer than [`MASK_THRESHOLD`] characters is shortened to its
/// first three characters followed by `***`; byte strings are reduced to
/// their length. This keeps most credentials and personal data out of logs
/// while leaving enough to debug with. It is a heuristic, not redaction: a
/// short secret is logged verbatim.
pub fn mask_params(params: &[Value]) -> Vec<String> {
    params.iter().map(mask_value).collect()
}

fn mask_value(value: &Value) -> String {
    match value {
        Value::Text(s) if s.chars().count() > MASK_THRESHOLD => {
            let prefix: String = s.chars().take(MASK_PREFIX).collect();
            format!("{}***", prefix)
        }
        Value::Text(s) => format!("{:?}", s),
        Value::Bytes(b) => format!("<{} bytes>", b.len()),
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Numeric(v) => v.clone(),
    }
}

/// Structured fields for a statement log line
pub(crate) fn statement_fields(sql: &str, params: &[Value]) -> LogFields {
    LogFields::new()
        .with("query", sql)
        .with("params", format!("[{}]", mask_params(params).join(", ")))
}

pub(crate) fn record_outcome(
    sink: &dyn LogSink,
    sql: &str,
    started: Instant,
    error: Option<&Error>,
) {
    histograms::statement_duration(started.elapsed().as_millis() as u64);
    match error {
        None => counters::statement_completed(labels::OUTCOME_OK),
        Some(e) => {
            counters::statement_completed(labels::OUTCOME_ERROR);
            let mut fields = LogFields::new()
                .with("query", sql)
                .with("error", e.to_string());
            if let Some(code) = e.code() {
                fields.insert("sqlstate", code.as_str());
            }
            sink.error("statement failed", &fields);
        }
    }
}

impl Pool<PgConnectionManager> {
    /// Run one statement on a pooled connection
    ///
    /// For a statement without a result set the connection is released
    /// before this returns. For [`ExecutionResult::Rows`] the cursor owns the
    /// connection until it is exhausted, closed or dropped.
    pub async fn execute(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<ExecutionResult<'static>> {
        self.sink()
            .info("Executing SQL Query", &statement_fields(sql, params));

        let mut conn = self.acquire(ctx).await?;
        let started = Instant::now();

        let outcome = match ctx.run(conn.query_portal(sql, params)).await {
            Ok(result) => result,
            Err(interrupted) => {
                conn.mark_broken();
                Err(interrupted.into())
            }
        };

        record_outcome(&**self.sink(), sql, started, outcome.as_ref().err());

        match outcome? {
            Response::Rows(columns) => Ok(ExecutionResult::Rows(RowCursor::pooled(conn, columns))),
            Response::Complete { tag } => Ok(ExecutionResult::RowCount(rows_affected(&tag))),
        }
    }

    /// Run a query and collect every row
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.execute(ctx, sql, params).await?.rows(ctx).await
    }

    /// Run a query expected to return at most one row
    pub async fn query_opt(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Row>> {
        let rows = self.query(ctx, sql, params).await?;
        match rows.len() {
            0 | 1 => Ok(rows.into_iter().next()),
            n => Err(Error::Column(format!("expected at most one row, got {}", n))),
        }
    }

    /// Run a query expected to return exactly one row
    pub async fn query_one(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Row> {
        self.query_opt(ctx, sql, params)
            .await?
            .ok_or_else(|| Error::Column("query returned no rows".into()))
    }

    /// Run a statement and return the number of rows it affected
    pub async fn execute_count(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        self.execute(ctx, sql, params).await?.row_count(ctx).await
    }
}
