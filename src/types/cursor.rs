//! Streaming access to a statement's result set

use super::row::{Column, Row};
use super::value::Value;
use crate::connection::{rows_affected, Connection};
use crate::context::Context;
use crate::pool::{PgConnectionManager, PooledConnection};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;

enum Source<'c> {
    /// The cursor owns the checkout; the connection goes back to the pool when the rows run out
    Pooled(PooledConnection<PgConnectionManager>),
    /// Rows read from a connection owned by a transaction
    Borrowed(&'c mut Connection),
}

impl Source<'_> {
    fn conn(&mut self) -> &mut Connection {
        match self {
            Source::Pooled(conn) => &mut **conn,
            Source::Borrowed(conn) => &mut **conn,
        }
    }
}

/// Lazily read rows of a single statement
///
/// Rows are pulled from the connection one at a time. A cursor backed by a
/// pooled connection releases it as soon as the last row has been read;
/// dropping the cursor early closes that connection instead of re-pooling it,
/// since unread rows are still in flight.
pub struct RowCursor<'c> {
    source: Option<Source<'c>>,
    columns: Arc<[Column]>,
    tag: Option<String>,
}

impl<'c> RowCursor<'c> {
    pub(crate) fn pooled(
        conn: PooledConnection<PgConnectionManager>,
        columns: Arc<[Column]>,
    ) -> RowCursor<'static> {
        RowCursor {
            source: Some(Source::Pooled(conn)),
            columns,
            tag: None,
        }
    }

    pub(crate) fn borrowed(conn: &'c mut Connection, columns: Arc<[Column]>) -> Self {
        RowCursor {
            source: Some(Source::Borrowed(conn)),
            columns,
            tag: None,
        }
    }

    /// Column metadata
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Command tag, once every row has been read
    pub fn command_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Whether every row has been read
    pub fn is_done(&self) -> bool {
        self.source.is_none()
    }

    /// Next row, or `None` once the result set is exhausted
    ///
    /// If the context fires mid-read the connection is marked broken and the
    /// cursor is finished.
    pub async fn next(&mut self, ctx: &Context) -> Result<Option<Row>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };

        let outcome = ctx.run(source.conn().next_data_row()).await;
        match outcome {
            Ok(Ok(Some(raw))) => match decode_row(&self.columns, raw) {
                Ok(row) => Ok(Some(row)),
                Err(e) => {
                    self.finish();
                    Err(e)
                }
            },
            Ok(Ok(None)) => {
                self.tag = source.conn().last_command_tag().map(str::to_string);
                self.finish();
                Ok(None)
            }
            Ok(Err(e)) => {
                self.finish();
                Err(e)
            }
            Err(interrupted) => {
                source.conn().mark_broken();
                self.finish();
                Err(interrupted.into())
            }
        }
    }

    /// Read every remaining row
    pub async fn all(mut self, ctx: &Context) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next(ctx).await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Discard the remaining rows and return the command tag
    pub async fn close(mut self, ctx: &Context) -> Result<Option<String>> {
        while self.next(ctx).await?.is_some() {}
        Ok(self.tag.take())
    }

    /// Rows affected according to the command tag (0 until the cursor is done)
    pub fn rows_affected(&self) -> u64 {
        self.tag.as_deref().map(rows_affected).unwrap_or(0)
    }

    fn finish(&mut self) {
        self.source = None;
    }
}

impl std::fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("columns", &self.columns.len())
            .field("done", &self.is_done())
            .field("tag", &self.tag)
            .finish()
    }
}

fn decode_row(columns: &Arc<[Column]>, raw: Vec<Option<Bytes>>) -> Result<Row> {
    if raw.len() != columns.len() {
        return Err(Error::Protocol(format!(
            "data row has {} values for {} columns",
            raw.len(),
            columns.len()
        )));
    }
    let values = columns
        .iter()
        .zip(&raw)
        .map(|(column, value)| Value::from_text(column.type_oid, value.as_deref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns.clone(), values))
}

/// Result of [`Pool::execute`](crate::Pool::execute) and
/// [`Transaction::execute`](crate::Transaction::execute)
#[derive(Debug)]
pub enum ExecutionResult<'c> {
    /// The statement returns rows
    Rows(RowCursor<'c>),
    /// The statement finished; number of rows it affected
    RowCount(u64),
}

impl<'c> ExecutionResult<'c> {
    /// Collect rows, or an empty vec for a statement without a result set
    pub async fn rows(self, ctx: &Context) -> Result<Vec<Row>> {
        match self {
            ExecutionResult::Rows(cursor) => cursor.all(ctx).await,
            ExecutionResult::RowCount(_) => Ok(Vec::new()),
        }
    }

    /// Rows affected; drains a pending result set first
    pub async fn row_count(self, ctx: &Context) -> Result<u64> {
        match self {
            ExecutionResult::Rows(cursor) => {
                let tag = cursor.close(ctx).await?;
                Ok(tag.as_deref().map(rows_affected).unwrap_or(0))
            }
            ExecutionResult::RowCount(n) => Ok(n),
        }
    }
}
