//! Connection factory seam between the pool and the database

use crate::connection::{Connection, ConnectionState, TransactionStatus};
use crate::resolve::ConnectionDescriptor;
use crate::Result;
use std::future::Future;

/// Creates, probes and disposes of the connections a [`Pool`](super::Pool) manages
pub trait ManageConnection: Send + Sync + 'static {
    /// Connection type
    type Connection: Send + 'static;

    /// Open a new connection
    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Liveness probe for an idle connection
    fn is_valid(&self, conn: &mut Self::Connection) -> impl Future<Output = Result<()>> + Send;

    /// Synchronous check on release: a broken connection is closed instead of re-pooled
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;

    /// Dispose of a connection
    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send {
        async move { drop(conn) }
    }
}

/// [`ManageConnection`] for TLS Postgres-wire connections
#[derive(Debug, Clone)]
pub struct PgConnectionManager {
    descriptor: ConnectionDescriptor,
}

impl PgConnectionManager {
    /// Manager dialing the given descriptor
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self { descriptor }
    }

    /// The descriptor connections are opened with
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }
}

impl ManageConnection for PgConnectionManager {
    type Connection = Connection;

    fn connect(&self) -> impl Future<Output = Result<Connection>> + Send {
        Connection::connect(&self.descriptor)
    }

    fn is_valid(&self, conn: &mut Connection) -> impl Future<Output = Result<()>> + Send {
        async move {
            conn.simple_query("SELECT 1").await?;
            Ok(())
        }
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        conn.is_broken()
            || conn.state() != ConnectionState::Idle
            || conn.transaction_status() != TransactionStatus::Idle
    }

    fn close(&self, conn: Connection) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "error while closing connection");
            }
        }
    }
}
