//! Bounded connection pool
//!
//! A [`Pool`] owns up to `max_size` physical connections. Each one is either
//! idle (owned by the pool) or checked out (owned by exactly one
//! [`PooledConnection`] guard). Dropping the guard returns the connection;
//! broken or expired connections are closed instead of re-pooled.
//!
//! A `tokio::sync::Semaphore` bounds checkouts. A single `std::sync::Mutex`
//! guards the idle list and the counters and is never held across `.await`.

mod manager;

pub use manager::{ManageConnection, PgConnectionManager};

use crate::config::PoolConfig;
use crate::context::{Context, Interrupted};
use crate::metrics::{counters, histograms, labels};
use crate::protocol::BackendMessage;
use crate::resolve::ConnectionDescriptor;
use crate::sink::{LogFields, LogSink, TracingSink};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle and checked out
    pub size: usize,
    /// Idle connections
    pub idle: usize,
    /// Checked-out connections
    pub in_use: usize,
    /// Configured maximum
    pub max_size: usize,
}

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    /// Idle + checked out + being created
    total: usize,
    checked_out: usize,
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    sink: Arc<dyn LogSink>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<M::Connection>>,
    closed: AtomicBool,
    released: Notify,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Pool handle; cheap to clone
pub struct Pool<M: ManageConnection = PgConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pool construction options
pub struct PoolBuilder {
    config: PoolConfig,
    sink: Arc<dyn LogSink>,
}

impl PoolBuilder {
    /// Builder with the given config and a [`TracingSink`]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Route pool, executor and transaction logs to `sink`
    pub fn sink(mut self, sink: impl LogSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Route logs to a shared sink
    pub fn shared_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Create the pool: open `min_size` connections, probe one, start maintenance
    ///
    /// Fails with [`Error::Connectivity`] if any of that fails; nothing is
    /// left open in that case.
    pub async fn build<M: ManageConnection>(self, manager: M) -> Result<Pool<M>> {
        self.config.validate()?;

        let shared = Arc::new(Shared {
            semaphore: Arc::new(Semaphore::new(self.config.max_size)),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(self.config.max_size),
                total: 0,
                checked_out: 0,
            }),
            closed: AtomicBool::new(false),
            released: Notify::new(),
            maintenance: Mutex::new(None),
            manager,
            config: self.config,
            sink: self.sink,
        });

        let mut opened = Vec::new();
        let wanted = shared.config.min_size.max(1);
        let mut failure = None;

        for _ in 0..wanted {
            match shared.open_connection().await {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_none() {
            if let Some((conn, _)) = opened.first_mut() {
                let probe = shared.manager.is_valid(conn);
                failure = match tokio::time::timeout(shared.config.connect_timeout, probe).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(timed_out("liveness probe")),
                };
            }
        }

        if let Some(e) = failure {
            for (conn, _) in opened {
                shared.manager.close(conn).await;
            }
            shared.closed.store(true, Ordering::Release);
            shared.sink.error(
                "failed to initialise connection pool",
                &LogFields::new().with("error", e.to_string()),
            );
            return Err(Error::Connectivity(Box::new(e)));
        }

        {
            let mut state = shared.lock();
            let now = Instant::now();
            for (conn, created_at) in opened {
                state.total += 1;
                state.idle.push_back(IdleConn {
                    conn,
                    created_at,
                    idle_since: now,
                });
            }
        }

        let handle = tokio::spawn(maintenance_loop(
            Arc::downgrade(&shared),
            shared.config.health_check_interval,
        ));
        *shared
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Pool { shared })
    }

    /// Build a pool of Postgres-wire connections and log the server version
    pub async fn connect(self, descriptor: ConnectionDescriptor) -> Result<Pool> {
        let pool = self.build(PgConnectionManager::new(descriptor)).await?;

        let ctx = Context::with_timeout(pool.shared.config.connect_timeout);
        match server_version(&pool, &ctx).await {
            Ok(version) => {
                let config = &pool.shared.config;
                pool.shared.sink.info(
                    "connected to database",
                    &LogFields::new()
                        .with("version", version)
                        .with("max_conns", config.max_size)
                        .with("min_conns", config.min_size),
                );
                Ok(pool)
            }
            Err(e) => {
                pool.shared.sink.error(
                    "failed to query server version",
                    &LogFields::new().with("error", e.to_string()),
                );
                pool.shutdown(Duration::ZERO).await;
                Err(Error::Connectivity(Box::new(e)))
            }
        }
    }
}

async fn server_version(pool: &Pool, ctx: &Context) -> Result<String> {
    let mut conn = pool.acquire(ctx).await?;
    let messages = match ctx.run(conn.simple_query("SELECT version()")).await {
        Ok(result) => result?,
        Err(interrupted) => {
            conn.discard();
            return Err(interrupted.into());
        }
    };
    messages
        .into_iter()
        .find_map(|msg| match msg {
            BackendMessage::DataRow(mut values) if !values.is_empty() => values.swap_remove(0),
            _ => None,
        })
        .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        .ok_or_else(|| Error::Protocol("SELECT version() returned no row".into()))
}

impl Pool {
    /// Connect with a [`TracingSink`]: build the pool, probe it, log the server version
    pub async fn connect(descriptor: ConnectionDescriptor, config: PoolConfig) -> Result<Pool> {
        PoolBuilder::new(config).connect(descriptor).await
    }

    /// Builder for a pool with a custom sink
    ///
    /// Pools over another [`ManageConnection`] start from [`PoolBuilder::new`]
    /// and pass the manager to [`PoolBuilder::build`].
    pub fn builder(config: PoolConfig) -> PoolBuilder {
        PoolBuilder::new(config)
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Check out a connection
    ///
    /// Waits for a free slot until the context fires: a deadline yields
    /// [`Error::AcquireTimeout`], cancellation [`Error::Cancelled`]. Idle
    /// connections past their lifetime or idle time are retired on the way.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let start = Instant::now();
        let permit = match ctx.run(shared.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(Interrupted::Deadline) => {
                counters::acquire_timeout();
                return Err(Error::AcquireTimeout {
                    waited: start.elapsed(),
                });
            }
            Err(Interrupted::Cancelled) => return Err(Error::Cancelled),
        };
        histograms::acquire_wait(start.elapsed().as_millis() as u64);

        loop {
            let candidate = {
                let mut state = shared.lock();
                let candidate = state.idle.pop_back();
                if candidate.is_none() {
                    state.total += 1;
                }
                candidate
            };

            match candidate {
                Some(idle) => {
                    if let Some(reason) = shared.expiry(&idle) {
                        shared.retire(idle.conn, reason);
                        continue;
                    }
                    return Ok(shared.check_out(idle.conn, idle.created_at, permit));
                }
                None => {
                    let reservation = Reservation {
                        shared: shared.as_ref(),
                        committed: false,
                    };
                    return match ctx.run(shared.open_connection()).await {
                        Ok(Ok((conn, created_at))) => {
                            reservation.commit();
                            Ok(shared.check_out(conn, created_at, permit))
                        }
                        Ok(Err(e)) => Err(e),
                        Err(Interrupted::Deadline) => {
                            counters::acquire_timeout();
                            Err(Error::AcquireTimeout {
                                waited: start.elapsed(),
                            })
                        }
                        Err(Interrupted::Cancelled) => Err(Error::Cancelled),
                    };
                }
            }
        }
    }

    /// Return a connection to the pool (same as dropping it)
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Acquire a connection and run the manager's liveness probe on it
    pub async fn health_check(&self, ctx: &Context) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let probe = self.shared.manager.is_valid(&mut conn);
        match ctx.run(probe).await {
            Ok(result) => result,
            Err(interrupted) => {
                conn.broken = true;
                Err(interrupted.into())
            }
        }
    }

    /// Occupancy snapshot
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            size: state.total,
            idle: state.idle.len(),
            in_use: state.checked_out,
            max_size: self.shared.config.max_size,
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Whether shutdown has begun
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn sink(&self) -> &Arc<dyn LogSink> {
        &self.shared.sink
    }

    /// Shut down with the configured grace period
    pub async fn close(&self) {
        self.shutdown(self.shared.config.shutdown_grace).await
    }

    /// Stop handing out connections and close everything
    ///
    /// New `acquire` calls fail with [`Error::PoolClosed`] immediately. Waits
    /// up to `grace` for checked-out connections to come back, then closes
    /// the idle ones. Connections released after the grace period are closed
    /// on release.
    pub async fn shutdown(&self, grace: Duration) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.semaphore.close();
        let maintenance = shared
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = maintenance {
            // A pass cut short hands its connection and reservation back on drop
            handle.abort();
            let _ = handle.await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let released = shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let in_use = shared.lock().checked_out;
            if in_use == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                shared.sink.warn(
                    "shutdown grace period elapsed with connections still checked out",
                    &LogFields::new().with("in_use", in_use),
                );
                break;
            }
        }

        let idle: Vec<IdleConn<M::Connection>> = {
            let mut state = shared.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };
        let closed = idle.len();
        for entry in idle {
            counters::connection_retired(labels::RETIRE_SHUTDOWN);
            shared.manager.close(entry.conn).await;
        }

        shared.sink.info(
            "connection pool closed",
            &LogFields::new().with("closed_idle", closed),
        );
    }
}

impl<M: ManageConnection> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_connection(&self) -> Result<(M::Connection, Instant)> {
        match tokio::time::timeout(self.config.connect_timeout, self.manager.connect()).await {
            Ok(Ok(conn)) => {
                counters::connection_created();
                Ok((conn, Instant::now()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out("connect")),
        }
    }

    fn expiry(&self, idle: &IdleConn<M::Connection>) -> Option<&'static str> {
        if idle.created_at.elapsed() >= self.config.max_lifetime {
            Some(labels::RETIRE_LIFETIME)
        } else if idle.idle_since.elapsed() >= self.config.max_idle_time {
            Some(labels::RETIRE_IDLE)
        } else {
            None
        }
    }

    fn check_out(
        self: &Arc<Self>,
        conn: M::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<M> {
        self.lock().checked_out += 1;
        PooledConnection {
            conn: Some(conn),
            created_at,
            broken: false,
            shared: self.clone(),
            _permit: permit,
        }
    }

    /// Drop a connection from the accounting and close it in the background
    fn retire(self: &Arc<Self>, conn: M::Connection, reason: &'static str) {
        self.lock().total -= 1;
        self.dispose(conn, reason);
    }

    fn dispose(self: &Arc<Self>, conn: M::Connection, reason: &'static str) {
        counters::connection_retired(reason);
        tracing::debug!(reason, "retiring connection");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.clone();
                handle.spawn(async move { shared.manager.close(conn).await });
            }
            Err(_) => drop(conn),
        }
    }

    fn put_back(self: &Arc<Self>, mut conn: M::Connection, created_at: Instant, broken: bool) {
        let reason = if self.closed.load(Ordering::Acquire) {
            Some(labels::RETIRE_SHUTDOWN)
        } else if broken || self.manager.has_broken(&mut conn) {
            Some(labels::RETIRE_BROKEN)
        } else if created_at.elapsed() >= self.config.max_lifetime {
            Some(labels::RETIRE_LIFETIME)
        } else {
            None
        };

        let retired = {
            let mut state = self.lock();
            state.checked_out -= 1;
            match reason {
                Some(reason) => {
                    state.total -= 1;
                    Some((conn, reason))
                }
                None => {
                    state.idle.push_back(IdleConn {
                        conn,
                        created_at,
                        idle_since: Instant::now(),
                    });
                    None
                }
            }
        };

        if let Some((conn, reason)) = retired {
            self.dispose(conn, reason);
        }
        self.released.notify_waiters();
    }

    /// One maintenance pass: expire, probe, replenish
    async fn maintain(self: &Arc<Self>) {
        let pending = self.lock().idle.len();

        for _ in 0..pending {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            // Holding a permit keeps the probed connection inside max_size
            let _permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let next = { self.lock().idle.pop_front() };
            let Some(idle) = next else {
                break;
            };

            if let Some(reason) = self.expiry(&idle) {
                self.retire(idle.conn, reason);
                continue;
            }

            let mut held = HealthCheck {
                shared: self,
                idle: Some(idle),
            };
            let check = self.manager.is_valid(held.conn());
            let outcome = match tokio::time::timeout(self.config.connect_timeout, check).await {
                Ok(result) => result,
                Err(_) => Err(timed_out("liveness probe")),
            };
            match outcome {
                Ok(()) => held.restore(),
                Err(e) => {
                    self.sink.warn(
                        "idle connection failed health check",
                        &LogFields::new().with("error", e.to_string()),
                    );
                    held.retire(labels::RETIRE_BROKEN);
                }
            }
        }

        self.replenish().await;
    }

    async fn replenish(self: &Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let _permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            {
                let mut state = self.lock();
                if state.total >= self.config.min_size {
                    return;
                }
                state.total += 1;
            }
            let reservation = Reservation {
                shared: self.as_ref(),
                committed: false,
            };

            match self.open_connection().await {
                Ok((conn, created_at)) => {
                    self.lock().idle.push_back(IdleConn {
                        conn,
                        created_at,
                        idle_since: Instant::now(),
                    });
                    reservation.commit();
                }
                Err(e) => {
                    drop(reservation);
                    self.sink.error(
                        "failed to replenish connection pool",
                        &LogFields::new().with("error", e.to_string()),
                    );
                    return;
                }
            }
        }
    }
}

async fn maintenance_loop<M: ManageConnection>(pool: Weak<Shared<M>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = pool.upgrade() else {
            return;
        };
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        shared.maintain().await;
    }
}

fn timed_out(what: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out", what),
    ))
}

/// Undoes a `total` reservation unless the new connection made it into the pool
struct Reservation<'a, M: ManageConnection> {
    shared: &'a Shared<M>,
    committed: bool,
}

impl<M: ManageConnection> Reservation<'_, M> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<M: ManageConnection> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.lock().total -= 1;
        }
    }
}

/// Idle connection taken out for a health check
///
/// Dropped without [`restore`](HealthCheck::restore) or [`retire`](HealthCheck::retire),
/// as when shutdown aborts maintenance mid-check, the connection is retired.
struct HealthCheck<'a, M: ManageConnection> {
    shared: &'a Arc<Shared<M>>,
    idle: Option<IdleConn<M::Connection>>,
}

impl<M: ManageConnection> HealthCheck<'_, M> {
    fn conn(&mut self) -> &mut M::Connection {
        &mut self
            .idle
            .as_mut()
            .expect("checked connection is present until restored or retired")
            .conn
    }

    fn restore(mut self) {
        if let Some(idle) = self.idle.take() {
            self.shared.lock().idle.push_back(idle);
        }
    }

    fn retire(mut self, reason: &'static str) {
        if let Some(idle) = self.idle.take() {
            self.shared.retire(idle.conn, reason);
        }
    }
}

impl<M: ManageConnection> Drop for HealthCheck<'_, M> {
    fn drop(&mut self) {
        if let Some(idle) = self.idle.take() {
            self.shared.retire(idle.conn, labels::RETIRE_SHUTDOWN);
        }
    }
}

/// A connection checked out of a [`Pool`]
///
/// Dereferences to the underlying connection. Dropping it returns the
/// connection to the pool, or closes it if it is broken, expired, or the
/// pool has shut down.
pub struct PooledConnection<M: ManageConnection = PgConnectionManager> {
    conn: Option<M::Connection>,
    created_at: Instant,
    broken: bool,
    shared: Arc<Shared<M>>,
    // Released after the connection is back in the pool
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// When the physical connection was opened
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Close the connection on release instead of re-pooling it
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection is only taken when the guard drops")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection is only taken when the guard drops")
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.put_back(conn, self.created_at, self.broken);
        }
    }
}
