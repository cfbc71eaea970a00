//! Transaction lifecycle tests against a scripted TLS server
//!
//! A small in-process server speaks just enough of the Postgres v3 protocol
//! (SSLRequest, trust startup, simple and extended query) to drive the real
//! connection, pool and transaction code without a database.
//!
//! Run with: cargo test --test transaction_tests -- --nocapture

use bytes::{BufMut, BytesMut};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use ysql_pool::{
    resolve, CertSource, ConnectionParams, Context, Error, Pool, PoolConfig, RetryPolicy,
    SqlState, TxState, Value,
};

const ROOT_PEM: &[u8] = include_bytes!("fixtures/root.crt");
const SERVER_CERT: &[u8] = include_bytes!("fixtures/server.crt");
const SERVER_KEY: &[u8] = include_bytes!("fixtures/server.key");

/// How the server answers, and what it has seen
#[derive(Default)]
struct Script {
    /// COMMITs still to fail with SQLSTATE 40001
    commit_conflicts: AtomicUsize,
    /// Fail COMMIT but keep the transaction block open
    commit_error_in_block: AtomicBool,
    /// Every simple query and parsed statement, in arrival order
    log: Mutex<Vec<String>>,
}

impl Script {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, sql: &str) -> usize {
        self.log().iter().filter(|s| s.starts_with(sql)).count()
    }
}

fn acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut &SERVER_CERT[..])
        .collect::<Result<Vec<_>, _>>()
        .expect("server certificate");
    let key = rustls_pemfile::private_key(&mut &SERVER_KEY[..])
        .expect("server key")
        .expect("a private key in the PEM");
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("server TLS config");
    TlsAcceptor::from(Arc::new(config))
}

fn frame(out: &mut BytesMut, tag: u8, body: &[u8]) {
    out.put_u8(tag);
    out.put_i32(body.len() as i32 + 4);
    out.put_slice(body);
}

fn cstr(body: &mut Vec<u8>, s: &str) {
    body.extend_from_slice(s.as_bytes());
    body.push(0);
}

fn command_complete(out: &mut BytesMut, tag: &str) {
    let mut body = Vec::new();
    cstr(&mut body, tag);
    frame(out, b'C', &body);
}

fn error_response(out: &mut BytesMut, code: &str, message: &str) {
    let mut body = Vec::new();
    body.push(b'S');
    cstr(&mut body, "ERROR");
    body.push(b'C');
    cstr(&mut body, code);
    body.push(b'M');
    cstr(&mut body, message);
    body.push(0);
    frame(out, b'E', &body);
}

/// One text column, one row
fn single_row(out: &mut BytesMut, column: &str, value: &str) {
    let mut desc = Vec::new();
    desc.extend_from_slice(&1i16.to_be_bytes());
    cstr(&mut desc, column);
    desc.extend_from_slice(&0i32.to_be_bytes()); // table oid
    desc.extend_from_slice(&0i16.to_be_bytes()); // attribute number
    desc.extend_from_slice(&25i32.to_be_bytes()); // text
    desc.extend_from_slice(&(-1i16).to_be_bytes());
    desc.extend_from_slice(&(-1i32).to_be_bytes());
    desc.extend_from_slice(&0i16.to_be_bytes());
    frame(out, b'T', &desc);

    let mut row = Vec::new();
    row.extend_from_slice(&1i16.to_be_bytes());
    row.extend_from_slice(&(value.len() as i32).to_be_bytes());
    row.extend_from_slice(value.as_bytes());
    frame(out, b'D', &row);
}

fn ready(out: &mut BytesMut, status: u8) {
    frame(out, b'Z', &[status]);
}

async fn read_body<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let len = stream.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

fn leading_cstr(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

async fn serve<S>(mut stream: S, script: Arc<Script>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Startup packet, then trust authentication
    read_body(&mut stream).await?;
    let mut out = BytesMut::new();
    frame(&mut out, b'R', &0i32.to_be_bytes());
    let mut status = Vec::new();
    cstr(&mut status, "server_version");
    cstr(&mut status, "11.2-YB-scripted");
    frame(&mut out, b'S', &status);
    let mut key = Vec::new();
    key.extend_from_slice(&4242i32.to_be_bytes());
    key.extend_from_slice(&7i32.to_be_bytes());
    frame(&mut out, b'K', &key);
    ready(&mut out, b'I');
    stream.write_all(&out).await?;

    let mut tx = b'I';
    let mut statement = String::new();

    loop {
        let tag = match stream.read_u8().await {
            Ok(tag) => tag,
            Err(_) => return Ok(()),
        };
        let body = read_body(&mut stream).await?;
        let mut out = BytesMut::new();

        match tag {
            b'Q' => {
                let sql = leading_cstr(&body);
                script.log.lock().unwrap().push(sql.clone());
                if sql == "SELECT version()" || sql == "SELECT 1" {
                    single_row(&mut out, "version", "PostgreSQL 11.2-YB-scripted");
                    command_complete(&mut out, "SELECT 1");
                } else if sql.starts_with("BEGIN") {
                    tx = b'T';
                    command_complete(&mut out, "BEGIN");
                } else if sql == "COMMIT" {
                    let conflicts = script.commit_conflicts.load(Ordering::SeqCst);
                    if conflicts > 0 {
                        script.commit_conflicts.store(conflicts - 1, Ordering::SeqCst);
                        error_response(&mut out, "40001", "could not serialize access");
                        tx = b'I';
                    } else if script.commit_error_in_block.load(Ordering::SeqCst) {
                        error_response(&mut out, "XX000", "commit could not be applied");
                        tx = b'E';
                    } else if tx == b'E' {
                        command_complete(&mut out, "ROLLBACK");
                        tx = b'I';
                    } else {
                        command_complete(&mut out, "COMMIT");
                        tx = b'I';
                    }
                } else if sql == "ROLLBACK" {
                    command_complete(&mut out, "ROLLBACK");
                    tx = b'I';
                } else {
                    command_complete(&mut out, "SELECT 0");
                }
                ready(&mut out, tx);
            }
            b'P' => {
                // Unnamed statement name, then the query text
                let name_end = body.iter().position(|&b| b == 0).unwrap_or(0);
                statement = leading_cstr(&body[name_end + 1..]);
                script.log.lock().unwrap().push(statement.clone());
            }
            b'B' | b'D' | b'E' => {}
            b'S' => {
                frame(&mut out, b'1', &[]);
                frame(&mut out, b'2', &[]);
                if statement.contains("duplicate") {
                    error_response(&mut out, "23505", "duplicate key value");
                    if tx == b'T' {
                        tx = b'E';
                    }
                } else {
                    frame(&mut out, b'n', &[]);
                    command_complete(&mut out, "UPDATE 1");
                }
                ready(&mut out, tx);
            }
            b'X' => return Ok(()),
            _ => {}
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
            stream.flush().await?;
        }
    }
}

/// Start a scripted server and a one-connection pool against it
async fn scripted_pool() -> (Pool, Arc<Script>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let script = Arc::new(Script::default());
    let acceptor = acceptor();

    {
        let script = script.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut tcp, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let mut ssl_request = [0u8; 8];
                    tcp.read_exact(&mut ssl_request).await?;
                    tcp.write_all(b"S").await?;
                    let tls = acceptor.accept(tcp).await?;
                    serve(tls, script).await
                });
            }
        });
    }

    let params = ConnectionParams::new("127.0.0.1", "yugabyte", "yugabyte")
        .port(port.to_string())
        .root_cert(CertSource::Pem(ROOT_PEM.to_vec()))
        .connect_timeout(Duration::from_secs(5));
    let descriptor = resolve(&params).await.expect("resolve");
    let pool = Pool::connect(
        descriptor,
        PoolConfig::new()
            .max_size(1)
            .min_size(1)
            .health_check_interval(Duration::from_secs(3600)),
    )
    .await
    .expect("pool connects to the scripted server");
    (pool, script)
}

fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(5))
}

fn debit() -> [Value; 2] {
    [Value::from(800), Value::from(1)]
}

const DEBIT: &str = "UPDATE DemoAccount SET balance = balance - $1 WHERE id = $2";

#[tokio::test]
async fn test_execute_after_commit_is_rejected() {
    let (pool, script) = scripted_pool().await;
    let ctx = ctx();

    let mut tx = pool.begin(&ctx).await.unwrap();
    assert_eq!(tx.execute_count(&ctx, DEBIT, &debit()).await.unwrap(), 1);
    tx.commit(&ctx).await.unwrap();
    assert_eq!(tx.state(), TxState::Committed);

    let err = tx.execute(&ctx, "SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::TransactionClosed {
            state: TxState::Committed
        }
    ));
    assert!(matches!(
        tx.commit(&ctx).await.unwrap_err(),
        Error::TransactionClosed { .. }
    ));

    tx.rollback(&ctx).await.expect("rollback after commit");
    tx.rollback(&ctx).await.expect("second rollback");
    assert_eq!(script.count("ROLLBACK"), 0);

    let status = pool.status();
    assert_eq!((status.in_use, status.idle), (0, 1));
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_rollback_twice_sends_one_rollback() {
    let (pool, script) = scripted_pool().await;
    let ctx = ctx();

    let mut tx = pool.begin(&ctx).await.unwrap();
    tx.rollback(&ctx).await.unwrap();
    tx.rollback(&ctx).await.unwrap();

    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(script.count("ROLLBACK"), 1);
    assert_eq!(pool.status().idle, 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_commit_conflict_releases_connection() {
    let (pool, script) = scripted_pool().await;
    script.commit_conflicts.store(1, Ordering::SeqCst);
    let ctx = ctx();

    let mut tx = pool.begin(&ctx).await.unwrap();
    tx.execute_count(&ctx, DEBIT, &debit()).await.unwrap();
    let err = tx.commit(&ctx).await.unwrap_err();

    assert!(err.is_serialization_conflict(), "got {err:?}");
    assert_eq!(err.code(), Some(&SqlState::SERIALIZATION_FAILURE));
    assert_eq!(tx.state(), TxState::CommitFailed);
    tx.rollback(&ctx).await.expect("rollback after failed commit is a no-op");

    // The server ended the transaction, so the connection is reused as is
    let status = pool.status();
    assert_eq!((status.size, status.in_use, status.idle), (1, 0, 1));
    assert_eq!(script.count("ROLLBACK"), 0);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_commit_failure_in_open_block_rolls_back_before_release() {
    let (pool, script) = scripted_pool().await;
    script.commit_error_in_block.store(true, Ordering::SeqCst);
    let ctx = ctx();

    let mut tx = pool.begin(&ctx).await.unwrap();
    let err = tx.commit(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Db(_)), "got {err:?}");
    assert_eq!(tx.state(), TxState::CommitFailed);

    let log = script.log();
    assert_eq!(&log[log.len() - 2..], ["COMMIT", "ROLLBACK"]);
    let status = pool.status();
    assert_eq!((status.in_use, status.idle), (0, 1));
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_statement_error_keeps_transaction_open() {
    let (pool, _script) = scripted_pool().await;
    let ctx = ctx();

    let mut tx = pool.begin(&ctx).await.unwrap();
    let err = tx
        .execute_count(&ctx, "INSERT INTO duplicate_keys VALUES ($1)", &[Value::from(1)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
    assert!(!err.is_serialization_conflict());
    assert!(tx.is_open());

    // The server answers COMMIT of a failed block with ROLLBACK
    let err = tx.commit(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::TransactionAborted), "got {err:?}");
    assert_eq!(tx.state(), TxState::CommitFailed);
    assert_eq!(pool.status().in_use, 0);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back_in_background() {
    let (pool, script) = scripted_pool().await;
    let ctx = ctx();

    {
        let mut tx = pool.begin(&ctx).await.unwrap();
        tx.execute_count(&ctx, DEBIT, &debit()).await.unwrap();
    }

    // The pool's single connection comes back once ROLLBACK completes
    let conn = pool.acquire(&ctx).await.expect("connection returned");
    drop(conn);
    assert_eq!(script.log().last().map(String::as_str), Some("ROLLBACK"));
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_transaction_helper_retries_commit_conflict() {
    let (pool, script) = scripted_pool().await;
    script.commit_conflicts.store(2, Ordering::SeqCst);
    let ctx = ctx();
    let policy = RetryPolicy::new(3).base_delay(Duration::from_millis(1));

    let moved = pool
        .transaction(&ctx, &policy, |tx, ctx| {
            async move { tx.execute_count(ctx, DEBIT, &debit()).await }.boxed()
        })
        .await
        .expect("third attempt commits");

    assert_eq!(moved, 1);
    assert_eq!(script.count("BEGIN"), 3);
    assert_eq!(script.count("COMMIT"), 3);
    println!("  committed on the third attempt: ✓");
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_transaction_helper_gives_up_after_max_attempts() {
    let (pool, script) = scripted_pool().await;
    script.commit_conflicts.store(5, Ordering::SeqCst);
    let ctx = ctx();
    let policy = RetryPolicy::new(2).base_delay(Duration::from_millis(1));

    let err = pool
        .transaction(&ctx, &policy, |tx, ctx| {
            async move { tx.execute_count(ctx, DEBIT, &debit()).await }.boxed()
        })
        .await
        .unwrap_err();

    assert!(err.is_serialization_conflict());
    assert_eq!(script.count("BEGIN"), 2);
    assert_eq!(pool.status().in_use, 0);
    pool.shutdown(Duration::from_secs(1)).await;
}
