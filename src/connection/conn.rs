//! Core connection type

use super::state::{ConnectionState, TransactionStatus};
use super::transport::Transport;
use crate::auth::{md5_password, ScramClient, ScramError};
use crate::metrics::{counters, histograms, labels};
use crate::protocol::constants::{describe, PROTOCOL_VERSION};
use crate::protocol::decode::MAX_MESSAGE_LENGTH;
use crate::protocol::{
    decode_message, encode_message, AuthenticationMessage, BackendMessage, FrontendMessage,
};
use crate::resolve::ConnectionDescriptor;
use crate::types::{Column, Value};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tracing::Instrument;

/// Outcome of sending one statement
#[derive(Debug)]
pub enum Response {
    /// The statement returns rows; call [`Connection::next_data_row`] until it yields `None`
    Rows(Arc<[Column]>),
    /// The statement finished without a result set
    Complete {
        /// Command tag, e.g. `UPDATE 1`
        tag: String,
    },
}

/// Postgres connection
pub struct Connection {
    transport: Option<Transport>,
    state: ConnectionState,
    tx_status: TransactionStatus,
    read_buf: BytesMut,
    process_id: Option<i32>,
    server_version: Option<String>,
    last_tag: Option<String>,
    broken: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("tx_status", &self.tx_status)
            .field("process_id", &self.process_id)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Connection {
    fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            state: ConnectionState::Initial,
            tx_status: TransactionStatus::Idle,
            read_buf: BytesMut::with_capacity(8192),
            process_id: None,
            server_version: None,
            last_tag: None,
            broken: false,
        }
    }

    /// Dial, negotiate TLS and authenticate, bounded by the descriptor's connect timeout
    pub async fn connect(desc: &ConnectionDescriptor) -> Result<Self> {
        let establish = async {
            let transport = Transport::connect(desc.socket_addr()).await?;
            let mut conn = Connection::new(transport);
            conn.startup(desc).await?;
            Ok(conn)
        };

        match tokio::time::timeout(desc.connect_timeout, establish).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "connecting to {}:{} timed out after {:?}",
                    desc.host, desc.port, desc.connect_timeout
                ),
            ))),
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server-side transaction status as of the last ReadyForQuery
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// `server_version` reported at startup
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Backend process ID
    pub fn backend_pid(&self) -> Option<i32> {
        self.process_id
    }

    /// Command tag of the last completed statement
    pub fn last_command_tag(&self) -> Option<&str> {
        self.last_tag.as_deref()
    }

    /// Whether the connection can no longer be trusted to be in sync with the server
    ///
    /// An exchange interrupted between sending and the first reply leaves the
    /// state at `QueryInProgress`, which counts as broken.
    pub fn is_broken(&self) -> bool {
        self.broken
            || matches!(
                self.state,
                ConnectionState::QueryInProgress | ConnectionState::Closed
            )
    }

    /// Flag the connection as unusable
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// SSLRequest, then the TLS handshake against the configured hostname
    ///
    /// A server answering `N` is an error: there is no plaintext fallback.
    async fn negotiate_tls(&mut self, desc: &ConnectionDescriptor) -> Result<()> {
        self.state.transition(ConnectionState::NegotiatingTls)?;
        self.send_message(&FrontendMessage::SslRequest).await?;

        let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
        if transport.read_buf(&mut self.read_buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
        let answer = self.read_buf.split_to(1)[0];

        match answer {
            b'S' if self.read_buf.is_empty() => {}
            // Anything buffered here arrived before encryption started
            b'S' => {
                return Err(Error::Protocol(
                    "server sent plaintext data after accepting TLS".into(),
                ))
            }
            b'N' => return Err(Error::Protocol("server refused TLS".into())),
            // An old server may answer with an ErrorResponse
            other => {
                return Err(Error::Protocol(format!(
                    "invalid SSLRequest answer 0x{:02X}",
                    other
                )))
            }
        }

        let plain = self.transport.take().ok_or(Error::ConnectionClosed)?;
        self.transport = Some(plain.upgrade_to_tls(&desc.tls, desc.server_name.clone()).await?);
        tracing::debug!(server_name = %desc.host, "TLS established");
        Ok(())
    }

    /// TLS, StartupMessage and authentication, up to the first ReadyForQuery
    async fn startup(&mut self, desc: &ConnectionDescriptor) -> Result<()> {
        let span = tracing::info_span!(
            "startup",
            user = %desc.user,
            database = %desc.database,
            addr = %desc.socket_addr()
        );
        async {
            self.negotiate_tls(desc).await?;
            self.state.transition(ConnectionState::AwaitingAuth)?;

            let optional = [
                ("application_name", desc.application_name.clone()),
                (
                    "statement_timeout",
                    desc.statement_timeout.map(|t| t.as_millis().to_string()),
                ),
            ];
            let params = [
                ("user", Some(desc.user.clone())),
                ("database", Some(desc.database.clone())),
                ("client_encoding", Some("UTF8".to_string())),
            ]
            .into_iter()
            .chain(optional)
            .filter_map(|(name, value)| Some((name.to_string(), value?)))
            .collect();

            self.send_message(&FrontendMessage::Startup {
                version: PROTOCOL_VERSION,
                params,
            })
            .await?;

            self.state.transition(ConnectionState::Authenticating)?;
            self.authenticate(desc).await?;
            self.state.transition(ConnectionState::Idle)?;

            tracing::debug!(
                server_version = self.server_version.as_deref().unwrap_or("unknown"),
                pid = self.process_id,
                "session ready"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Answer authentication requests until the server reports ReadyForQuery
    async fn authenticate(&mut self, desc: &ConnectionDescriptor) -> Result<()> {
        let started = std::time::Instant::now();
        let mut mechanism = labels::MECHANISM_TRUST;

        loop {
            let request = match self.receive_message().await? {
                BackendMessage::Authentication(request) => request,
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.process_id = Some(process_id);
                    continue;
                }
                BackendMessage::ReadyForQuery { status } => return self.set_tx_status(status),
                BackendMessage::ErrorResponse(err) => {
                    counters::auth_failed(mechanism, "server_error");
                    return Err(Error::Authentication(err.to_string()));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} during authentication",
                        other
                    )))
                }
            };

            let reply = match request {
                AuthenticationMessage::Ok => {
                    counters::auth_successful(mechanism);
                    histograms::auth_duration(mechanism, started.elapsed().as_millis() as u64);
                    continue;
                }
                AuthenticationMessage::CleartextPassword => {
                    mechanism = labels::MECHANISM_CLEARTEXT;
                    required_password(desc)?.to_string()
                }
                AuthenticationMessage::Md5Password { salt } => {
                    mechanism = labels::MECHANISM_MD5;
                    md5_password(&desc.user, required_password(desc)?, &salt)
                }
                AuthenticationMessage::Sasl { mechanisms } => {
                    mechanism = labels::MECHANISM_SCRAM;
                    counters::auth_attempted(mechanism);
                    self.handle_sasl(&mechanisms, desc).await?;
                    continue;
                }
                AuthenticationMessage::SaslContinue { .. } | AuthenticationMessage::SaslFinal { .. } => {
                    return Err(Error::Protocol("SASL message outside a SASL exchange".into()))
                }
            };
            counters::auth_attempted(mechanism);
            self.send_message(&FrontendMessage::Password(reply)).await?;
        }
    }

    /// SCRAM-SHA-256 over SASL; the final AuthenticationOk is read by the caller
    async fn handle_sasl(&mut self, mechanisms: &[String], desc: &ConnectionDescriptor) -> Result<()> {
        const MECHANISM: &str = "SCRAM-SHA-256";
        if !mechanisms.iter().any(|m| m == MECHANISM) {
            return Err(Error::Authentication(format!(
                "no supported SASL mechanism offered (server offers: {})",
                mechanisms.join(", ")
            )));
        }

        let scram = ScramClient::new(&desc.user, required_password(desc)?);
        let scram_err = |e: ScramError| Error::Authentication(format!("SCRAM: {}", e));

        self.send_message(&FrontendMessage::SaslInitialResponse {
            mechanism: MECHANISM.to_string(),
            data: scram.initial_response(),
        })
        .await?;

        let server_first = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue { data }) => data,
            other => return Err(sasl_unexpected("SASLContinue", other)),
        };
        let (client_final, verifier) = scram.respond(&server_first).map_err(scram_err)?;
        self.send_message(&FrontendMessage::SaslResponse { data: client_final })
            .await?;

        match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data }) => {
                verifier.verify(&data).map_err(scram_err)?;
            }
            other => return Err(sasl_unexpected("SASLFinal", other)),
        }
        tracing::debug!("server signature verified");
        Ok(())
    }

    fn begin_exchange(&mut self) -> Result<()> {
        if self.broken {
            return Err(Error::ConnectionBusy("connection is broken".into()));
        }
        if self.state != ConnectionState::Idle {
            return Err(Error::ConnectionBusy(format!(
                "connection in state: {}",
                self.state
            )));
        }
        self.last_tag = None;
        self.state.transition(ConnectionState::QueryInProgress)
    }

    /// Run a statement through the simple query protocol and collect every reply
    ///
    /// A server error is returned after the connection is back to idle.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<BackendMessage>> {
        self.begin_exchange()?;
        self.send_message(&FrontendMessage::Query(query.to_string()))
            .await?;

        let mut messages = Vec::new();
        let mut error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::ReadyForQuery { status } => {
                    self.set_tx_status(status)?;
                    break;
                }
                BackendMessage::ErrorResponse(fields) => error = Some(fields),
                BackendMessage::CommandComplete(tag) => {
                    self.last_tag = Some(tag.clone());
                    messages.push(BackendMessage::CommandComplete(tag));
                }
                msg => messages.push(msg),
            }
        }

        self.state.transition(ConnectionState::Idle)?;
        match error {
            Some(fields) => Err(Error::from(fields)),
            None => Ok(messages),
        }
    }

    /// Run a statement without parameters and return its command tag
    pub async fn simple_command(&mut self, query: &str) -> Result<String> {
        self.simple_query(query).await?;
        Ok(self.last_tag.clone().unwrap_or_default())
    }

    /// Send one statement with positional parameters through the extended protocol
    ///
    /// Parse, Bind, Describe, Execute and Sync go out in a single write on the
    /// unnamed statement and portal. Parameters are sent as text with
    /// unspecified types so the server infers them.
    pub async fn query_portal(&mut self, sql: &str, params: &[Value]) -> Result<Response> {
        async {
            let messages = [
                FrontendMessage::Parse {
                    name: String::new(),
                    query: sql.to_string(),
                    param_types: Vec::new(),
                },
                FrontendMessage::Bind {
                    portal: String::new(),
                    statement: String::new(),
                    params: params.iter().map(Value::to_text).collect(),
                },
                FrontendMessage::Describe {
                    kind: describe::PORTAL,
                    name: String::new(),
                },
                FrontendMessage::Execute {
                    portal: String::new(),
                    max_rows: 0,
                },
                FrontendMessage::Sync,
            ];
            let mut buf = BytesMut::new();
            for msg in &messages {
                let encoded = encode_message(msg).map_err(|e| {
                    Error::Protocol(format!("cannot encode statement: {}", e))
                })?;
                buf.extend_from_slice(&encoded);
            }

            self.begin_exchange()?;
            self.send_bytes(&buf).await?;

            let mut error = None;
            let mut tag = String::new();

            loop {
                match self.receive_message().await? {
                    BackendMessage::ParseComplete | BackendMessage::BindComplete => {}
                    BackendMessage::ParameterDescription(_) | BackendMessage::NoData => {}
                    BackendMessage::RowDescription(fields) => {
                        let columns: Arc<[Column]> = fields.iter().map(Column::from).collect();
                        self.state.transition(ConnectionState::ReadingResults)?;
                        return Ok(Response::Rows(columns));
                    }
                    BackendMessage::CommandComplete(t) => tag = t,
                    BackendMessage::EmptyQueryResponse => tag.clear(),
                    BackendMessage::ErrorResponse(fields) => error = Some(fields),
                    BackendMessage::ReadyForQuery { status } => {
                        self.set_tx_status(status)?;
                        self.state.transition(ConnectionState::Idle)?;
                        return match error {
                            Some(fields) => Err(Error::from(fields)),
                            None => {
                                self.last_tag = Some(tag.clone());
                                Ok(Response::Complete { tag })
                            }
                        };
                    }
                    other => {
                        self.broken = true;
                        return Err(Error::Protocol(format!(
                            "unexpected message in extended query: {:?}",
                            other
                        )));
                    }
                }
            }
        }
        .instrument(tracing::debug_span!("query", sql = %sql, params = params.len()))
        .await
    }

    /// Next raw data row of the pending result set
    ///
    /// Returns `Ok(None)` once the statement completed and the connection is
    /// idle again; the command tag is then available from [`last_command_tag`].
    ///
    /// [`last_command_tag`]: Connection::last_command_tag
    pub async fn next_data_row(&mut self) -> Result<Option<Vec<Option<Bytes>>>> {
        if self.state == ConnectionState::Idle {
            return Ok(None);
        }
        if self.state != ConnectionState::ReadingResults {
            return Err(Error::InvalidState {
                expected: ConnectionState::ReadingResults.to_string(),
                actual: self.state.to_string(),
            });
        }

        let mut error = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::DataRow(values) if error.is_none() => return Ok(Some(values)),
                BackendMessage::DataRow(_) => {}
                BackendMessage::CommandComplete(tag) => self.last_tag = Some(tag),
                BackendMessage::ErrorResponse(fields) => error = Some(fields),
                BackendMessage::ReadyForQuery { status } => {
                    self.set_tx_status(status)?;
                    self.state.transition(ConnectionState::Idle)?;
                    return match error {
                        Some(fields) => Err(Error::from(fields)),
                        None => Ok(None),
                    };
                }
                other => {
                    self.broken = true;
                    return Err(Error::Protocol(format!(
                        "unexpected message while reading rows: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Discard the rest of a pending result set
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_data_row().await?.is_some() {}
        Ok(())
    }

    fn set_tx_status(&mut self, status: u8) -> Result<()> {
        match TransactionStatus::from_byte(status) {
            Some(tx_status) => {
                self.tx_status = tx_status;
                Ok(())
            }
            None => {
                self.broken = true;
                Err(Error::Protocol(format!(
                    "invalid transaction status byte 0x{:02X}",
                    status
                )))
            }
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Send a frontend message
    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg)?;
        self.send_bytes(&buf).await
    }

    async fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let transport = self.transport_mut()?;
        let result = match transport.write_all(buf).await {
            Ok(()) => transport.flush().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Receive a backend message, handling asynchronous ones inline
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            let msg = self.read_message().await?;
            match msg {
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("server notice: {}", notice);
                }
                BackendMessage::NotificationResponse { channel, .. } => {
                    tracing::debug!(%channel, "ignoring asynchronous notification");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::trace!("parameter status: {} = {}", name, value);
                    if name == "server_version" {
                        self.server_version = Some(value);
                    }
                }
                other => return Ok(other),
            }
        }
    }

    async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(len) = declared_length(&self.read_buf) {
                if len < 4 {
                    self.broken = true;
                    return Err(Error::Protocol(format!("invalid message length {}", len)));
                }
            }
            if frame_complete(&self.read_buf) {
                return match decode_message(&mut self.read_buf) {
                    Ok((msg, consumed)) => {
                        self.read_buf.advance(consumed);
                        Ok(msg)
                    }
                    Err(e) => {
                        self.broken = true;
                        Err(Error::Protocol(format!("malformed backend message: {}", e)))
                    }
                };
            }

            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            match transport.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    self.broken = true;
                    return Err(Error::ConnectionClosed);
                }
                Ok(_) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let _ = self.send_message(&FrontendMessage::Terminate).await;
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown().await?;
        }
        Ok(())
    }
}

fn sasl_unexpected(expected: &str, got: BackendMessage) -> Error {
    match got {
        BackendMessage::ErrorResponse(err) => Error::Authentication(err.to_string()),
        other => Error::Protocol(format!("expected {} during SASL, got {:?}", expected, other)),
    }
}

fn required_password(desc: &ConnectionDescriptor) -> Result<&str> {
    desc.password
        .as_deref()
        .ok_or_else(|| Error::Authentication("password required".into()))
}

/// Length field of the first message in `buf`, once the header is buffered
fn declared_length(buf: &[u8]) -> Option<i32> {
    (buf.len() >= 5).then(|| i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]))
}

/// Whether `buf` holds at least one whole message (tag + length + body)
///
/// An oversized length also counts as complete so the decoder can reject it.
fn frame_complete(buf: &[u8]) -> bool {
    match declared_length(buf) {
        Some(len) if len >= 4 => {
            let len = len as usize;
            buf.len() > len || len > MAX_MESSAGE_LENGTH
        }
        _ => false,
    }
}

/// Rows affected according to a command tag (`INSERT 0 5`, `UPDATE 3`, `SELECT 2`)
pub fn rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_affected() {
        assert_eq!(rows_affected("INSERT 0 5"), 5);
        assert_eq!(rows_affected("UPDATE 1"), 1);
        assert_eq!(rows_affected("DELETE 0"), 0);
        assert_eq!(rows_affected("SELECT 2"), 2);
        assert_eq!(rows_affected("BEGIN"), 0);
        assert_eq!(rows_affected(""), 0);
    }

    #[test]
    fn test_frame_complete() {
        assert!(!frame_complete(b""));
        assert!(!frame_complete(b"Z\0\0"));
        // ReadyForQuery: tag, len 5, status
        assert!(frame_complete(b"Z\0\0\0\x05I"));
        assert!(!frame_complete(b"Z\0\0\0\x05"));
        assert_eq!(declared_length(b"Z\0\0\0\x02"), Some(2));
        // Oversized lengths go to the decoder for rejection
        assert!(frame_complete(b"D\x7f\xff\xff\xff"));
    }

    // Connection futures must be Send to run on the multi-threaded runtime
    #[allow(dead_code)]
    fn assert_futures_are_send(conn: &mut Connection, desc: &ConnectionDescriptor) {
        fn require_send<T: Send>(_: T) {}
        require_send(Connection::connect(desc));
        require_send(conn.query_portal("SELECT 1", &[]));
        require_send(conn.next_data_row());
        require_send(conn.simple_query("SELECT 1"));
    }
}
