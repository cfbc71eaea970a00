//! Typed protocol messages

use bytes::Bytes;
use std::fmt;

/// Messages the client sends
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// SSLRequest, the first packet on every connection
    SslRequest,

    /// StartupMessage
    Startup {
        /// Protocol version, normally [`PROTOCOL_VERSION`](super::constants::PROTOCOL_VERSION)
        version: i32,
        /// `user`, `database` and other run-time parameters
        params: Vec<(String, String)>,
    },

    /// PasswordMessage (cleartext or md5-hashed)
    Password(String),

    /// SASLInitialResponse
    SaslInitialResponse {
        /// Selected mechanism
        mechanism: String,
        /// client-first-message
        data: Vec<u8>,
    },

    /// SASLResponse
    SaslResponse {
        /// client-final-message
        data: Vec<u8>,
    },

    /// Simple query
    Query(String),

    /// Parse
    Parse {
        /// Statement name, empty for the unnamed statement
        name: String,
        /// SQL with `$n` placeholders
        query: String,
        /// Parameter type OIDs; missing or zero entries are inferred by the server
        param_types: Vec<u32>,
    },

    /// Bind with every parameter and result column in text format
    Bind {
        /// Portal name, empty for the unnamed portal
        portal: String,
        /// Statement name
        statement: String,
        /// Text-encoded values, `None` for SQL NULL
        params: Vec<Option<Vec<u8>>>,
    },

    /// Describe
    Describe {
        /// [`describe::STATEMENT`](super::constants::describe::STATEMENT) or
        /// [`describe::PORTAL`](super::constants::describe::PORTAL)
        kind: u8,
        /// Target name
        name: String,
    },

    /// Execute
    Execute {
        /// Portal name
        portal: String,
        /// Row limit, 0 for all rows
        max_rows: i32,
    },

    /// Sync
    Sync,

    /// Terminate
    Terminate,
}

/// Messages the server sends
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Authentication request or result
    Authentication(AuthenticationMessage),

    /// BackendKeyData
    BackendKeyData {
        /// Backend process ID
        process_id: i32,
        /// Cancellation key
        secret_key: i32,
    },

    /// ParameterStatus
    ParameterStatus {
        /// Parameter name, e.g. `server_version`
        name: String,
        /// Current value
        value: String,
    },

    /// ReadyForQuery with the transaction status byte
    ReadyForQuery {
        /// `I`, `T` or `E`
        status: u8,
    },

    /// ParseComplete
    ParseComplete,

    /// BindComplete
    BindComplete,

    /// ParameterDescription
    ParameterDescription(Vec<u32>),

    /// RowDescription
    RowDescription(Vec<FieldDescription>),

    /// NoData: the described portal returns no rows
    NoData,

    /// DataRow, `None` for SQL NULL
    DataRow(Vec<Option<Bytes>>),

    /// CommandComplete with its command tag
    CommandComplete(String),

    /// EmptyQueryResponse
    EmptyQueryResponse,

    /// ErrorResponse
    ErrorResponse(ErrorFields),

    /// NoticeResponse
    NoticeResponse(ErrorFields),

    /// NotificationResponse (LISTEN/NOTIFY)
    NotificationResponse {
        /// Notifying backend process ID
        process_id: i32,
        /// Channel name
        channel: String,
        /// Payload
        payload: String,
    },
}

/// Authentication request variants
#[derive(Debug, Clone)]
pub enum AuthenticationMessage {
    /// AuthenticationOk
    Ok,
    /// AuthenticationCleartextPassword
    CleartextPassword,
    /// AuthenticationMD5Password
    Md5Password {
        /// Per-connection salt
        salt: [u8; 4],
    },
    /// AuthenticationSASL with the offered mechanisms
    Sasl {
        /// Mechanism names, e.g. `SCRAM-SHA-256`
        mechanisms: Vec<String>,
    },
    /// AuthenticationSASLContinue
    SaslContinue {
        /// server-first-message
        data: Vec<u8>,
    },
    /// AuthenticationSASLFinal
    SaslFinal {
        /// server-final-message
        data: Vec<u8>,
    },
}

/// One column of a RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column label
    pub name: String,
    /// Source table OID, 0 for computed columns
    pub table_oid: i32,
    /// Source column attribute number, 0 for computed columns
    pub column_attr: i16,
    /// Type OID
    pub type_oid: u32,
    /// `pg_type.typlen`
    pub type_size: i16,
    /// `pg_attribute.atttypmod`
    pub type_modifier: i32,
    /// 0 for text, 1 for binary
    pub format_code: i16,
}

/// Fields of an ErrorResponse or NoticeResponse
///
/// Unknown field codes are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// `S`: ERROR, FATAL, WARNING...
    pub severity: Option<String>,
    /// `C`: SQLSTATE
    pub code: Option<String>,
    /// `M`: primary message
    pub message: Option<String>,
    /// `D`: detail
    pub detail: Option<String>,
    /// `H`: hint
    pub hint: Option<String>,
    /// `P`: cursor position in the statement text
    pub position: Option<String>,
}

impl ErrorFields {
    pub(crate) fn set(&mut self, code: u8, value: String) {
        let slot = match code {
            b'S' => &mut self.severity,
            b'C' => &mut self.code,
            b'M' => &mut self.message,
            b'D' => &mut self.detail,
            b'H' => &mut self.hint,
            b'P' => &mut self.position,
            _ => return,
        };
        *slot = Some(value);
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("unknown server error"))?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        Ok(())
    }
}
