//! Wire constants for protocol version 3.0

/// Protocol version 3.0, sent in the startup packet
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// SSLRequest code: 1234 in the high half, 5679 in the low half
pub const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679;

/// Text format code for parameters and result columns
pub const TEXT_FORMAT: i16 = 0;

/// Tags of messages the client sends
pub mod frontend {
    #![allow(missing_docs)]
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const PARSE: u8 = b'P';
    /// PasswordMessage, SASLInitialResponse and SASLResponse share a tag
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Tags of messages the server sends
pub mod backend {
    #![allow(missing_docs)]
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Describe targets
pub mod describe {
    /// Prepared statement
    pub const STATEMENT: u8 = b'S';
    /// Portal
    pub const PORTAL: u8 = b'P';
}

/// Authentication request codes
pub mod auth {
    #![allow(missing_docs)]
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}
