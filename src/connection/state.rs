//! Connection lifecycle and server transaction status

use crate::{Error, Result};
use std::fmt;

/// Where a connection is in its lifecycle
///
/// Startup always passes through `NegotiatingTls`; there is no path from
/// `Initial` to authentication that skips the TLS upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connected, nothing sent
    Initial,
    /// SSLRequest sent
    NegotiatingTls,
    /// Startup packet sent over TLS
    AwaitingAuth,
    /// Authentication exchange running
    Authenticating,
    /// Ready for a statement
    Idle,
    /// Statement sent, no reply consumed yet
    QueryInProgress,
    /// RowDescription received; data rows pending
    ReadingResults,
    /// Terminated
    Closed,
}

impl ConnectionState {
    /// Whether `next` may follow `self`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match next {
            Closed => true,
            NegotiatingTls => self == Initial,
            AwaitingAuth => self == NegotiatingTls,
            Authenticating => self == AwaitingAuth,
            Idle => matches!(self, Authenticating | QueryInProgress | ReadingResults),
            QueryInProgress => self == Idle,
            ReadingResults => self == QueryInProgress,
            Initial => false,
        }
    }

    /// Move to `next`, rejecting transitions the protocol does not allow
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("a state reachable from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::NegotiatingTls => "negotiating_tls",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticating => "authenticating",
            Self::Idle => "idle",
            Self::QueryInProgress => "query_in_progress",
            Self::ReadingResults => "reading_results",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status reported by the last ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: outside a transaction block
    Idle,
    /// `T`: inside a transaction block
    InTransaction,
    /// `E`: inside a failed block; only ROLLBACK will be accepted
    Failed,
}

impl TransactionStatus {
    /// Parse the status byte
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'I' => Self::Idle,
            b'T' => Self::InTransaction,
            b'E' => Self::Failed,
            _ => return None,
        })
    }
}
