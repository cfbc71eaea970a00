//! Physical connections
//!
//! This module handles:
//! * TCP transport with the mandatory TLS upgrade
//! * Connection lifecycle (startup, auth, statement execution)
//! * State machine enforcement and server transaction status
//! * TLS client configuration

mod conn;
mod state;
pub mod tls;
mod transport;

pub use conn::{rows_affected, Connection, Response};
pub use state::{ConnectionState, TransactionStatus};
pub use tls::TlsConfig;
pub use transport::Transport;
