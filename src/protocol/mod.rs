//! Postgres wire protocol (v3) messages
//!
//! Only the subset needed by the pool is implemented: startup and
//! authentication, the simple query protocol, and the unnamed-statement
//! extended query flow (Parse/Bind/Describe/Execute/Sync).

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;

pub use decode::decode_message;
pub use encode::encode_message;
pub use message::{AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription, FrontendMessage};
