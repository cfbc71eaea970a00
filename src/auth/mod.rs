//! Password authentication mechanisms

mod md5;
mod scram;

pub use self::md5::md5_password;
pub use scram::{ScramClient, ScramError, ServerVerifier};
