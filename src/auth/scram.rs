//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677)
//!
//! Channel binding is never offered, so the GS2 header is always `n,,` even
//! over TLS. The exchange is split in two steps: [`ScramClient::respond`]
//! answers the server-first message and hands back a [`ServerVerifier`] that
//! checks the server-final signature.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::distributions::{Alphanumeric, DistString};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const GS2_HEADER: &str = "n,,";
const NONCE_LEN: usize = 24;

/// SCRAM exchange errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    /// The server message is missing an attribute or is not UTF-8
    #[error("malformed server message: {0}")]
    Malformed(&'static str),
    /// The server nonce does not extend the client nonce
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    /// Iteration count is not a positive integer
    #[error("invalid iteration count '{0}'")]
    Iterations(String),
    /// A base64 attribute failed to decode
    #[error("invalid base64 in '{0}' attribute")]
    Base64(char),
    /// The server-final message carried `e=<reason>`
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    /// The server signature did not match
    #[error("server signature mismatch")]
    SignatureMismatch,
}

/// SCRAM-SHA-256 client side of one authentication exchange
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    nonce: String,
}

/// Checks the server-final message once the client proof has been sent
#[derive(Debug, Clone)]
pub struct ServerVerifier {
    expected: Vec<u8>,
}

/// Attributes of the server-first message
#[derive(Debug, PartialEq, Eq)]
struct ServerFirst<'a> {
    nonce: &'a str,
    salt: &'a str,
    iterations: u32,
}

impl ScramClient {
    /// Start an exchange with a fresh random nonce
    pub fn new(user: &str, password: &str) -> Self {
        let nonce = Alphanumeric.sample_string(&mut rand::thread_rng(), NONCE_LEN);
        Self::with_nonce(user, password, nonce)
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        // Postgres takes the role from the startup packet; `n=` is informational
        let user = user.replace('=', "=3D").replace(',', "=2C");
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", user, nonce),
            nonce,
        }
    }

    /// client-first-message, sent in SASLInitialResponse
    pub fn initial_response(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Answer the server-first message with the client-final message
    pub fn respond(&self, server_first: &[u8]) -> Result<(Vec<u8>, ServerVerifier), ScramError> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| ScramError::Malformed("server-first is not UTF-8"))?;
        let parsed = ServerFirst::parse(server_first)?;

        if !parsed.nonce.starts_with(&self.nonce) {
            return Err(ScramError::NonceMismatch);
        }
        let salt = BASE64
            .decode(parsed.salt)
            .map_err(|_| ScramError::Base64('s'))?;

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), parsed.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, parsed.iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&signature)
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted, b"Server Key");
        let verifier = ServerVerifier {
            expected: hmac(&server_key, auth_message.as_bytes()),
        };

        let message = format!("{},p={}", without_proof, BASE64.encode(proof));
        Ok((message.into_bytes(), verifier))
    }
}

impl ServerVerifier {
    /// Check `v=<signature>` from SASLFinal
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| ScramError::Malformed("server-final is not UTF-8"))?;

        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(ScramError::Rejected(reason.to_string()));
        }
        let encoded = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or(ScramError::Malformed("server-final has no verifier"))?;
        let signature = BASE64.decode(encoded).map_err(|_| ScramError::Base64('v'))?;

        if ct_eq(&signature, &self.expected) {
            Ok(())
        } else {
            Err(ScramError::SignatureMismatch)
        }
    }
}

impl<'a> ServerFirst<'a> {
    fn parse(msg: &'a str) -> Result<Self, ScramError> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attr in msg.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) if !v.is_empty() => nonce = Some(v),
                Some(("s", v)) if !v.is_empty() => salt = Some(v),
                Some(("i", v)) => iterations = Some(v),
                Some(("m", _)) => return Err(ScramError::Malformed("mandatory extension")),
                _ => {}
            }
        }

        let iterations = iterations.ok_or(ScramError::Malformed("missing i="))?;
        Ok(Self {
            nonce: nonce.ok_or(ScramError::Malformed("missing r="))?,
            salt: salt.ok_or(ScramError::Malformed("missing s="))?,
            iterations: iterations
                .parse::<u32>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| ScramError::Iterations(iterations.to_string()))?,
        })
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const RFC_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const RFC_SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const RFC_CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                                    p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const RFC_SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    fn rfc_client() -> ScramClient {
        ScramClient::with_nonce("user", "pencil", RFC_NONCE.to_string())
    }

    #[test]
    fn test_rfc7677_exchange() {
        let client = rfc_client();
        assert_eq!(client.initial_response(), b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let (client_final, verifier) = client.respond(RFC_SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(client_final).unwrap(), RFC_CLIENT_FINAL);
        verifier.verify(RFC_SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let (_, verifier) = rfc_client().respond(RFC_SERVER_FIRST.as_bytes()).unwrap();
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        assert_eq!(
            verifier.verify(forged.as_bytes()),
            Err(ScramError::SignatureMismatch)
        );
        assert_eq!(verifier.verify(b"v="), Err(ScramError::SignatureMismatch));
    }

    #[test]
    fn test_server_error_attribute() {
        let (_, verifier) = rfc_client().respond(RFC_SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            verifier.verify(b"e=invalid-proof"),
            Err(ScramError::Rejected("invalid-proof".into()))
        );
        assert!(matches!(verifier.verify(b"x=1"), Err(ScramError::Malformed(_))));
        assert_eq!(verifier.verify(b"v=!!"), Err(ScramError::Base64('v')));
    }

    #[test]
    fn test_fresh_nonce_is_random_and_printable() {
        let a = ScramClient::new("yugabyte", "secret");
        let b = ScramClient::new("yugabyte", "secret");
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.nonce.len(), NONCE_LEN);
        assert!(a.nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_username_is_escaped() {
        let client = ScramClient::with_nonce("a=b,c", "p", "abc".into());
        assert_eq!(client.initial_response(), b"n,,n=a=3Db=2Cc,r=abc");
    }

    #[test]
    fn test_server_first_attributes_any_order() {
        let parsed = ServerFirst::parse("s=c2FsdA==,x=junk,i=4096,r=nonce").unwrap();
        assert_eq!(
            parsed,
            ServerFirst {
                nonce: "nonce",
                salt: "c2FsdA==",
                iterations: 4096
            }
        );
    }

    #[test]
    fn test_server_first_missing_or_bad_attributes() {
        assert!(matches!(ServerFirst::parse(""), Err(ScramError::Malformed(_))));
        assert!(matches!(ServerFirst::parse("r=,s=c2FsdA==,i=1"), Err(ScramError::Malformed(_))));
        assert!(matches!(ServerFirst::parse("r=n,i=1"), Err(ScramError::Malformed(_))));
        assert!(matches!(ServerFirst::parse("m=ext,r=n,s=c2FsdA==,i=1"), Err(ScramError::Malformed(_))));
        assert_eq!(
            ServerFirst::parse("r=n,s=c2FsdA==,i=abc"),
            Err(ScramError::Iterations("abc".into()))
        );
        assert_eq!(
            ServerFirst::parse("r=n,s=c2FsdA==,i=0"),
            Err(ScramError::Iterations("0".into()))
        );
    }

    #[test]
    fn test_tampered_nonce_rejected() {
        let server_first = format!("r=someone_else,s={},i=4096", BASE64.encode(b"salt"));
        assert_eq!(
            rfc_client().respond(server_first.as_bytes()).unwrap_err(),
            ScramError::NonceMismatch
        );
    }

    #[test]
    fn test_bad_salt_rejected() {
        let server_first = format!("r={}ext,s=!!!,i=4096", RFC_NONCE);
        assert_eq!(
            rfc_client().respond(server_first.as_bytes()).unwrap_err(),
            ScramError::Base64('s')
        );
        assert!(matches!(
            rfc_client().respond(&[0xff, 0xfe]),
            Err(ScramError::Malformed(_))
        ));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"", b""));
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}
