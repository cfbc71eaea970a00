//! Integration tests for TLS and address pinning
//!
//! The pool always dials the resolved IPv4 address while verifying the server
//! certificate against the original hostname. These tests check both halves.
//!
//! To run the database-backed tests locally:
//!
//! ```bash
//! # Server certificate must be issued for POSTGRES_HOST and chain to the root
//! export POSTGRES_HOST="yb-tserver.local"
//! export POSTGRES_ROOT_CERT="/path/to/root.crt"
//!
//! cargo test --test tls_integration -- --ignored --nocapture
//! ```

#[cfg(test)]
mod tls_integration {
    use std::env;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use ysql_pool::connection::{Connection, TlsConfig};
    use ysql_pool::{resolve, CertSource, ConnectionParams, Error, ResolutionError};

    const FIXTURE_ROOT: &str = "tests/fixtures/root.crt";

    /// Helper to build connection parameters from the environment
    fn test_params() -> ConnectionParams {
        let user = env::var("POSTGRES_USER").unwrap_or_else(|_| "yugabyte".to_string());
        let password = env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "yugabyte".to_string());
        let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5433".to_string());
        let db = env::var("POSTGRES_DB").unwrap_or_else(|_| "yugabyte".to_string());
        let cert = env::var("POSTGRES_ROOT_CERT").unwrap_or_else(|_| "config/root.crt".into());

        ConnectionParams::new(host, db, user)
            .port(port)
            .password(password)
            .root_cert(CertSource::Path(cert.into()))
            .connect_timeout(Duration::from_secs(10))
    }

    #[test]
    fn test_fixture_root_loads() {
        let tls = TlsConfig::from_pem_file(FIXTURE_ROOT).expect("fixture root is valid PEM");
        assert_eq!(tls.anchors(), 1);
        assert_eq!(tls.origin(), FIXTURE_ROOT);
    }

    #[tokio::test]
    async fn test_missing_root_cert_fails_resolution() {
        let params = ConnectionParams::new("127.0.0.1", "yugabyte", "yugabyte")
            .root_cert(CertSource::Path("/nonexistent/root.crt".into()));
        let err = resolve(&params).await.unwrap_err();
        assert!(matches!(err, ResolutionError::CertificateLoad { .. }));
    }

    #[tokio::test]
    async fn test_hostname_pinned_but_kept_for_tls() {
        let params = ConnectionParams::new("localhost", "yugabyte", "yugabyte")
            .root_cert(CertSource::Path(FIXTURE_ROOT.into()));
        let desc = resolve(&params).await.expect("localhost resolves");

        assert!(desc.addr.is_loopback());
        assert_ne!(desc.addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(desc.host, "localhost");
        assert!(desc.socket_addr().to_string().starts_with("127."));
    }

    /// Test that the handshake succeeds with the configured root
    #[tokio::test]
    #[ignore] // Requires PostgreSQL with TLS enabled
    async fn test_tls_connection_succeeds() {
        let desc = resolve(&test_params()).await.expect("resolve");
        let conn = Connection::connect(&desc).await.expect("connect over TLS");

        assert!(conn.server_version().is_some());
        println!(
            "  Connected to {} via {} (server {:?}): ✓",
            desc.host,
            desc.addr,
            conn.server_version()
        );
        conn.close().await.expect("close");
    }

    /// Test that a server certificate not chaining to the root is rejected
    #[tokio::test]
    #[ignore] // Requires PostgreSQL with TLS enabled
    async fn test_tls_wrong_root_rejected() {
        let params = test_params().root_cert(CertSource::Path(FIXTURE_ROOT.into()));
        let desc = resolve(&params).await.expect("resolve");

        let err = Connection::connect(&desc).await.unwrap_err();
        println!("  Handshake rejected: {}", err);
        assert!(matches!(err, Error::Protocol(_) | Error::Io(_)), "got {err:?}");
    }

    /// Test that a wrong password surfaces as an authentication error
    #[tokio::test]
    #[ignore] // Requires PostgreSQL with TLS enabled
    async fn test_wrong_password_rejected() {
        let params = test_params().password("definitely-not-the-password");
        let desc = resolve(&params).await.expect("resolve");

        let err = Connection::connect(&desc).await.unwrap_err();
        assert!(
            matches!(err, Error::Authentication(_) | Error::Db(_)),
            "got {err:?}"
        );
    }
}
