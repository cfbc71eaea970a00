//! Connection parameter resolution
//!
//! [`resolve`] validates raw [`ConnectionParams`] once, at startup, and pins
//! the host to a single IPv4 address. The resulting [`ConnectionDescriptor`]
//! is immutable; the pool never performs DNS lookups on the hot path.

use crate::config::ConnectionParams;
use crate::connection::tls::{self, TlsConfig};
use crate::error::ResolutionError;
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tracing::debug;

/// Validated, TLS-ready connection descriptor
#[derive(Clone)]
pub struct ConnectionDescriptor {
    /// Original hostname; used as the TLS server name
    pub host: String,
    /// Resolved IPv4 address the pool connects to
    pub addr: Ipv4Addr,
    /// Port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Username
    pub user: String,
    /// Password
    pub password: Option<String>,
    /// TLS client configuration
    pub tls: TlsConfig,
    /// TLS server name derived from `host`
    pub server_name: ServerName<'static>,
    /// Bound on TCP connect + TLS handshake + authentication
    pub connect_timeout: Duration,
    /// `application_name` startup parameter
    pub application_name: Option<String>,
    /// `statement_timeout` startup parameter
    pub statement_timeout: Option<Duration>,
}

impl ConnectionDescriptor {
    /// Socket address to dial
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

/// Turn raw parameters into a [`ConnectionDescriptor`]
///
/// Only the DNS lookup and the certificate file read have side effects.
pub async fn resolve(params: &ConnectionParams) -> Result<ConnectionDescriptor, ResolutionError> {
    let port = parse_port(&params.port)?;
    let addr = resolve_ipv4(&params.host, port).await?;
    let server_name = tls::server_name(&params.host)?;
    let tls = TlsConfig::from_source(&params.root_cert)?;

    debug!(
        host = %params.host,
        %addr,
        port,
        tls_roots = tls.anchors(),
        "resolved connection parameters"
    );

    Ok(ConnectionDescriptor {
        host: params.host.clone(),
        addr,
        port,
        database: params.database.clone(),
        user: params.user.clone(),
        password: params.password.clone(),
        tls,
        server_name,
        connect_timeout: params.connect_timeout,
        application_name: params.application_name.clone(),
        statement_timeout: params.statement_timeout,
    })
}

/// Parse a port number in 1..=65535
pub fn parse_port(raw: &str) -> Result<u16, ResolutionError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ResolutionError::InvalidPort {
            value: raw.to_string(),
        }),
        Ok(port) => Ok(port),
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, ResolutionError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(ResolutionError::NoIpv4Address {
                host: host.to_string(),
            }),
        };
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ResolutionError::Lookup {
            host: host.to_string(),
            source,
        })?;

    first_ipv4(addrs).ok_or_else(|| ResolutionError::NoIpv4Address {
        host: host.to_string(),
    })
}

/// First IPv4 address in resolver order
pub fn first_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    })
}
