//! Byte stream under a connection: plain TCP for the SSLRequest, TLS after

use crate::connection::TlsConfig;
use crate::{Error, Result};
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::net::SocketAddrV4;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// TCP stream, encrypted once [`upgrade_to_tls`](Transport::upgrade_to_tls) succeeds
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Before the upgrade; only the SSLRequest exchange uses it
    Plain(TcpStream),
    /// After the upgrade
    Tls(TlsStream<TcpStream>),
}

/// Run the same expression against whichever stream is active
macro_rules! on_stream {
    ($transport:expr, $s:ident => $body:expr) => {
        match $transport {
            Transport::Plain($s) => $body,
            Transport::Tls($s) => $body,
        }
    };
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peer = match self {
            Transport::Plain(s) => s.peer_addr().ok(),
            Transport::Tls(s) => s.get_ref().0.peer_addr().ok(),
        };
        f.debug_struct("Transport")
            .field("tls", &self.is_tls())
            .field("peer", &peer)
            .finish()
    }
}

impl Transport {
    /// Open a TCP connection to the pinned IPv4 address
    pub async fn connect(addr: SocketAddrV4) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Plain(stream))
    }

    /// Run the TLS handshake over the plain stream
    ///
    /// The certificate is verified against `server_name`, the hostname the
    /// caller configured, not the address that was dialed.
    pub async fn upgrade_to_tls(
        self,
        tls: &TlsConfig,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let Transport::Plain(tcp) = self else {
            return Err(Error::Protocol("transport is already encrypted".into()));
        };
        let stream = tokio_rustls::TlsConnector::from(tls.client_config())
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Protocol(format!("TLS handshake failed: {}", e)))?;
        Ok(Transport::Tls(stream))
    }

    /// Whether the TLS upgrade has happened
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Write the whole buffer
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        on_stream!(self, s => s.write_all(buf).await)?;
        Ok(())
    }

    /// Flush buffered writes
    pub async fn flush(&mut self) -> Result<()> {
        on_stream!(self, s => s.flush().await)?;
        Ok(())
    }

    /// Read whatever is available into `buf`; 0 means the peer closed
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        Ok(on_stream!(self, s => s.read_buf(buf).await)?)
    }

    /// Shut down the write half (TLS close_notify first when encrypted)
    pub async fn shutdown(&mut self) -> Result<()> {
        on_stream!(self, s => s.shutdown().await)?;
        Ok(())
    }
}
