//! NETCONF over TLS, RFC7589. The caller supplies the rustls client
//! configuration; certificate handling and mutual authentication policy stay
//! outside this crate.

use crate::error::{Error, Result};
use crate::transport::{MessageRead, MessageWrite, StreamTransport, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// Default NETCONF-over-TLS port, RFC7589 section 2.
pub const DEFAULT_TLS_PORT: u16 = 6513;

pub struct TlsTransport {
    inner: StreamTransport<TlsStream<TcpStream>>,
}

impl TlsTransport {
    /// Connects a TCP stream to `addr` and performs the TLS handshake for
    /// `server_name` before framing the stream.
    pub async fn dial(
        addr: impl ToSocketAddrs,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<TlsTransport> {
        let stream = TcpStream::connect(addr).await?;
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|err| Error::new(format!("invalid server name: {}", err)))?;
        let connector = TlsConnector::from(config);
        let stream = connector.connect(server_name, stream).await?;
        Ok(TlsTransport::new(stream))
    }

    /// Builds a transport over an already-established TLS stream.
    pub fn new(stream: TlsStream<TcpStream>) -> TlsTransport {
        TlsTransport {
            inner: StreamTransport::new(stream),
        }
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn message_reader(&self) -> Result<Box<dyn MessageRead>> {
        self.inner.message_reader().await
    }

    async fn message_writer(&self) -> Result<Box<dyn MessageWrite>> {
        self.inner.message_writer().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn supports_upgrade(&self) -> bool {
        true
    }

    fn upgrade(&self) -> Result<()> {
        self.inner.upgrade()
    }
}
