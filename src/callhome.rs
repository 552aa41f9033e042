//! NETCONF call home, RFC8071: the device initiates the TCP connection and
//! the management system turns the accepted socket into a regular client
//! session.
//!
//! The server accepts on a listen address (RFC8071 assigns port 4334 for
//! SSH), looks up the per-device configuration by peer IP, upgrades the
//! socket through the configured [`CallHomeTransport`] and opens a session.
//! Established sessions and per-connection failures are delivered through an
//! event stream.

use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::Transport;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Default listen address, using the IANA-assigned NETCONF call-home port.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4334";

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Upgrades an accepted TCP connection into a NETCONF transport, typically
/// by running an SSH or TLS handshake on top of it.
#[async_trait]
pub trait CallHomeTransport: Send + Sync {
    async fn upgrade(&self, stream: TcpStream) -> Result<Box<dyn Transport>>;
}

/// A session established through call home.
pub struct CallHomeClient {
    pub address: SocketAddr,
    pub session: Session,
}

pub enum CallHomeEvent {
    Connected(CallHomeClient),
    Failed { address: SocketAddr, error: Error },
}

pub struct CallHomeServer {
    addr: String,
    clients: HashMap<IpAddr, Arc<dyn CallHomeTransport>>,
    events: mpsc::Sender<CallHomeEvent>,
}

impl CallHomeServer {
    /// Creates a server bound (at listen time) to the RFC8071 default
    /// address, returning it with the receiving end of its event stream.
    pub fn new() -> (CallHomeServer, mpsc::Receiver<CallHomeEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            CallHomeServer {
                addr: DEFAULT_LISTEN_ADDR.to_string(),
                clients: HashMap::new(),
                events,
            },
            receiver,
        )
    }

    pub fn with_address(mut self, addr: impl Into<String>) -> CallHomeServer {
        self.addr = addr.into();
        self
    }

    /// Registers the transport used for connections arriving from `address`.
    pub fn add_client(&mut self, address: IpAddr, transport: Arc<dyn CallHomeTransport>) {
        self.clients.insert(address, transport);
    }

    /// Accepts connections until the listener fails. Each accepted socket is
    /// handled on its own task; the outcome is reported through the event
    /// stream.
    pub async fn listen(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        debug!("call-home server listening on {}", self.addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            let Some(transport) = self.clients.get(&peer.ip()).cloned() else {
                warn!("call-home connection from unconfigured address {}", peer);
                let _ = self
                    .events
                    .send(CallHomeEvent::Failed {
                        address: peer,
                        error: Error::new("no client configuration for address"),
                    })
                    .await;
                continue;
            };
            let events = self.events.clone();
            tokio::spawn(handle_connection(transport, stream, peer, events));
        }
    }
}

async fn handle_connection(
    transport: Arc<dyn CallHomeTransport>,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<CallHomeEvent>,
) {
    let session = async {
        let transport = transport.upgrade(stream).await?;
        Session::open(transport).await
    }
    .await;

    let event = match session {
        Ok(session) => CallHomeEvent::Connected(CallHomeClient {
            address: peer,
            session,
        }),
        Err(error) => {
            warn!("call-home connection from {} failed: {}", peer, error);
            CallHomeEvent::Failed {
                address: peer,
                error,
            }
        }
    };
    let _ = events.send(event).await;
}

/// Call home over SSH: the accepted socket carries an SSH handshake with
/// password authentication, then the `netconf` subsystem.
#[cfg(feature = "ssh")]
pub struct SshCallHome {
    pub username: String,
    pub password: String,
}

#[cfg(feature = "ssh")]
#[async_trait]
impl CallHomeTransport for SshCallHome {
    async fn upgrade(&self, stream: TcpStream) -> Result<Box<dyn Transport>> {
        use crate::transport::ssh::SshTransport;
        use async_ssh2_lite::{AsyncSession, SessionConfiguration};

        let mut session = AsyncSession::new(stream, SessionConfiguration::new())?;
        session.handshake().await?;
        session
            .userauth_password(&self.username, &self.password)
            .await?;
        Ok(Box::new(SshTransport::with_session(session).await?))
    }
}

/// Call home over TLS, RFC8071 section 4: the TLS handshake runs with this
/// side as the TLS client even though the device opened the TCP connection.
#[cfg(feature = "tls")]
pub struct TlsCallHome {
    pub server_name: String,
    pub config: Arc<tokio_rustls::rustls::ClientConfig>,
}

#[cfg(feature = "tls")]
#[async_trait]
impl CallHomeTransport for TlsCallHome {
    async fn upgrade(&self, stream: TcpStream) -> Result<Box<dyn Transport>> {
        use crate::transport::tls::TlsTransport;
        use tokio_rustls::rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|err| Error::new(format!("invalid server name: {}", err)))?;
        let connector = TlsConnector::from(self.config.clone());
        let stream = connector.connect(server_name, stream).await?;
        Ok(Box::new(TlsTransport::new(stream)))
    }
}
