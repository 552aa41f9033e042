//! NETCONF over SSH, RFC6242 section 3. The session channel requests the
//! `netconf` subsystem and messages are framed over it.

use crate::error::{Error, Result};
use crate::framer::Framer;
use crate::transport::{MessageRead, MessageWrite, Transport};
use async_ssh2_lite::{ssh2, AsyncChannel, AsyncSession, SessionConfiguration};
use async_trait::async_trait;
use std::io;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

const SUBSYSTEM: &str = "netconf";

pub struct SshTransport {
    session: AsyncSession<TcpStream>,
    framer: Framer<ReadHalf<AsyncChannel<TcpStream>>, WriteHalf<AsyncChannel<TcpStream>>>,
}

impl SshTransport {
    /// Connects to `addr`, authenticates with a username and password and
    /// opens the `netconf` subsystem.
    pub async fn dial(addr: &str, username: &str, password: &str) -> Result<SshTransport> {
        let stream = TcpStream::connect(addr).await?;
        let mut configuration = SessionConfiguration::new();
        configuration.set_timeout(10000);
        let mut session = AsyncSession::new(stream, configuration)?;
        session.handshake().await?;
        session.userauth_password(username, password).await?;
        SshTransport::with_session(session).await
    }

    /// Builds a transport over an already-authenticated SSH session.
    pub async fn with_session(session: AsyncSession<TcpStream>) -> Result<SshTransport> {
        if !session.authenticated() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "ssh session is not authenticated",
            )));
        }
        let mut channel = session.channel_session().await?;
        channel.subsystem(SUBSYSTEM).await?;
        let (reader, writer) = tokio::io::split(channel);
        Ok(SshTransport {
            session,
            framer: Framer::new(reader, writer),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn message_reader(&self) -> Result<Box<dyn MessageRead>> {
        Ok(Box::new(self.framer.message_reader()?))
    }

    async fn message_writer(&self) -> Result<Box<dyn MessageWrite>> {
        Ok(Box::new(self.framer.message_writer()?))
    }

    async fn close(&self) -> Result<()> {
        self.framer.shutdown().await?;
        self.session
            .disconnect(Some(ssh2::ByApplication), "Shutdown", None)
            .await?;
        Ok(())
    }

    fn supports_upgrade(&self) -> bool {
        true
    }

    fn upgrade(&self) -> Result<()> {
        self.framer.upgrade()
    }
}
