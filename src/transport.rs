//! Transport contract consumed by the session, plus a generic
//! [`StreamTransport`] that frames any async byte stream.
//!
//! Concrete secure transports live in the submodules: SSH with the `netconf`
//! subsystem ([RFC6242] section 3) and TLS ([RFC7589]).
//!
//! [RFC6242]: https://www.rfc-editor.org/rfc/rfc6242.html
//! [RFC7589]: https://www.rfc-editor.org/rfc/rfc7589.html

use crate::error::Result;
use crate::framer::{CaptureSink, Framer, MessageReader, MessageWriter};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

#[cfg(feature = "ssh")]
pub mod ssh;
#[cfg(feature = "tls")]
pub mod tls;

/// Message-oriented transport for a NETCONF session. Framing and other
/// per-message details happen behind the reader/writer handles.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns a reader scoped to the next message. The caller must close it
    /// when done to advance the stream.
    async fn message_reader(&self) -> Result<Box<dyn MessageRead>>;

    /// Returns a writer for a new message. Closing it finalizes the framing
    /// and flushes to the peer.
    async fn message_writer(&self) -> Result<Box<dyn MessageWrite>>;

    async fn close(&self) -> Result<()>;

    /// Whether the transport can switch to chunked framing after the hello
    /// exchange.
    fn supports_upgrade(&self) -> bool {
        false
    }

    /// Switches to chunked framing. Called at most once, right after the
    /// capability exchange.
    fn upgrade(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn message_reader(&self) -> Result<Box<dyn MessageRead>> {
        (**self).message_reader().await
    }

    async fn message_writer(&self) -> Result<Box<dyn MessageWrite>> {
        (**self).message_writer().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn supports_upgrade(&self) -> bool {
        (**self).supports_upgrade()
    }

    fn upgrade(&self) -> Result<()> {
        (**self).upgrade()
    }
}

/// Scoped reader over a single inbound message.
#[async_trait]
pub trait MessageRead: Send {
    /// Reads message bytes, returning zero at the end of the message.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Discards the unread remainder of the message, leaving the stream at
    /// the next message boundary.
    async fn close(self: Box<Self>) -> Result<()>;

    async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut scratch = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                return Ok(total);
            }
            buf.extend_from_slice(&scratch[..n]);
            total += n;
        }
    }

    async fn read_to_string(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Scoped writer for a single outbound message.
#[async_trait]
pub trait MessageWrite: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Finalizes the message framing and flushes.
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> MessageRead for MessageReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        MessageReader::read(self, buf).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        MessageReader::close(*self).await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> MessageWrite for MessageWriter<W> {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        MessageWriter::write_all(self, buf).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        MessageWriter::close(*self).await
    }
}

/// Frames an already-established byte stream, such as a TLS connection or an
/// in-memory pipe. The externally supplied stream is the byte-pair provider;
/// this type adds RFC6242 framing on top.
pub struct StreamTransport<S> {
    framer: Framer<ReadHalf<S>, WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamTransport<S> {
    pub fn new(stream: S) -> StreamTransport<S> {
        let (reader, writer) = tokio::io::split(stream);
        StreamTransport {
            framer: Framer::new(reader, writer),
        }
    }

    /// Attaches sinks receiving verbatim framed bytes per direction. Must be
    /// called before the transport is handed to a session.
    pub fn debug_capture(
        &self,
        inbound: Option<CaptureSink>,
        outbound: Option<CaptureSink>,
    ) -> Result<()> {
        self.framer.debug_capture(inbound, outbound)
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> Transport for StreamTransport<S> {
    async fn message_reader(&self) -> Result<Box<dyn MessageRead>> {
        Ok(Box::new(self.framer.message_reader()?))
    }

    async fn message_writer(&self) -> Result<Box<dyn MessageWrite>> {
        Ok(Box::new(self.framer.message_writer()?))
    }

    async fn close(&self) -> Result<()> {
        self.framer.shutdown().await
    }

    fn supports_upgrade(&self) -> bool {
        true
    }

    fn upgrade(&self) -> Result<()> {
        self.framer.upgrade()
    }
}
