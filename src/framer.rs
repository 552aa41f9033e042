//! NETCONF message framing as defined in [RFC6242].
//!
//! The framer owns the two halves of a byte stream and hands out scoped,
//! single-message readers and writers. It starts in end-of-message framing
//! (`]]>]]>` delimiter) and can be switched once to chunked framing after the
//! hello exchange has negotiated the `base:1.1` capability.
//!
//! [RFC6242]: https://tools.ietf.org/html/rfc6242#section-4

use crate::error::{Error, Result};
use log::debug;
use memmem::{Searcher, TwoWaySearcher};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const END_OF_MESSAGE: &[u8] = b"]]>]]>";
pub const END_OF_CHUNKS: &[u8] = b"\n##\n";

const READ_BUF_SIZE: usize = 4096;

/// Largest chunk emitted by a single write. RFC6242 allows up to 2^32-1 but
/// capping at 2^31-1 keeps chunk sizes addressable on every platform.
const MAX_CHUNK_SIZE: usize = i32::MAX as usize;

/// Sink receiving a verbatim copy of framed bytes in one direction.
pub type CaptureSink = Box<dyn Write + Send>;

struct ReadState<R> {
    stream: R,
    /// Bytes read from the stream but not yet claimed by a message reader.
    buf: Vec<u8>,
    capture: Option<CaptureSink>,
}

impl<R: AsyncRead + Unpin> ReadState<R> {
    /// Reads more bytes from the stream into the buffer. Returns the number
    /// of bytes read, zero meaning end of stream.
    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_BUF_SIZE];
        let n = self.stream.read(&mut chunk).await?;
        if n > 0 {
            if let Some(capture) = &mut self.capture {
                capture.write_all(&chunk[..n])?;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }
}

struct WriteState<W> {
    stream: BufWriter<W>,
    capture: Option<CaptureSink>,
}

impl<W: AsyncWrite + Unpin> WriteState<W> {
    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        if let Some(capture) = &mut self.capture {
            capture.write_all(bytes)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }
}

/// Dual-mode RFC6242 framer over a read/write byte-stream pair.
///
/// At most one [`MessageReader`] and one [`MessageWriter`] can be open at any
/// instant; requesting a second handle for the same direction fails with
/// [`Error::StreamBusy`]. The two directions are independent.
pub struct Framer<R, W> {
    read_state: Arc<Mutex<ReadState<R>>>,
    write_state: Arc<Mutex<WriteState<W>>>,
    chunked: Arc<AtomicBool>,
}

impl<R, W> Framer<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Framer<R, W> {
        Framer {
            read_state: Arc::new(Mutex::new(ReadState {
                stream: reader,
                buf: Vec::new(),
                capture: None,
            })),
            write_state: Arc::new(Mutex::new(WriteState {
                stream: BufWriter::new(writer),
                capture: None,
            })),
            chunked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switches from end-of-message framing to chunked framing. Called once,
    /// right after the hello exchange has negotiated `base:1.1`.
    ///
    /// Fails with [`Error::StreamBusy`] if a message reader or writer is
    /// still open. Buffered bytes are message-aligned (readers drain to the
    /// end of their message on close), so they stay valid across the switch.
    pub fn upgrade(&self) -> Result<()> {
        let _read = self.read_state.try_lock().map_err(|_| Error::StreamBusy)?;
        let _write = self.write_state.try_lock().map_err(|_| Error::StreamBusy)?;
        self.chunked.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Attaches sinks receiving verbatim copies of framed bytes in each
    /// direction. Must be called before any message handle is opened.
    pub fn debug_capture(
        &self,
        inbound: Option<CaptureSink>,
        outbound: Option<CaptureSink>,
    ) -> Result<()> {
        let mut read = self.read_state.try_lock().map_err(|_| Error::StreamBusy)?;
        let mut write = self.write_state.try_lock().map_err(|_| Error::StreamBusy)?;
        if inbound.is_some() {
            read.capture = inbound;
        }
        if outbound.is_some() {
            write.capture = outbound;
        }
        Ok(())
    }

    /// Opens a reader scoped to the next message on the stream.
    pub fn message_reader(&self) -> Result<MessageReader<R>> {
        let state = self
            .read_state
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::StreamBusy)?;
        Ok(MessageReader {
            state,
            chunked: self.chunked.load(Ordering::SeqCst),
            chunk_left: 0,
            eof: false,
        })
    }

    /// Opens a writer for a new message. Closing it finalizes the framing
    /// and flushes to the underlying stream.
    pub fn message_writer(&self) -> Result<MessageWriter<W>> {
        let state = self
            .write_state
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::StreamBusy)?;
        Ok(MessageWriter {
            state,
            chunked: self.chunked.load(Ordering::SeqCst),
            closed: false,
        })
    }

    /// Flushes and shuts down the write side of the underlying stream.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.write_state.lock().await;
        state.stream.shutdown().await?;
        Ok(())
    }
}

/// Reader over a single framed message. Returns zero from [`read`] once the
/// message delimiter has been consumed; [`close`] drains any unread remainder
/// so the stream is positioned at the next message.
///
/// [`read`]: MessageReader::read
/// [`close`]: MessageReader::close
pub struct MessageReader<R> {
    state: OwnedMutexGuard<ReadState<R>>,
    chunked: bool,
    chunk_left: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Reads message bytes into `out`, returning the number of bytes read.
    /// Zero means the end of the message. In chunked mode a single call never
    /// crosses a chunk boundary.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.eof || out.is_empty() {
            return Ok(0);
        }
        if self.chunked {
            self.read_chunked(out).await
        } else {
            self.read_marked(out).await
        }
    }

    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut scratch = [0u8; READ_BUF_SIZE];
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

    pub async fn read_to_string(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Consumes and discards the unread remainder of the current message,
    /// leaving the stream at the start of the next one.
    pub async fn close(mut self) -> Result<()> {
        let mut scratch = [0u8; READ_BUF_SIZE];
        while self.read(&mut scratch).await? > 0 {}
        Ok(())
    }

    async fn read_chunked(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.chunk_left == 0 {
            match self.next_chunk_header().await? {
                None => {
                    self.eof = true;
                    return Ok(0);
                }
                Some(size) => self.chunk_left = u64::from(size),
            }
        }

        if self.state.buf.is_empty() && self.state.fill().await? == 0 {
            return Err(Error::UnexpectedEof);
        }

        let n = out
            .len()
            .min(self.state.buf.len())
            .min(usize::try_from(self.chunk_left).unwrap_or(usize::MAX));
        out[..n].copy_from_slice(&self.state.buf[..n]);
        self.state.consume(n);
        self.chunk_left -= n as u64;
        Ok(n)
    }

    /// Parses the next chunk header. `None` signals the end-of-chunks marker.
    ///
    /// The chunk size is a nonempty run of ASCII digits without leading
    /// zeros, between 1 and 2^32-1 inclusive.
    async fn next_chunk_header(&mut self) -> Result<Option<u32>> {
        self.ensure(2).await?;
        if self.state.buf[0] != b'\n' || self.state.buf[1] != b'#' {
            return Err(Error::MalformedChunk);
        }

        self.ensure(3).await?;
        if self.state.buf[2] == b'#' {
            self.ensure(4).await?;
            if self.state.buf[3] != b'\n' {
                return Err(Error::MalformedChunk);
            }
            self.state.consume(END_OF_CHUNKS.len());
            return Ok(None);
        }

        let mut i = 2;
        let mut size: u64 = 0;
        loop {
            self.ensure(i + 1).await?;
            let c = self.state.buf[i];
            if c == b'\n' {
                break;
            }
            if !c.is_ascii_digit() {
                return Err(Error::MalformedChunk);
            }
            size = size * 10 + u64::from(c - b'0');
            if size > u64::from(u32::MAX) {
                return Err(Error::MalformedChunk);
            }
            i += 1;
        }

        // empty size, leading zeros and a bare zero are all invalid
        if i == 2 || self.state.buf[2] == b'0' {
            return Err(Error::MalformedChunk);
        }
        self.state.consume(i + 1);
        Ok(Some(size as u32))
    }

    async fn read_marked(&mut self, out: &mut [u8]) -> Result<usize> {
        let search = TwoWaySearcher::new(END_OF_MESSAGE);
        loop {
            match search.search_in(&self.state.buf) {
                Some(0) => {
                    self.state.consume(END_OF_MESSAGE.len());
                    self.eof = true;
                    return Ok(0);
                }
                Some(pos) => {
                    let n = out.len().min(pos);
                    out[..n].copy_from_slice(&self.state.buf[..n]);
                    self.state.consume(n);
                    return Ok(n);
                }
                None => {
                    // Everything but a possible sentinel prefix at the buffer
                    // tail is known message payload.
                    let safe = self
                        .state
                        .buf
                        .len()
                        .saturating_sub(END_OF_MESSAGE.len() - 1);
                    if safe > 0 {
                        let n = out.len().min(safe);
                        out[..n].copy_from_slice(&self.state.buf[..n]);
                        self.state.consume(n);
                        return Ok(n);
                    }
                    if self.state.fill().await? == 0 {
                        return Err(Error::UnexpectedEof);
                    }
                }
            }
        }
    }

    async fn ensure(&mut self, n: usize) -> Result<()> {
        while self.state.buf.len() < n {
            if self.state.fill().await? == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
        Ok(())
    }
}

impl<R> Drop for MessageReader<R> {
    fn drop(&mut self) {
        if !self.eof {
            debug!("message reader dropped before the end of the message");
        }
    }
}

/// Writer for a single framed message. [`close`] emits the end-of-message
/// delimiter (or end-of-chunks marker) and flushes.
///
/// [`close`]: MessageWriter::close
pub struct MessageWriter<W> {
    state: OwnedMutexGuard<WriteState<W>>,
    chunked: bool,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        if !self.chunked {
            return self.state.put(data).await;
        }
        while !data.is_empty() {
            let n = data.len().min(MAX_CHUNK_SIZE);
            let header = format!("\n#{}\n", n);
            self.state.put(header.as_bytes()).await?;
            self.state.put(&data[..n]).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Finalizes the message framing and flushes the stream.
    pub async fn close(mut self) -> Result<()> {
        let marker = if self.chunked {
            END_OF_CHUNKS
        } else {
            END_OF_MESSAGE
        };
        self.state.put(marker).await?;
        self.state.flush().await?;
        self.closed = true;
        Ok(())
    }
}

impl<W> Drop for MessageWriter<W> {
    fn drop(&mut self) {
        if !self.closed {
            debug!("message writer dropped without closing the message");
        }
    }
}
