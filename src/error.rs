use crate::message::RpcErrors;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "ssh")]
    #[error(transparent)]
    Ssh(#[from] async_ssh2_lite::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    XmlSerde(#[from] quick_xml::DeError),
    /// A chunk header violated the framing grammar of RFC 6242 section 4.2.
    #[error("invalid chunk header")]
    MalformedChunk,
    /// The stream ended in the middle of a framed message.
    #[error("unexpected end of stream inside a message")]
    UnexpectedEof,
    /// A message reader or writer was requested while the previous one for
    /// the same direction was still open.
    #[error("stream is already active")]
    StreamBusy,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// The session is closed; no further calls can be issued on it.
    #[error("session is closed")]
    SessionClosed,
    /// The server answered with one or more `<rpc-error>` elements of
    /// severity `error`.
    #[error(transparent)]
    Rpc(#[from] RpcErrors),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn new(msg: impl Into<String>) -> Self {
        Error::Other(anyhow::Error::msg(msg.into()))
    }
}
