//! XML envelopes of [RFC6241]: `<hello>`, `<rpc>`, `<rpc-reply>` and
//! `<notification>`.
//!
//! Opaque payloads such as the `<data>` contents of a reply or the
//! `<error-info>` of an error are captured as verbatim byte spans of the
//! source document, preserving whitespace and attribute order.
//!
//! [RFC6241]: https://www.rfc-editor.org/rfc/rfc6241.html

use crate::error::{Error, Result};
use core::fmt;
use core::fmt::Write as _;
use core::str::FromStr;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::se::Serializer;
use quick_xml::{NsReader, Reader};
use serde_derive::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// `<hello>` message exchanged at session start, RFC6241 section 8.1.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename(serialize = "hello"))]
pub struct Hello {
    #[serde(default, rename = "@xmlns")]
    xmlns: String,
    #[serde(default)]
    capabilities: Capabilities,
    #[serde(rename = "session-id", skip_serializing_if = "Option::is_none")]
    session_id: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Capabilities {
    #[serde(default)]
    capability: Vec<String>,
}

impl Hello {
    pub fn new(capabilities: Vec<String>) -> Hello {
        Hello {
            xmlns: crate::NETCONF_NAMESPACE.to_string(),
            session_id: None,
            capabilities: Capabilities {
                capability: capabilities,
            },
        }
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities.capability
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .capability
            .iter()
            .any(|cap| cap == capability)
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }
}

impl fmt::Display for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use serde::Serialize;
        let mut buffer = String::with_capacity(206);
        let ser = Serializer::new(&mut buffer);
        self.serialize(ser).map_err(|_| fmt::Error)?;
        write!(f, "{}", buffer)
    }
}

/// Wraps an operation payload in the `<rpc>` envelope with the message-id
/// assigned by the session. The payload is emitted verbatim; extra envelope
/// attributes are reflected by the server on the matching `<rpc-reply>`
/// (RFC6241 section 4.1).
pub(crate) fn render_rpc(
    message_id: &str,
    attributes: &[(String, String)],
    operation: &str,
) -> String {
    let mut out = format!(
        "<rpc message-id=\"{}\" xmlns=\"{}\"",
        message_id,
        crate::NETCONF_NAMESPACE
    );
    for (key, value) in attributes {
        let _ = write!(out, " {}=\"{}\"", key, escape(value));
    }
    let _ = write!(out, ">{}</rpc>", operation);
    out
}

/// Root element of an inbound message, used to dispatch between replies and
/// notifications without decoding the whole document.
pub(crate) struct RootElement {
    pub namespace: Option<String>,
    pub local: String,
    pub message_id: Option<String>,
}

pub(crate) fn root_element(xml: &str) -> Result<RootElement> {
    let mut reader = NsReader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let (resolved, local) = reader.resolve_element(e.name());
                let namespace = match resolved {
                    ResolveResult::Bound(Namespace(ns)) => {
                        Some(String::from_utf8_lossy(ns).into_owned())
                    }
                    _ => None,
                };
                let mut message_id = None;
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    if attr.key.as_ref() == b"message-id" {
                        message_id = Some(attr.unescape_value()?.into_owned());
                    }
                }
                return Ok(RootElement {
                    namespace,
                    local: String::from_utf8_lossy(local.as_ref()).into_owned(),
                    message_id,
                });
            }
            Event::Eof => return Err(Error::new("message contains no element")),
            _ => {}
        }
    }
}

/// Decoded `<rpc-reply>` envelope.
#[derive(Debug, Default)]
pub struct RpcReply {
    message_id: Option<String>,
    attributes: Vec<(String, String)>,
    errors: RpcErrors,
    data: Option<String>,
    ok: bool,
}

impl RpcReply {
    pub fn parse(xml: &str) -> Result<RpcReply> {
        let mut reader = Reader::from_str(xml);

        let mut reply = RpcReply::default();
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    if e.local_name().as_ref() != b"rpc-reply" {
                        return Err(Error::new(format!(
                            "expected <rpc-reply>, found <{}>",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                    for attr in e.attributes() {
                        let attr = attr.map_err(quick_xml::Error::from)?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr.unescape_value()?.into_owned();
                        if key == "message-id" {
                            reply.message_id = Some(value);
                        } else {
                            reply.attributes.push((key, value));
                        }
                    }
                    break;
                }
                Event::Eof => return Err(Error::new("empty rpc-reply document")),
                _ => {}
            }
        }

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"rpc-error" => {
                        let error = parse_rpc_error(&mut reader, xml)?;
                        reply.errors.0.push(error);
                    }
                    b"data" => {
                        let span = reader.read_to_end(e.name())?;
                        reply.data = Some(xml[span].to_string());
                    }
                    b"ok" => {
                        reply.ok = true;
                        reader.read_to_end(e.name())?;
                    }
                    _ => {
                        reader.read_to_end(e.name())?;
                    }
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"ok" => reply.ok = true,
                    b"data" => reply.data = Some(String::new()),
                    _ => {}
                },
                Event::End(_) | Event::Eof => break,
                _ => {}
            }
        }

        Ok(reply)
    }

    /// The `message-id` attribute, which must match the originating request.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Envelope attributes other than `message-id`, in document order.
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// All `<rpc-error>` children, warnings included.
    pub fn errors(&self) -> &RpcErrors {
        &self.errors
    }

    /// Errors of severity `warning` only.
    pub fn warnings(&self) -> RpcErrors {
        self.errors.filter(ErrorSeverity::Warning)
    }

    /// Verbatim content of the `<data>` element, if present.
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Whether the reply carried `<ok/>`.
    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

fn parse_rpc_error(reader: &mut Reader<&[u8]>, xml: &str) -> Result<RpcError> {
    let mut error_type = None;
    let mut tag = None;
    let mut severity = None;
    let mut app_tag = None;
    let mut path = None;
    let mut message = None;
    let mut info = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"error-type" => error_type = Some(reader.read_text(e.name())?.trim().parse()?),
                b"error-tag" => tag = Some(reader.read_text(e.name())?.trim().parse()?),
                b"error-severity" => severity = Some(reader.read_text(e.name())?.trim().parse()?),
                b"error-app-tag" => {
                    app_tag = Some(reader.read_text(e.name())?.trim().to_string());
                }
                b"error-path" => path = Some(reader.read_text(e.name())?.trim().to_string()),
                b"error-message" => message = Some(reader.read_text(e.name())?.into_owned()),
                b"error-info" => {
                    let span = reader.read_to_end(e.name())?;
                    info = Some(xml[span].to_string());
                }
                _ => {
                    reader.read_to_end(e.name())?;
                }
            },
            Event::End(_) => break,
            Event::Eof => return Err(Error::new("unterminated <rpc-error>")),
            _ => {}
        }
    }

    Ok(RpcError {
        error_type: error_type.ok_or_else(|| Error::new("rpc-error without <error-type>"))?,
        tag: tag.ok_or_else(|| Error::new("rpc-error without <error-tag>"))?,
        severity: severity.ok_or_else(|| Error::new("rpc-error without <error-severity>"))?,
        app_tag,
        path,
        message,
        info,
    })
}

/// A single `<rpc-error>` element, RFC6241 appendix A.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub error_type: ErrorType,
    pub tag: ErrorTag,
    pub severity: ErrorSeverity,
    pub app_tag: Option<String>,
    pub path: Option<String>,
    pub message: Option<String>,
    /// Verbatim content of `<error-info>`.
    pub info: Option<String>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "netconf error: {} {}: {}",
            self.error_type,
            self.tag,
            self.message.as_deref().unwrap_or_default()
        )
    }
}

impl std::error::Error for RpcError {}

/// The ordered list of `<rpc-error>` elements from one reply.
#[derive(Debug, Clone, Default)]
pub struct RpcErrors(Vec<RpcError>);

impl RpcErrors {
    pub fn first(&self) -> Option<&RpcError> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpcError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Errors matching the given severity, in their original order.
    pub fn filter(&self, severity: ErrorSeverity) -> RpcErrors {
        RpcErrors(
            self.0
                .iter()
                .filter(|err| err.severity == severity)
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Display for RpcErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [single] => single.fmt(f),
            errors => {
                write!(f, "multiple netconf errors:")?;
                for error in errors {
                    write!(f, "\n{}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RpcErrors {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    App,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::App => "app",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transport" => Ok(ErrorType::Transport),
            "rpc" => Ok(ErrorType::Rpc),
            "protocol" => Ok(ErrorType::Protocol),
            "application" | "app" => Ok(ErrorType::App),
            _ => Err(Error::new(format!("unknown error-type {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Warning,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "error",
            ErrorSeverity::Warning => "warning",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorSeverity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "error" => Ok(ErrorSeverity::Error),
            "warning" => Ok(ErrorSeverity::Warning),
            _ => Err(Error::new(format!("unknown error-severity {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    InUse,
    InvalidValue,
    TooBig,
    MissingAttribute,
    BadAttribute,
    UnknownAttribute,
    MissingElement,
    BadElement,
    UnknownElement,
    UnknownNamespace,
    AccessDenied,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    DataExists,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
    PartialOperation,
    MalformedMessage,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::InUse => "in-use",
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::TooBig => "too-big",
            ErrorTag::MissingAttribute => "missing-attribute",
            ErrorTag::BadAttribute => "bad-attribute",
            ErrorTag::UnknownAttribute => "unknown-attribute",
            ErrorTag::MissingElement => "missing-element",
            ErrorTag::BadElement => "bad-element",
            ErrorTag::UnknownElement => "unknown-element",
            ErrorTag::UnknownNamespace => "unknown-namespace",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::LockDenied => "lock-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::RollbackFailed => "rollback-failed",
            ErrorTag::DataExists => "data-exists",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::PartialOperation => "partial-operation",
            ErrorTag::MalformedMessage => "malformed-message",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-use" => Ok(ErrorTag::InUse),
            "invalid-value" => Ok(ErrorTag::InvalidValue),
            "too-big" => Ok(ErrorTag::TooBig),
            "missing-attribute" => Ok(ErrorTag::MissingAttribute),
            "bad-attribute" => Ok(ErrorTag::BadAttribute),
            "unknown-attribute" => Ok(ErrorTag::UnknownAttribute),
            "missing-element" => Ok(ErrorTag::MissingElement),
            "bad-element" => Ok(ErrorTag::BadElement),
            "unknown-element" => Ok(ErrorTag::UnknownElement),
            "unknown-namespace" => Ok(ErrorTag::UnknownNamespace),
            "access-denied" => Ok(ErrorTag::AccessDenied),
            "lock-denied" => Ok(ErrorTag::LockDenied),
            "resource-denied" => Ok(ErrorTag::ResourceDenied),
            "rollback-failed" => Ok(ErrorTag::RollbackFailed),
            "data-exists" => Ok(ErrorTag::DataExists),
            "data-missing" => Ok(ErrorTag::DataMissing),
            "operation-not-supported" => Ok(ErrorTag::OperationNotSupported),
            "operation-failed" => Ok(ErrorTag::OperationFailed),
            "partial-operation" => Ok(ErrorTag::PartialOperation),
            "malformed-message" => Ok(ErrorTag::MalformedMessage),
            _ => Err(Error::new(format!("unknown error-tag {:?}", s))),
        }
    }
}

/// A `<notification>` message, RFC5277 section 4.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event_time: OffsetDateTime,
    /// Verbatim XML of the notification content, `<eventTime>` excluded.
    pub payload: String,
}

impl Notification {
    pub fn parse(xml: &str) -> Result<Notification> {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    if e.local_name().as_ref() != b"notification" {
                        return Err(Error::new(format!(
                            "expected <notification>, found <{}>",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                    break;
                }
                Event::Eof => return Err(Error::new("empty notification document")),
                _ => {}
            }
        }

        let mut event_time = None;
        let mut payload = String::new();
        loop {
            let start = reader.buffer_position();
            match reader.read_event()? {
                Event::Start(e) => {
                    if e.local_name().as_ref() == b"eventTime" {
                        let text = reader.read_text(e.name())?;
                        let parsed = OffsetDateTime::parse(text.trim(), &Rfc3339)
                            .map_err(|err| Error::new(format!("invalid eventTime: {}", err)))?;
                        event_time = Some(parsed);
                    } else {
                        reader.read_to_end(e.name())?;
                        payload.push_str(&xml[start..reader.buffer_position()]);
                    }
                }
                Event::Empty(_) => {
                    payload.push_str(&xml[start..reader.buffer_position()]);
                }
                Event::End(_) | Event::Eof => break,
                _ => {}
            }
        }

        Ok(Notification {
            event_time: event_time
                .ok_or_else(|| Error::new("notification without <eventTime>"))?,
            payload,
        })
    }
}
