//! Typed RPC operations: a thin XML-marshalling layer over the session.
//!
//! Fully structured operations serialize through serde the same way the
//! `<hello>` message does. Operations that embed opaque XML (filters,
//! `<config>` payloads) are written by hand so the embedded content reaches
//! the wire byte for byte.

use crate::error::{Error, Result};
use core::fmt::Write as _;
use core::str::FromStr;
use quick_xml::escape::escape;
use quick_xml::se::Serializer;
use serde_derive::Serialize;
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const WITH_DEFAULTS_NAMESPACE: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-with-defaults";

/// An RPC operation: anything that can serialize its payload XML for the
/// `<rpc>` envelope.
pub trait Operation {
    fn to_xml(&self) -> Result<String>;
}

fn serialize_operation<T: serde::Serialize>(root: &'static str, operation: &T) -> Result<String> {
    let mut buffer = String::new();
    let ser = Serializer::with_root(&mut buffer, Some(root))?;
    operation.serialize(ser)?;
    Ok(buffer)
}

/// A NETCONF configuration datastore, RFC6241 section 5.1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Datastore {
    Candidate,
    Running,
    Startup,
    Url(String),
}

impl Datastore {
    fn write_xml(&self, out: &mut String) {
        match self {
            Datastore::Candidate => out.push_str("<candidate/>"),
            Datastore::Running => out.push_str("<running/>"),
            Datastore::Startup => out.push_str("<startup/>"),
            Datastore::Url(url) => {
                let _ = write!(out, "<url>{}</url>", escape(url));
            }
        }
    }
}

impl FromStr for Datastore {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let datastore = s.to_lowercase();
        match datastore.as_str() {
            "running" => Ok(Datastore::Running),
            "candidate" => Ok(Datastore::Candidate),
            "startup" => Ok(Datastore::Startup),
            _ => {
                if datastore.starts_with("http")
                    || datastore.starts_with("file")
                    || datastore.starts_with("ftp")
                {
                    Ok(Datastore::Url(datastore))
                } else {
                    Err(Error::new(format!(
                        "unknown datastore {:?} (expected running, candidate, startup or a url)",
                        s
                    )))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    #[serde(rename = "$value")]
    pub datastore: Datastore,
}

#[derive(Debug, Clone, Serialize)]
pub struct Target {
    #[serde(rename = "$value")]
    pub datastore: Datastore,
}

/// A `<filter>` element for `<get>` and `<get-config>`, RFC6241 section 6.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Subtree filter; the string is emitted verbatim as the filter content.
    Subtree(String),
    /// XPath filter, requires the `:xpath` capability. Namespace prefixes
    /// used in the expression map to their URIs.
    XPath {
        select: String,
        namespaces: BTreeMap<String, String>,
    },
}

impl Filter {
    pub fn subtree(content: impl Into<String>) -> Filter {
        Filter::Subtree(content.into())
    }

    pub fn xpath(select: impl Into<String>, namespaces: BTreeMap<String, String>) -> Filter {
        Filter::XPath {
            select: select.into(),
            namespaces,
        }
    }

    fn write_xml(&self, out: &mut String) {
        match self {
            Filter::Subtree(content) => {
                out.push_str("<filter type=\"subtree\">");
                out.push_str(content);
                out.push_str("</filter>");
            }
            Filter::XPath { select, namespaces } => {
                let _ = write!(out, "<filter type=\"xpath\" select=\"{}\"", escape(select));
                for (prefix, uri) in namespaces {
                    let _ = write!(out, " xmlns:{}=\"{}\"", prefix, escape(uri));
                }
                out.push_str("/>");
            }
        }
    }
}

/// `with-defaults` handling modes, RFC6243.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithDefaults {
    ReportAll,
    ReportAllTagged,
    Trim,
    Explicit,
}

impl WithDefaults {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithDefaults::ReportAll => "report-all",
            WithDefaults::ReportAllTagged => "report-all-tagged",
            WithDefaults::Trim => "trim",
            WithDefaults::Explicit => "explicit",
        }
    }

    fn write_xml(&self, out: &mut String) {
        let _ = write!(
            out,
            "<with-defaults xmlns=\"{}\">{}</with-defaults>",
            WITH_DEFAULTS_NAMESPACE,
            self.as_str()
        );
    }
}

impl FromStr for WithDefaults {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "report-all" => Ok(WithDefaults::ReportAll),
            "report-all-tagged" => Ok(WithDefaults::ReportAllTagged),
            "trim" => Ok(WithDefaults::Trim),
            "explicit" => Ok(WithDefaults::Explicit),
            _ => Err(Error::new(format!("unknown with-defaults value: {}", s))),
        }
    }
}

/// `<get>` operation, RFC6241 section 7.7.
#[derive(Debug, Clone, Default)]
pub struct Get {
    pub filter: Option<Filter>,
    pub with_defaults: Option<WithDefaults>,
}

impl Operation for Get {
    fn to_xml(&self) -> Result<String> {
        let mut out = String::from("<get>");
        if let Some(filter) = &self.filter {
            filter.write_xml(&mut out);
        }
        if let Some(defaults) = &self.with_defaults {
            defaults.write_xml(&mut out);
        }
        out.push_str("</get>");
        Ok(out)
    }
}

/// `<get-config>` operation, RFC6241 section 7.1. `source` is the datastore
/// to query.
#[derive(Debug, Clone)]
pub struct GetConfig {
    pub source: Datastore,
    pub filter: Option<Filter>,
    pub with_defaults: Option<WithDefaults>,
}

impl Operation for GetConfig {
    fn to_xml(&self) -> Result<String> {
        let mut out = String::from("<get-config><source>");
        self.source.write_xml(&mut out);
        out.push_str("</source>");
        if let Some(filter) = &self.filter {
            filter.write_xml(&mut out);
        }
        if let Some(defaults) = &self.with_defaults {
            defaults.write_xml(&mut out);
        }
        out.push_str("</get-config>");
        Ok(out)
    }
}

/// Merge strategy for `<edit-config>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultOperation {
    Merge,
    Replace,
    None,
}

impl DefaultOperation {
    fn as_str(&self) -> &'static str {
        match self {
            DefaultOperation::Merge => "merge",
            DefaultOperation::Replace => "replace",
            DefaultOperation::None => "none",
        }
    }
}

/// Validation behavior for `<edit-config>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOption {
    TestThenSet,
    Set,
    TestOnly,
}

impl TestOption {
    fn as_str(&self) -> &'static str {
        match self {
            TestOption::TestThenSet => "test-then-set",
            TestOption::Set => "set",
            TestOption::TestOnly => "test-only",
        }
    }
}

/// Error recovery behavior for `<edit-config>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOption {
    StopOnError,
    ContinueOnError,
    RollbackOnError,
}

impl ErrorOption {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorOption::StopOnError => "stop-on-error",
            ErrorOption::ContinueOnError => "continue-on-error",
            ErrorOption::RollbackOnError => "rollback-on-error",
        }
    }
}

/// Configuration payload reference used by `<edit-config>` and
/// `<copy-config>`: a datastore, or inline `<config>` content emitted
/// verbatim.
#[derive(Debug, Clone)]
pub enum ConfigRef {
    Datastore(Datastore),
    Config(String),
}

impl ConfigRef {
    fn write_xml(&self, out: &mut String) {
        match self {
            ConfigRef::Datastore(datastore) => datastore.write_xml(out),
            ConfigRef::Config(raw) => {
                out.push_str("<config>");
                out.push_str(raw);
                out.push_str("</config>");
            }
        }
    }
}

/// `<edit-config>` operation, RFC6241 section 7.2.
#[derive(Debug, Clone)]
pub struct EditConfig {
    pub target: Datastore,
    pub default_operation: Option<DefaultOperation>,
    pub test_option: Option<TestOption>,
    pub error_option: Option<ErrorOption>,
    pub config: ConfigRef,
}

impl EditConfig {
    pub fn new(target: Datastore, config: impl Into<String>) -> EditConfig {
        EditConfig {
            target,
            default_operation: None,
            test_option: None,
            error_option: None,
            config: ConfigRef::Config(config.into()),
        }
    }
}

impl Operation for EditConfig {
    fn to_xml(&self) -> Result<String> {
        let mut out = String::from("<edit-config><target>");
        self.target.write_xml(&mut out);
        out.push_str("</target>");
        if let Some(op) = self.default_operation {
            let _ = write!(out, "<default-operation>{}</default-operation>", op.as_str());
        }
        if let Some(test) = self.test_option {
            let _ = write!(out, "<test-option>{}</test-option>", test.as_str());
        }
        if let Some(error) = self.error_option {
            let _ = write!(out, "<error-option>{}</error-option>", error.as_str());
        }
        self.config.write_xml(&mut out);
        out.push_str("</edit-config>");
        Ok(out)
    }
}

/// `<copy-config>` operation, RFC6241 section 7.3.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub source: ConfigRef,
    pub target: ConfigRef,
}

impl Operation for CopyConfig {
    fn to_xml(&self) -> Result<String> {
        let mut out = String::from("<copy-config><target>");
        self.target.write_xml(&mut out);
        out.push_str("</target><source>");
        self.source.write_xml(&mut out);
        out.push_str("</source></copy-config>");
        Ok(out)
    }
}

/// `<delete-config>` operation, RFC6241 section 7.4.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteConfig {
    pub target: Target,
}

impl Operation for DeleteConfig {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("delete-config", self)
    }
}

/// `<lock>` operation, RFC6241 section 7.5.
#[derive(Debug, Clone, Serialize)]
pub struct Lock {
    pub target: Target,
}

impl Operation for Lock {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("lock", self)
    }
}

/// `<unlock>` operation, RFC6241 section 7.5.
#[derive(Debug, Clone, Serialize)]
pub struct Unlock {
    pub target: Target,
}

impl Operation for Unlock {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("unlock", self)
    }
}

/// `<validate>` operation, RFC6241 section 8.6.
#[derive(Debug, Clone, Serialize)]
pub struct Validate {
    pub source: Source,
}

impl Operation for Validate {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("validate", self)
    }
}

/// `<commit>` operation, RFC6241 section 8.3 and 8.4.
///
/// With `confirmed` set the commit must be confirmed within
/// `confirm_timeout` seconds (default 600) or it is rolled back; `persist`
/// allows confirming from another session, which then passes the same token
/// as `persist_id`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Commit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<()>,
    #[serde(rename = "confirm-timeout", skip_serializing_if = "Option::is_none")]
    pub confirm_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<String>,
    #[serde(rename = "persist-id", skip_serializing_if = "Option::is_none")]
    pub persist_id: Option<String>,
}

impl Commit {
    pub fn confirmed() -> Commit {
        Commit {
            confirmed: Some(()),
            ..Commit::default()
        }
    }
}

impl Operation for Commit {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("commit", self)
    }
}

/// `<cancel-commit>` operation, RFC6241 section 8.4.4.1.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CancelCommit {
    #[serde(rename = "persist-id", skip_serializing_if = "Option::is_none")]
    pub persist_id: Option<String>,
}

impl Operation for CancelCommit {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("cancel-commit", self)
    }
}

/// `<kill-session>` operation, RFC6241 section 7.9.
#[derive(Debug, Clone, Serialize)]
pub struct KillSession {
    #[serde(rename = "session-id")]
    pub session_id: u64,
}

impl Operation for KillSession {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("kill-session", self)
    }
}

/// `<close-session>` operation, RFC6241 section 7.8.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CloseSession;

impl Operation for CloseSession {
    fn to_xml(&self) -> Result<String> {
        serialize_operation("close-session", self)
    }
}

/// `<create-subscription>` operation, RFC5277 section 2.1.1, for starting an
/// event notification stream. The device must support the `:notification`
/// capability; inbound notifications are delivered to the handler registered
/// on the session.
#[derive(Debug, Clone, Default)]
pub struct CreateSubscription {
    pub stream: Option<String>,
    pub filter: Option<Filter>,
    pub start_time: Option<OffsetDateTime>,
    pub stop_time: Option<OffsetDateTime>,
}

impl Operation for CreateSubscription {
    fn to_xml(&self) -> Result<String> {
        let mut out = format!(
            "<create-subscription xmlns=\"{}\">",
            crate::NOTIFICATION_NAMESPACE
        );
        if let Some(stream) = &self.stream {
            let _ = write!(out, "<stream>{}</stream>", escape(stream));
        }
        if let Some(filter) = &self.filter {
            filter.write_xml(&mut out);
        }
        if let Some(start) = self.start_time {
            let _ = write!(out, "<startTime>{}</startTime>", rfc3339(start)?);
        }
        if let Some(stop) = self.stop_time {
            let _ = write!(out, "<stopTime>{}</stopTime>", rfc3339(stop)?);
        }
        out.push_str("</create-subscription>");
        Ok(out)
    }
}

fn rfc3339(t: OffsetDateTime) -> Result<String> {
    t.format(&Rfc3339)
        .map_err(|err| Error::new(format!("invalid timestamp: {}", err)))
}
