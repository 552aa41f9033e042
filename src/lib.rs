//! # netconf-client
//!
//! Async NETCONF ([RFC6241]) client: RFC6242 message framing with the
//! mid-session upgrade to chunked mode, a full-duplex session multiplexing
//! concurrent calls over one transport, typed RPC operations and SSH/TLS
//! transports. Call home ([RFC8071]) is supported for devices that dial in.
//!
//! ## Example
//!
//! ```no_run
//! use netconf_client::rpc::Datastore;
//! use netconf_client::transport::ssh::SshTransport;
//! use netconf_client::Session;
//!
//! # async fn run() -> netconf_client::Result<()> {
//! let transport = SshTransport::dial("192.0.2.1:830", "admin", "admin").await?;
//! let session = Session::open(transport).await?;
//!
//! let config = session.get_config(Datastore::Running, None).await?;
//! println!("{config}");
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [RFC6241]: https://www.rfc-editor.org/rfc/rfc6241.html
//! [RFC8071]: https://www.rfc-editor.org/rfc/rfc8071.html

pub mod callhome;
pub mod capability;
pub mod error;
pub mod framer;
pub mod message;
pub mod rpc;
pub mod session;
pub mod transport;

/// XML namespace of the base NETCONF messages.
pub const NETCONF_NAMESPACE: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
/// XML namespace of event notifications (RFC5277).
pub const NOTIFICATION_NAMESPACE: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

pub use capability::{CapabilitySet, CAP_BASE_10, CAP_BASE_11};
pub use error::{Error, Result};
pub use session::{Session, SessionConfig};
