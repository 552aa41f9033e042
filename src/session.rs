//! A NETCONF session to one device: hello handshake, message-id assignment,
//! request/reply correlation and graceful shutdown.
//!
//! The session is full duplex. Any number of tasks may issue calls
//! concurrently; requests are serialized on the write side while a single
//! background task drains the inbound stream and routes each reply to the
//! caller waiting on its message-id. Server-initiated notifications are
//! handed to the handler registered at open time.

use crate::capability::{CapabilitySet, CAP_BASE_11, DEFAULT_CAPABILITIES};
use crate::error::{Error, Result};
use crate::message::{render_rpc, root_element, ErrorSeverity, Hello, Notification, RpcReply};
use crate::rpc::{self, Datastore, Filter, Operation, Source, Target};
use crate::transport::Transport;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Callback invoked once per inbound `<notification>`, from the receive
/// task. Blocking here stalls the session's inbound processing.
pub type NotificationHandler = Box<dyn Fn(Notification) + Send + Sync>;

/// Options applied when opening a session.
pub struct SessionConfig {
    capabilities: Vec<String>,
    notification_handler: Option<NotificationHandler>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            capabilities: DEFAULT_CAPABILITIES
                .iter()
                .map(|cap| cap.to_string())
                .collect(),
            notification_handler: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig::default()
    }

    /// Replaces the advertised client capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> SessionConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a handler for server-initiated notifications.
    pub fn on_notification<F>(mut self, handler: F) -> SessionConfig
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.notification_handler = Some(Box::new(handler));
        self
    }
}

/// A raw reply to a single call: the complete `<rpc-reply>` document,
/// correlated by message-id but not yet decoded.
#[derive(Debug)]
pub struct Response {
    pub message_id: String,
    pub body: String,
}

impl Response {
    pub fn parse(&self) -> Result<RpcReply> {
        RpcReply::parse(&self.body)
    }
}

struct PendingTable {
    reqs: HashMap<String, oneshot::Sender<Response>>,
    closed: bool,
}

struct Shared {
    pending: Mutex<PendingTable>,
    closing: AtomicBool,
}

/// Removes the pending entry when a call is abandoned before its reply
/// arrives (future dropped, write failure). A removal after normal delivery
/// is a no-op since message-ids are never reused.
struct PendingGuard<'a> {
    shared: &'a Shared,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().reqs.remove(self.message_id);
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    write_lock: tokio::sync::Mutex<()>,
    seq: AtomicU64,
    session_id: u64,
    client_caps: CapabilitySet,
    server_caps: CapabilitySet,
    recv_task: JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("client_caps", &self.client_caps)
            .field("server_caps", &self.server_caps)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a session over the transport: exchanges hello messages,
    /// upgrades the framing if both peers advertise `base:1.1` and starts
    /// the receive task. The transport is closed again if any step fails.
    ///
    /// No timeout is applied; wrap the call in [`tokio::time::timeout`] when
    /// one is needed.
    pub async fn open<T: Transport + 'static>(transport: T) -> Result<Session> {
        Session::open_with(transport, SessionConfig::new()).await
    }

    pub async fn open_with<T: Transport + 'static>(
        transport: T,
        config: SessionConfig,
    ) -> Result<Session> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let client_caps = CapabilitySet::new(config.capabilities.iter());

        let (session_id, server_caps) = match handshake(transport.as_ref(), &client_caps).await {
            Ok(handshake) => handshake,
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    debug!("failed to close transport: {}", close_err);
                }
                return Err(err);
            }
        };

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable {
                reqs: HashMap::new(),
                closed: false,
            }),
            closing: AtomicBool::new(false),
        });

        let recv_task = tokio::spawn(recv_loop(
            transport.clone(),
            shared.clone(),
            config.notification_handler,
        ));

        Ok(Session {
            transport,
            shared,
            write_lock: tokio::sync::Mutex::new(()),
            seq: AtomicU64::new(0),
            session_id,
            client_caps,
            server_caps,
            recv_task,
        })
    }

    /// The session-id assigned by the server in its hello message.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_capabilities(&self) -> &CapabilitySet {
        &self.client_caps
    }

    pub fn server_capabilities(&self) -> &CapabilitySet {
        &self.server_caps
    }

    /// Issues an operation and decodes the reply. Replies carrying an
    /// `<rpc-error>` of severity `error` fail the call with [`Error::Rpc`]
    /// holding every such error; warnings stay accessible on the returned
    /// reply.
    pub async fn execute<O: Operation>(&self, operation: &O) -> Result<RpcReply> {
        let payload = operation.to_xml()?;
        let response = self.execute_raw(&payload).await?;
        let reply = response.parse()?;
        let fatal = reply.errors().filter(ErrorSeverity::Error);
        if !fatal.is_empty() {
            return Err(Error::Rpc(fatal));
        }
        Ok(reply)
    }

    /// Issues a raw operation payload and returns the undecoded reply. This
    /// is the low-level entry point; `operation` is placed verbatim inside
    /// the `<rpc>` envelope.
    ///
    /// Dropping the returned future (e.g. from [`tokio::time::timeout`])
    /// cancels the call: the pending entry is removed and a late reply is
    /// dropped. Cancellation never affects other calls or the session.
    pub async fn execute_raw(&self, operation: &str) -> Result<Response> {
        self.dispatch(operation, &[], true).await
    }

    /// Like [`execute_raw`], with extra attributes placed verbatim on the
    /// `<rpc>` envelope. Per RFC6241 section 4.1 the server reflects them on
    /// the matching `<rpc-reply>`.
    ///
    /// [`execute_raw`]: Session::execute_raw
    pub async fn execute_raw_with_attributes(
        &self,
        operation: &str,
        attributes: &[(String, String)],
    ) -> Result<Response> {
        self.dispatch(operation, attributes, true).await
    }

    async fn dispatch(
        &self,
        operation: &str,
        attributes: &[(String, String)],
        check_closing: bool,
    ) -> Result<Response> {
        if check_closing && self.shared.closing.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let message_id = (self.seq.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(Error::SessionClosed);
            }
            pending.reqs.insert(message_id.clone(), tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            message_id: &message_id,
        };

        let message = render_rpc(&message_id, attributes, operation);
        debug!("rpc {}:\n{}", message_id, message);
        {
            let _serialized = self.write_lock.lock().await;
            let mut writer = self.transport.message_writer().await?;
            writer.write_all(message.as_bytes()).await?;
            writer.close().await?;
        }

        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Gracefully closes the session: sends `<close-session/>`, waits for
    /// the reply best-effort and closes the transport. Errors indicating the
    /// peer already hung up are swallowed.
    pub async fn close(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);

        let payload = rpc::CloseSession.to_xml()?;
        if let Err(err) = self.dispatch(&payload, &[], false).await {
            debug!("close-session request failed: {}", err);
        }

        match self.transport.close().await {
            Ok(()) => Ok(()),
            Err(Error::Io(err)) if is_disconnect(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// `<get>`: returns the verbatim `<data>` content of the reply.
    pub async fn get(&self, filter: Option<Filter>) -> Result<String> {
        let reply = self
            .execute(&rpc::Get {
                filter,
                with_defaults: None,
            })
            .await?;
        Ok(reply.data().unwrap_or_default().to_string())
    }

    /// `<get-config>`: returns the verbatim `<data>` content of the reply.
    pub async fn get_config(&self, source: Datastore, filter: Option<Filter>) -> Result<String> {
        let reply = self
            .execute(&rpc::GetConfig {
                source,
                filter,
                with_defaults: None,
            })
            .await?;
        Ok(reply.data().unwrap_or_default().to_string())
    }

    pub async fn edit_config(&self, edit: rpc::EditConfig) -> Result<()> {
        let reply = self.execute(&edit).await?;
        require_ok("edit-config", &reply)
    }

    pub async fn copy_config(&self, copy: rpc::CopyConfig) -> Result<()> {
        let reply = self.execute(&copy).await?;
        require_ok("copy-config", &reply)
    }

    pub async fn delete_config(&self, target: Datastore) -> Result<()> {
        let reply = self
            .execute(&rpc::DeleteConfig {
                target: Target { datastore: target },
            })
            .await?;
        require_ok("delete-config", &reply)
    }

    pub async fn lock(&self, target: Datastore) -> Result<()> {
        let reply = self
            .execute(&rpc::Lock {
                target: Target { datastore: target },
            })
            .await?;
        require_ok("lock", &reply)
    }

    pub async fn unlock(&self, target: Datastore) -> Result<()> {
        let reply = self
            .execute(&rpc::Unlock {
                target: Target { datastore: target },
            })
            .await?;
        require_ok("unlock", &reply)
    }

    pub async fn validate(&self, source: Datastore) -> Result<()> {
        let reply = self
            .execute(&rpc::Validate {
                source: Source { datastore: source },
            })
            .await?;
        require_ok("validate", &reply)
    }

    pub async fn commit(&self) -> Result<()> {
        self.commit_with(rpc::Commit::default()).await
    }

    pub async fn commit_with(&self, commit: rpc::Commit) -> Result<()> {
        let reply = self.execute(&commit).await?;
        require_ok("commit", &reply)
    }

    pub async fn cancel_commit(&self, persist_id: Option<String>) -> Result<()> {
        let reply = self.execute(&rpc::CancelCommit { persist_id }).await?;
        require_ok("cancel-commit", &reply)
    }

    pub async fn kill_session(&self, session_id: u64) -> Result<()> {
        let reply = self.execute(&rpc::KillSession { session_id }).await?;
        require_ok("kill-session", &reply)
    }

    /// Starts an event notification subscription. Inbound notifications are
    /// delivered to the handler registered with
    /// [`SessionConfig::on_notification`].
    pub async fn create_subscription(&self, subscription: rpc::CreateSubscription) -> Result<()> {
        let reply = self.execute(&subscription).await?;
        require_ok("create-subscription", &reply)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.shared.closing.load(Ordering::SeqCst) {
            debug!("session dropped without close");
        }
        self.recv_task.abort();
    }
}

fn require_ok(operation: &str, reply: &RpcReply) -> Result<()> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(Error::new(format!(
            "{}: operation failed, <ok/> not received",
            operation
        )))
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

async fn handshake(
    transport: &dyn Transport,
    client_caps: &CapabilitySet,
) -> Result<(u64, CapabilitySet)> {
    let hello = Hello::new(client_caps.iter().map(str::to_string).collect());
    let mut writer = transport.message_writer().await?;
    writer.write_all(hello.to_string().as_bytes()).await?;
    writer.close().await?;

    let mut reader = transport.message_reader().await?;
    let raw = reader.read_to_string().await?;
    reader.close().await?;
    debug!("server hello:\n{}", raw.trim());

    let server: Hello = quick_xml::de::from_str(&raw)?;
    let session_id = server
        .session_id()
        .filter(|id| *id != 0)
        .ok_or_else(|| Error::HandshakeFailed("server did not return a session-id".to_string()))?;
    if server.capabilities().is_empty() {
        return Err(Error::HandshakeFailed(
            "server did not return any capabilities".to_string(),
        ));
    }
    let server_caps = CapabilitySet::new(server.capabilities());

    if client_caps.has(CAP_BASE_11) && server_caps.has(CAP_BASE_11) && transport.supports_upgrade()
    {
        transport.upgrade()?;
    }

    Ok((session_id, server_caps))
}

/// Drains the inbound stream, one message at a time, until the transport
/// fails or closes. On exit every waiting caller is woken with
/// [`Error::SessionClosed`] and the transport is closed.
async fn recv_loop(
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    handler: Option<NotificationHandler>,
) {
    loop {
        if let Err(err) = recv_msg(transport.as_ref(), &shared, handler.as_ref()).await {
            if shared.closing.load(Ordering::SeqCst) {
                debug!("receive loop stopped: {}", err);
            } else {
                error!("failed to receive message: {}", err);
            }
            break;
        }
    }

    {
        let mut pending = shared.pending.lock();
        pending.closed = true;
        // dropping the reply channels wakes the waiters
        pending.reqs.clear();
    }
    if let Err(err) = transport.close().await {
        debug!("failed to close transport: {}", err);
    }
    if !shared.closing.load(Ordering::SeqCst) {
        warn!("connection closed unexpectedly");
    }
}

async fn recv_msg(
    transport: &dyn Transport,
    shared: &Shared,
    handler: Option<&NotificationHandler>,
) -> Result<()> {
    let mut reader = transport.message_reader().await?;
    let body = reader.read_to_string().await?;
    reader.close().await?;

    let root = root_element(&body)?;
    let namespace = root.namespace.as_deref().unwrap_or_default();
    if namespace == crate::NETCONF_NAMESPACE && root.local == "rpc-reply" {
        let Some(message_id) = root.message_id else {
            warn!("rpc-reply without message-id; dropping message");
            return Ok(());
        };
        let waiter = shared.pending.lock().reqs.remove(&message_id);
        match waiter {
            Some(tx) => {
                let response = Response {
                    message_id: message_id.clone(),
                    body,
                };
                if tx.send(response).is_err() {
                    debug!("dropping reply for cancelled request {}", message_id);
                }
            }
            None => warn!(
                "unexpected rpc-reply with message-id {} (request cancelled or timed out?)",
                message_id
            ),
        }
    } else if namespace == crate::NOTIFICATION_NAMESPACE && root.local == "notification" {
        match handler {
            Some(handler) => match Notification::parse(&body) {
                Ok(notification) => handler(notification),
                Err(err) => warn!("failed to decode notification: {}", err),
            },
            None => debug!("no notification handler registered; dropping notification"),
        }
    } else {
        warn!("unknown message root <{}>; dropping message", root.local);
    }
    Ok(())
}
