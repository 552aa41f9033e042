//! Session tests against a scripted in-memory peer. The peer side of a
//! duplex pipe plays the NETCONF server, speaking raw RFC6242 framing so the
//! whole stack from session to framer is exercised.

use netconf_client::message::{ErrorSeverity, ErrorTag, ErrorType};
use netconf_client::rpc::{Commit, Datastore, Filter, Get};
use netconf_client::transport::StreamTransport;
use netconf_client::{Error, Session, SessionConfig, CAP_BASE_10, CAP_BASE_11};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Scripted NETCONF server over the far end of a duplex pipe.
struct Peer {
    stream: DuplexStream,
    buf: Vec<u8>,
    chunked: bool,
}

impl Peer {
    fn new(stream: DuplexStream) -> Peer {
        Peer {
            stream,
            buf: Vec::new(),
            chunked: false,
        }
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .expect("peer read failed");
        assert!(n > 0, "client closed while the peer expected a message");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    async fn ensure(&mut self, n: usize) {
        while self.buf.len() < n {
            self.fill().await;
        }
    }

    async fn read_msg(&mut self) -> String {
        if self.chunked {
            self.read_chunked().await
        } else {
            self.read_marked().await
        }
    }

    async fn read_marked(&mut self) -> String {
        loop {
            if let Some(pos) = find(&self.buf, b"]]>]]>") {
                let msg = String::from_utf8(self.buf[..pos].to_vec()).unwrap();
                self.buf.drain(..pos + 6);
                return msg;
            }
            self.fill().await;
        }
    }

    async fn read_chunked(&mut self) -> String {
        let mut body = Vec::new();
        loop {
            self.ensure(3).await;
            assert_eq!(&self.buf[..2], b"\n#", "bad chunk header from client");
            if self.buf[2] == b'#' {
                self.ensure(4).await;
                assert_eq!(self.buf[3], b'\n');
                self.buf.drain(..4);
                return String::from_utf8(body).unwrap();
            }
            let mut i = 2;
            loop {
                self.ensure(i + 1).await;
                if self.buf[i] == b'\n' {
                    break;
                }
                i += 1;
            }
            let size: usize = std::str::from_utf8(&self.buf[2..i])
                .unwrap()
                .parse()
                .unwrap();
            self.buf.drain(..i + 1);
            self.ensure(size).await;
            body.extend_from_slice(&self.buf[..size]);
            self.buf.drain(..size);
        }
    }

    async fn write_msg(&mut self, body: &str) {
        if self.chunked {
            let framed = format!("\n#{}\n{}\n##\n", body.len(), body);
            self.stream.write_all(framed.as_bytes()).await.unwrap();
        } else {
            self.stream.write_all(body.as_bytes()).await.unwrap();
            self.stream.write_all(b"]]>]]>").await.unwrap();
        }
    }

    async fn reply_ok(&mut self, message_id: &str) {
        let reply = format!(
            r#"<rpc-reply message-id="{}" xmlns="{}"><ok/></rpc-reply>"#,
            message_id, BASE_NS
        );
        self.write_msg(&reply).await;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn message_id_of(request: &str) -> String {
    let start = request
        .find("message-id=\"")
        .expect("request has no message-id")
        + "message-id=\"".len();
    let end = request[start..].find('"').unwrap() + start;
    request[start..end].to_string()
}

fn server_hello(capabilities: &[&str], session_id: u64) -> String {
    let caps: String = capabilities
        .iter()
        .map(|cap| format!("<capability>{}</capability>", cap))
        .collect();
    format!(
        r#"<hello xmlns="{}"><capabilities>{}</capabilities><session-id>{}</session-id></hello>"#,
        BASE_NS, caps, session_id
    )
}

/// Opens a session against a scripted peer advertising `server_caps`. The
/// peer switches to chunked framing when both sides support base:1.1.
async fn start_session(server_caps: &[&str], config: SessionConfig) -> (Session, Peer) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let transport = StreamTransport::new(client);
    let mut peer = Peer::new(server);
    let hello = server_hello(server_caps, 42);

    let (session, client_hello) = tokio::join!(Session::open_with(transport, config), async {
        let client_hello = peer.read_msg().await;
        peer.write_msg(&hello).await;
        client_hello
    });
    let session = session.expect("session open failed");
    assert!(client_hello.contains("<hello"));
    assert!(client_hello.contains(CAP_BASE_10));

    if server_caps.contains(&CAP_BASE_11) && client_hello.contains(CAP_BASE_11) {
        peer.chunked = true;
    }
    (session, peer)
}

#[tokio::test]
async fn hello_exchange_and_framing_upgrade() {
    let (session, mut peer) = start_session(&[CAP_BASE_11], SessionConfig::new()).await;
    assert_eq!(session.session_id(), 42);
    assert!(session.server_capabilities().has(CAP_BASE_11));

    // the next request must arrive chunk-framed
    let (result, request) = tokio::join!(session.commit(), async {
        let request = peer.read_msg().await;
        peer.reply_ok(&message_id_of(&request)).await;
        request
    });
    result.unwrap();
    assert!(request.contains("<commit/>"));
}

#[tokio::test]
async fn session_without_base_11_stays_on_end_of_message_framing() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;
    assert!(!peer.chunked);

    let (result, _) = tokio::join!(session.commit(), async {
        let request = peer.read_msg().await;
        peer.reply_ok(&message_id_of(&request)).await;
    });
    result.unwrap();
}

#[tokio::test]
async fn get_config_returns_inner_data() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let (data, request) = tokio::join!(session.get_config(Datastore::Running, None), async {
        let request = peer.read_msg().await;
        let reply = format!(
            r#"<rpc-reply message-id="{}" xmlns="{}"><data><top>X</top></data></rpc-reply>"#,
            message_id_of(&request),
            BASE_NS
        );
        peer.write_msg(&reply).await;
        request
    });

    assert_eq!(data.unwrap(), "<top>X</top>");
    assert!(request.contains(r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">"#));
    assert!(request.contains("<get-config><source><running/></source></get-config>"));
}

#[tokio::test]
async fn get_with_subtree_filter_is_sent_verbatim() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;
    let filter = r#"<top xmlns="https://example.com/schema/1.2/config"><users/></top>"#;

    let (data, request) = tokio::join!(session.get(Some(Filter::subtree(filter))), async {
        let request = peer.read_msg().await;
        let reply = format!(
            r#"<rpc-reply message-id="{}" xmlns="{}"><data/></rpc-reply>"#,
            message_id_of(&request),
            BASE_NS
        );
        peer.write_msg(&reply).await;
        request
    });
    data.unwrap();
    assert!(request.contains(&format!(r#"<filter type="subtree">{}</filter>"#, filter)));
}

#[tokio::test]
async fn confirmed_commit_with_persist() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;
    let commit = Commit {
        persist: Some("foobar".to_string()),
        ..Commit::confirmed()
    };

    let (result, request) = tokio::join!(session.commit_with(commit), async {
        let request = peer.read_msg().await;
        peer.reply_ok(&message_id_of(&request)).await;
        request
    });
    result.unwrap();
    assert!(request.contains("<commit><confirmed/><persist>foobar</persist></commit>"));
}

#[tokio::test]
async fn rpc_error_reply_fails_the_call_with_fields_intact() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let (result, _) = tokio::join!(session.get_config(Datastore::Running, None), async {
        let request = peer.read_msg().await;
        let reply = format!(
            "<rpc-reply message-id=\"{}\" xmlns=\"{}\"><rpc-error>\
             <error-type>rpc</error-type>\
             <error-tag>operation-failed</error-tag>\
             <error-severity>error</error-severity>\
             <error-message>m</error-message>\
             </rpc-error></rpc-reply>",
            message_id_of(&request),
            BASE_NS
        );
        peer.write_msg(&reply).await;
    });

    let err = result.unwrap_err();
    let Error::Rpc(errors) = err else {
        panic!("expected an rpc error, got {err:?}");
    };
    assert_eq!(errors.len(), 1);
    let error = errors.first().unwrap();
    assert_eq!(error.error_type, ErrorType::Rpc);
    assert_eq!(error.tag, ErrorTag::OperationFailed);
    assert_eq!(error.severity, ErrorSeverity::Error);
    assert_eq!(error.message.as_deref(), Some("m"));
}

#[tokio::test]
async fn warnings_do_not_fail_the_call() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let get = Get::default();
    let (result, _) = tokio::join!(session.execute(&get), async {
        let request = peer.read_msg().await;
        let reply = format!(
            "<rpc-reply message-id=\"{}\" xmlns=\"{}\"><rpc-error>\
             <error-type>application</error-type>\
             <error-tag>operation-failed</error-tag>\
             <error-severity>warning</error-severity>\
             </rpc-error><data><top/></data></rpc-reply>",
            message_id_of(&request),
            BASE_NS
        );
        peer.write_msg(&reply).await;
    });

    let reply = result.unwrap();
    assert_eq!(reply.warnings().len(), 1);
    assert_eq!(reply.data(), Some("<top/>"));
}

#[tokio::test]
async fn message_ids_count_up_from_one() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (result, id) = tokio::join!(session.execute_raw("<get/>"), async {
            let request = peer.read_msg().await;
            let id = message_id_of(&request);
            peer.reply_ok(&id).await;
            id
        });
        result.unwrap();
        seen.push(id);
    }
    assert_eq!(seen, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn interleaved_replies_reach_their_own_callers() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let call_a = session.execute_raw("<get><a/></get>");
    let call_b = session.execute_raw("<get><b/></get>");

    let ((a, b), ()) = tokio::join!(async { tokio::join!(call_a, call_b) }, async {
        let first = peer.read_msg().await;
        let second = peer.read_msg().await;
        // answer in reverse order of arrival
        for request in [&second, &first] {
            let marker = if request.contains("<a/>") { "a" } else { "b" };
            let reply = format!(
                r#"<rpc-reply message-id="{}" xmlns="{}"><data><{}/></data></rpc-reply>"#,
                message_id_of(request),
                BASE_NS,
                marker
            );
            peer.write_msg(&reply).await;
        }
    });

    let a = a.unwrap().parse().unwrap();
    let b = b.unwrap().parse().unwrap();
    assert_eq!(a.data(), Some("<a/>"));
    assert_eq!(b.data(), Some("<b/>"));
}

#[tokio::test]
async fn unknown_message_id_is_dropped_and_the_session_continues() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let (result, _) = tokio::join!(session.execute_raw("<get/>"), async {
        let request = peer.read_msg().await;
        let stray = format!(
            r#"<rpc-reply message-id="99" xmlns="{}"><ok/></rpc-reply>"#,
            BASE_NS
        );
        peer.write_msg(&stray).await;
        peer.reply_ok(&message_id_of(&request)).await;
    });
    result.unwrap();
}

#[tokio::test]
async fn cancelled_call_leaves_the_session_usable() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    // the peer stays silent, so the first call times out
    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        session.get_config(Datastore::Running, None),
    )
    .await;
    assert!(timed_out.is_err());

    let (result, _) = tokio::join!(session.execute_raw("<get/>"), async {
        let first = peer.read_msg().await;
        assert_eq!(message_id_of(&first), "1");
        // late answer for the abandoned call, then the real one
        peer.reply_ok("1").await;
        let second = peer.read_msg().await;
        assert_eq!(message_id_of(&second), "2");
        peer.reply_ok("2").await;
    });
    result.unwrap();
}

#[tokio::test]
async fn graceful_close_sends_close_session() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let (closed, request) = tokio::join!(session.close(), async {
        let request = peer.read_msg().await;
        peer.reply_ok(&message_id_of(&request)).await;
        request
    });
    closed.unwrap();
    assert!(request.contains("<close-session/>"));

    let err = session.execute_raw("<get/>").await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed), "got {err:?}");
}

#[tokio::test]
async fn close_tolerates_a_peer_that_already_hung_up() {
    let (session, peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;
    drop(peer);
    // give the receive loop a chance to observe the disconnect
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.close().await.unwrap();
}

#[tokio::test]
async fn execute_fails_once_the_peer_disconnects() {
    let (session, mut peer) = start_session(&[CAP_BASE_10], SessionConfig::new()).await;

    let (result, _) = tokio::join!(session.execute_raw("<get/>"), async {
        let _ = peer.read_msg().await;
        drop(peer);
    });
    let err = result.unwrap_err();
    assert!(matches!(err, Error::SessionClosed), "got {err:?}");
}

#[tokio::test]
async fn notifications_are_delivered_to_the_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = SessionConfig::new().on_notification(move |notification| {
        let _ = tx.send(notification);
    });
    let (session, mut peer) = start_session(&[CAP_BASE_10], config).await;

    let (result, _) = tokio::join!(session.execute_raw("<get/>"), async {
        let request = peer.read_msg().await;
        let notification = "<notification xmlns=\"urn:ietf:params:xml:ns:netconf:notification:1.0\">\
             <eventTime>2023-03-01T00:00:01Z</eventTime>\
             <event xmlns=\"http://example.com/event/1.0\"><severity>major</severity></event>\
             </notification>";
        peer.write_msg(notification).await;
        peer.reply_ok(&message_id_of(&request)).await;
    });
    result.unwrap();

    let notification = rx.recv().await.unwrap();
    assert!(notification.payload.contains("<severity>major</severity>"));
    assert_eq!(notification.event_time.year(), 2023);
}

#[tokio::test]
async fn handshake_fails_without_a_session_id() {
    let (client, server) = tokio::io::duplex(1 << 16);
    let transport = StreamTransport::new(client);
    let mut peer = Peer::new(server);

    let (session, _) = tokio::join!(Session::open(transport), async {
        let _ = peer.read_msg().await;
        let hello = format!(
            r#"<hello xmlns="{}"><capabilities><capability>{}</capability></capabilities></hello>"#,
            BASE_NS, CAP_BASE_10
        );
        peer.write_msg(&hello).await;
    });

    let err = session.unwrap_err();
    assert!(matches!(err, Error::HandshakeFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn handshake_fails_without_capabilities() {
    let (client, server) = tokio::io::duplex(1 << 16);
    let transport = StreamTransport::new(client);
    let mut peer = Peer::new(server);

    let (session, _) = tokio::join!(Session::open(transport), async {
        let _ = peer.read_msg().await;
        let hello = format!(
            r#"<hello xmlns="{}"><capabilities></capabilities><session-id>7</session-id></hello>"#,
            BASE_NS
        );
        peer.write_msg(&hello).await;
    });

    let err = session.unwrap_err();
    assert!(matches!(err, Error::HandshakeFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn custom_capabilities_replace_the_defaults() {
    let config = SessionConfig::new().with_capabilities([CAP_BASE_10]);
    let (client, server) = tokio::io::duplex(1 << 16);
    let transport = StreamTransport::new(client);
    let mut peer = Peer::new(server);
    let hello = server_hello(&[CAP_BASE_10, CAP_BASE_11], 42);

    let (session, client_hello) =
        tokio::join!(Session::open_with(transport, config), async {
            let client_hello = peer.read_msg().await;
            peer.write_msg(&hello).await;
            client_hello
        });
    let session = session.unwrap();
    assert!(!client_hello.contains(CAP_BASE_11));

    // without base:1.1 on the client side the framing must stay marked
    let (result, _) = tokio::join!(session.commit(), async {
        let request = peer.read_msg().await;
        peer.reply_ok(&message_id_of(&request)).await;
    });
    result.unwrap();
}
