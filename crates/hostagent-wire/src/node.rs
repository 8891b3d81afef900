//! PeerNode: TCP listener that hosts one identity and routes between peers.
//!
//! A [`PeerNode`] binds a local TCP listener. Every connection performs an
//! HMAC handshake and registers the identity it announced. Calls addressed
//! to the node's own identity go to its [`PeerHandle`]; calls addressed to
//! another attached identity are forwarded to that peer and the answer is
//! relayed back to the caller.

use crate::handshake;
use crate::message::*;
use crate::registry::{PeerEntry, PeerRegistry};
use crate::transport::{CallContext, PeerHandle, WireError};

use dashmap::DashMap;
use hostagent_types::error::{INVALID_REQUEST, UNAUTHORIZED, UNREACHABLE};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Configuration for a PeerNode.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Identity answered by the node's handle.
    pub identity: String,
    /// Pre-shared key for HMAC-SHA256 authentication.
    pub shared_secret: String,
    /// How long a forwarded call may wait for the target's answer.
    pub forward_timeout: Duration,
}

/// A call relayed to another peer, waiting for its answer.
#[derive(Debug)]
struct PendingForward {
    origin: String,
    origin_id: String,
    origin_outbox: mpsc::UnboundedSender<WireMessage>,
    target: String,
    expiry: tokio::task::AbortHandle,
}

impl PendingForward {
    /// Answer the original caller and stop the expiry timer.
    fn finish(self, resp: WireResponse) {
        self.expiry.abort();
        if self
            .origin_outbox
            .send(WireMessage::response(self.origin_id, resp))
            .is_err()
        {
            debug!(origin = %self.origin, "Caller detached before answer arrived");
        }
    }
}

/// The attached side of one inbound connection.
struct Attached {
    identity: String,
    public_key: Option<String>,
    outbox: mpsc::UnboundedSender<WireMessage>,
}

impl Attached {
    fn reply(&self, id: String, resp: WireResponse) {
        if self.outbox.send(WireMessage::response(id, resp)).is_err() {
            debug!(peer = %self.identity, "Reply dropped, peer detached");
        }
    }
}

fn error_response(code: i32, message: impl Into<String>) -> WireResponse {
    WireResponse::Error {
        code,
        message: message.into(),
    }
}

/// The local network node.
pub struct PeerNode {
    config: NodeConfig,
    registry: PeerRegistry,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    forwards: Arc<DashMap<String, PendingForward>>,
    start_time: Instant,
}

impl PeerNode {
    /// Bind the listener. Connections are not accepted until
    /// [`PeerNode::serve`] is called.
    pub async fn bind(config: NodeConfig) -> Result<Arc<Self>, WireError> {
        if config.shared_secret.is_empty() {
            return Err(WireError::HandshakeFailed(
                "node requires shared_secret. Set [network] shared_secret in config.toml".into(),
            ));
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, identity = %config.identity, "Node listening");

        Ok(Arc::new(Self {
            config,
            registry: PeerRegistry::new(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            forwards: Arc::new(DashMap::new()),
            start_time: Instant::now(),
        }))
    }

    /// Start accepting connections, handing own-identity calls to `handle`.
    pub fn serve(self: &Arc<Self>, handle: Arc<dyn PeerHandle>) -> Result<JoinHandle<()>, WireError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| WireError::NotReady(format!("node {} already serving", self.local_addr)))?;
        let node = Arc::clone(self);
        Ok(tokio::spawn(async move {
            node.accept_loop(listener, handle).await;
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound address in `tcp://host:port` form.
    pub fn vip_address(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Forwarded calls still waiting for an answer.
    pub fn pending_forwards(&self) -> usize {
        self.forwards.len()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, handle: Arc<dyn PeerHandle>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    let node = Arc::clone(&self);
                    let handle = Arc::clone(&handle);
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_inbound(stream, addr, handle).await {
                            debug!(%addr, error = %e, "Inbound connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Handle a single inbound connection: handshake, then dispatch frames
    /// until the peer goes away.
    async fn handle_inbound(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        handle: Arc<dyn PeerHandle>,
    ) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();

        let msg = read_message(&mut reader).await?;
        let (identity, public_key, protocol_version) = match msg.kind {
            WireMessageKind::Request(WireRequest::Handshake {
                identity,
                public_key,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                if let Err(e) = handshake::verify(
                    &self.config.shared_secret,
                    &identity,
                    protocol_version,
                    &nonce,
                    &auth_hmac,
                ) {
                    let resp = WireMessage::response(msg.id, error_response(UNAUTHORIZED, e.to_string()));
                    write_message(&mut writer, &resp).await?;
                    return Err(e);
                }
                (identity, public_key, protocol_version)
            }
            // Every other first frame is rejected: peers must authenticate
            // before calling anything.
            _ => {
                warn!(%addr, "Rejected unauthenticated message, handshake required");
                let resp = WireMessage::response(
                    msg.id,
                    error_response(
                        UNAUTHORIZED,
                        "Authentication required: complete HMAC handshake first",
                    ),
                );
                write_message(&mut writer, &resp).await?;
                return Err(WireError::HandshakeFailed(
                    "Rejected unauthenticated request".into(),
                ));
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let public_key = (!public_key.is_empty()).then_some(public_key);
        let entry = PeerEntry {
            identity: identity.clone(),
            public_key: public_key.clone(),
            address: addr,
            connected_at: chrono::Utc::now(),
            protocol_version,
            subscriptions: Vec::new(),
            outbox: tx.clone(),
        };
        if identity == self.config.identity || !self.registry.add_peer(entry) {
            let resp = WireMessage::response(
                msg.id,
                error_response(UNAUTHORIZED, format!("Identity {identity} is already connected")),
            );
            write_message(&mut writer, &resp).await?;
            return Err(WireError::HandshakeFailed(format!("duplicate identity {identity}")));
        }

        let ack = WireMessage::response(
            msg.id,
            handshake::node_ack(&self.config.shared_secret, &self.config.identity),
        );
        if let Err(e) = write_message(&mut writer, &ack).await {
            self.registry.remove_peer(&identity);
            return Err(e);
        }
        info!(peer = %identity, %addr, "Peer attached");

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &frame).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
        });

        let peer = Attached {
            identity,
            public_key,
            outbox: tx,
        };
        let result = self.connection_loop(&mut reader, &peer, &handle).await;
        self.detach(&peer.identity);
        writer_task.abort();
        result
    }

    async fn connection_loop<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        peer: &Attached,
        handle: &Arc<dyn PeerHandle>,
    ) -> Result<(), WireError> {
        loop {
            let msg = match read_message(reader).await {
                Ok(m) => m,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match msg.kind {
                WireMessageKind::Request(req) => self.handle_request(peer, msg.id, req, handle),
                WireMessageKind::Response(resp) => self.complete_forward(&peer.identity, msg.id, resp),
                WireMessageKind::Notification(WireNotification::ShuttingDown) => {
                    info!(peer = %peer.identity, "Peer is shutting down");
                    return Ok(());
                }
                WireMessageKind::Notification(notif) => self.handle_notification(peer, notif, handle),
            }
        }
    }

    fn handle_request(
        &self,
        peer: &Attached,
        id: String,
        req: WireRequest,
        handle: &Arc<dyn PeerHandle>,
    ) {
        match req {
            WireRequest::Call {
                peer: target,
                method,
                args,
                kwargs,
                ..
            } => {
                if target == self.config.identity {
                    let handle = Arc::clone(handle);
                    let ctx = CallContext::new(peer.identity.clone(), peer.public_key.clone());
                    let outbox = peer.outbox.clone();
                    tokio::spawn(async move {
                        let resp = match handle.handle_call(&ctx, &method, args, kwargs).await {
                            Ok(value) => WireResponse::Result { value },
                            Err(e) => error_response(e.code(), e.detail()),
                        };
                        let _ = outbox.send(WireMessage::response(id, resp));
                    });
                } else if let Some(entry) = self.registry.get_peer(&target) {
                    let forward = WireMessage::request(WireRequest::Call {
                        peer: target.clone(),
                        method,
                        args,
                        kwargs,
                        sender: Some(peer.identity.clone()),
                        sender_key: peer.public_key.clone(),
                    });
                    let forward_id = forward.id.clone();
                    let expiry = self.expire_forward(forward_id.clone(), target.clone());
                    self.forwards.insert(
                        forward_id.clone(),
                        PendingForward {
                            origin: peer.identity.clone(),
                            origin_id: id,
                            origin_outbox: peer.outbox.clone(),
                            target: target.clone(),
                            expiry,
                        },
                    );
                    if entry.outbox.send(forward).is_err() {
                        if let Some((_, pending)) = self.forwards.remove(&forward_id) {
                            pending.finish(error_response(
                                UNREACHABLE,
                                format!("Peer {target} detached"),
                            ));
                        }
                    }
                } else {
                    peer.reply(id, error_response(UNREACHABLE, format!("Unknown peer: {target}")));
                }
            }
            WireRequest::Ping { peer: target } => {
                let resp = if target == self.config.identity {
                    WireResponse::Pong {
                        identity: target,
                        uptime_secs: handle.uptime_secs(),
                    }
                } else if self.registry.contains(&target) {
                    WireResponse::Pong {
                        identity: target,
                        uptime_secs: self.start_time.elapsed().as_secs(),
                    }
                } else {
                    error_response(UNREACHABLE, format!("Unknown peer: {target}"))
                };
                peer.reply(id, resp);
            }
            WireRequest::Handshake { .. } => {
                peer.reply(id, error_response(INVALID_REQUEST, "Already handshaked"));
            }
        }
    }

    /// Fail the forwarded call `forward_id` once the forward timeout passes.
    fn expire_forward(&self, forward_id: String, target: String) -> tokio::task::AbortHandle {
        let forwards = Arc::clone(&self.forwards);
        let timeout = self.config.forward_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, pending)) = forwards.remove(&forward_id) {
                warn!(peer = %target, origin = %pending.origin, "Forwarded call expired");
                let _ = pending.origin_outbox.send(WireMessage::response(
                    pending.origin_id,
                    error_response(
                        UNREACHABLE,
                        format!("Peer {target} did not answer within {}s", timeout.as_secs()),
                    ),
                ));
            }
        })
        .abort_handle()
    }

    /// Relay a peer's answer back to whoever made the forwarded call.
    fn complete_forward(&self, from: &str, id: String, resp: WireResponse) {
        match self.forwards.remove(&id) {
            Some((_, pending)) => pending.finish(resp),
            None => warn!(peer = %from, id = %id, "Unexpected response"),
        }
    }

    fn handle_notification(
        &self,
        peer: &Attached,
        notif: WireNotification,
        handle: &Arc<dyn PeerHandle>,
    ) {
        match notif {
            WireNotification::Publish {
                topic,
                headers,
                message,
                ..
            } => {
                for sub in self.registry.subscribers(&topic, &peer.identity) {
                    let _ = sub.outbox.send(WireMessage::notification(WireNotification::Publish {
                        topic: topic.clone(),
                        headers: headers.clone(),
                        message: message.clone(),
                        sender: Some(peer.identity.clone()),
                    }));
                }
                let handle = Arc::clone(handle);
                let ctx = CallContext::new(peer.identity.clone(), peer.public_key.clone());
                tokio::spawn(async move {
                    handle.handle_publish(&ctx, &topic, &headers, &message).await;
                });
            }
            WireNotification::Subscribe { prefix } => {
                debug!(peer = %peer.identity, prefix = %prefix, "Subscribed");
                self.registry.subscribe(&peer.identity, &prefix);
            }
            WireNotification::ShuttingDown => {}
        }
    }

    /// Drop a peer and fail every forwarded call still waiting on it.
    fn detach(&self, identity: &str) {
        self.registry.remove_peer(identity);
        let orphaned: Vec<String> = self
            .forwards
            .iter()
            .filter(|f| f.value().target == identity)
            .map(|f| f.key().clone())
            .collect();
        for key in orphaned {
            if let Some((_, pending)) = self.forwards.remove(&key) {
                pending.finish(error_response(
                    UNREACHABLE,
                    format!("Peer {identity} disconnected"),
                ));
            }
        }
        info!(peer = %identity, "Peer detached");
    }
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &WireMessage,
) -> Result<(), WireError> {
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireMessage, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hostagent_types::error::PlatformError;
    use serde_json::{json, Map, Value};

    struct EchoHandle;

    #[async_trait]
    impl PeerHandle for EchoHandle {
        fn identity(&self) -> &str {
            "platform.agent"
        }

        async fn handle_call(
            &self,
            ctx: &CallContext,
            method: &str,
            args: Vec<Value>,
            _kwargs: Map<String, Value>,
        ) -> Result<Value, PlatformError> {
            match method {
                "echo" => Ok(json!({"sender": ctx.sender, "args": args})),
                other => Err(PlatformError::MethodNotFound(other.to_string())),
            }
        }

        async fn handle_publish(
            &self,
            _ctx: &CallContext,
            _topic: &str,
            _headers: &Map<String, Value>,
            _message: &Value,
        ) {
        }

        fn uptime_secs(&self) -> u64 {
            7
        }
    }

    async fn start_node() -> Arc<PeerNode> {
        start_node_with(Duration::from_secs(5)).await
    }

    async fn start_node_with(forward_timeout: Duration) -> Arc<PeerNode> {
        let node = PeerNode::bind(NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            identity: "platform.agent".to_string(),
            shared_secret: "test-secret".to_string(),
            forward_timeout,
        })
        .await
        .unwrap();
        node.serve(Arc::new(EchoHandle)).unwrap();
        node
    }

    async fn attach(
        node: &PeerNode,
        identity: &str,
    ) -> (tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf) {
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let hello = WireMessage::request(handshake::client_hello("test-secret", identity, "pk"));
        write_message(&mut writer, &hello).await.unwrap();
        let ack = read_message(&mut reader).await.unwrap();
        assert!(matches!(
            ack.kind,
            WireMessageKind::Response(WireResponse::HandshakeAck { .. })
        ));
        (reader, writer)
    }

    #[tokio::test]
    async fn test_empty_secret_refused() {
        let result = PeerNode::bind(NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            identity: "platform.agent".to_string(),
            shared_secret: String::new(),
            forward_timeout: Duration::from_secs(5),
        })
        .await;
        assert!(matches!(result, Err(WireError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_unauthenticated_call_rejected() {
        let node = start_node().await;
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let call = WireMessage::request(WireRequest::Ping {
            peer: "platform.agent".to_string(),
        });
        write_message(&mut writer, &call).await.unwrap();
        let resp = read_message(&mut reader).await.unwrap();
        match resp.kind {
            WireMessageKind::Response(WireResponse::Error { code, .. }) => {
                assert_eq!(code, UNAUTHORIZED)
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_to_host_identity() {
        let node = start_node().await;
        let (mut reader, mut writer) = attach(&node, "cli").await;

        let call = WireMessage::request(WireRequest::Call {
            peer: "platform.agent".to_string(),
            method: "echo".to_string(),
            args: vec![json!(1)],
            kwargs: Map::new(),
            sender: None,
            sender_key: None,
        });
        write_message(&mut writer, &call).await.unwrap();
        let resp = read_message(&mut reader).await.unwrap();
        assert_eq!(resp.id, call.id);
        match resp.kind {
            WireMessageKind::Response(WireResponse::Result { value }) => {
                assert_eq!(value["sender"], "cli");
                assert_eq!(value["args"], json!([1]));
            }
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_forwarded_between_peers() {
        let node = start_node().await;
        let (mut svc_reader, mut svc_writer) = attach(&node, "control").await;
        let (mut cli_reader, mut cli_writer) = attach(&node, "cli").await;

        let call = WireMessage::request(WireRequest::Call {
            peer: "control".to_string(),
            method: "list_agents".to_string(),
            args: vec![],
            kwargs: Map::new(),
            sender: None,
            sender_key: None,
        });
        write_message(&mut cli_writer, &call).await.unwrap();

        // The service sees the call with the caller filled in.
        let forwarded = read_message(&mut svc_reader).await.unwrap();
        match &forwarded.kind {
            WireMessageKind::Request(WireRequest::Call { sender, method, .. }) => {
                assert_eq!(sender.as_deref(), Some("cli"));
                assert_eq!(method, "list_agents");
            }
            other => panic!("Expected forwarded Call, got {other:?}"),
        }
        let answer = WireMessage::response(
            forwarded.id.clone(),
            WireResponse::Result {
                value: json!([{"uuid": "u1"}]),
            },
        );
        write_message(&mut svc_writer, &answer).await.unwrap();

        let resp = read_message(&mut cli_reader).await.unwrap();
        assert_eq!(resp.id, call.id);
        match resp.kind {
            WireMessageKind::Response(WireResponse::Result { value }) => {
                assert_eq!(value[0]["uuid"], "u1")
            }
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let node = start_node().await;
        let (mut reader, mut writer) = attach(&node, "cli").await;
        let ping = WireMessage::request(WireRequest::Ping {
            peer: "nobody".to_string(),
        });
        write_message(&mut writer, &ping).await.unwrap();
        let resp = read_message(&mut reader).await.unwrap();
        match resp.kind {
            WireMessageKind::Response(WireResponse::Error { code, .. }) => {
                assert_eq!(code, UNREACHABLE)
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let node = start_node().await;
        let _first = attach(&node, "control").await;

        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let hello = WireMessage::request(handshake::client_hello("test-secret", "control", ""));
        write_message(&mut writer, &hello).await.unwrap();
        let resp = read_message(&mut reader).await.unwrap();
        assert!(matches!(
            resp.kind,
            WireMessageKind::Response(WireResponse::Error { .. })
        ));
        assert_eq!(node.registry().connected_count(), 1);
    }

    #[tokio::test]
    async fn test_unanswered_forward_expires() {
        let node = start_node_with(Duration::from_millis(200)).await;
        let (mut svc_reader, _svc_writer) = attach(&node, "control").await;
        let (mut cli_reader, mut cli_writer) = attach(&node, "cli").await;

        let call = WireMessage::request(WireRequest::Call {
            peer: "control".to_string(),
            method: "status_agents".to_string(),
            args: vec![],
            kwargs: Map::new(),
            sender: None,
            sender_key: None,
        });
        write_message(&mut cli_writer, &call).await.unwrap();
        // The service receives the call and never answers.
        read_message(&mut svc_reader).await.unwrap();
        assert_eq!(node.pending_forwards(), 1);

        let resp = tokio::time::timeout(Duration::from_secs(3), read_message(&mut cli_reader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, call.id);
        match resp.kind {
            WireMessageKind::Response(WireResponse::Error { code, .. }) => {
                assert_eq!(code, UNREACHABLE)
            }
            other => panic!("Expected Error, got {other:?}"),
        }
        assert_eq!(node.pending_forwards(), 0);
        assert_eq!(node.registry().connected_count(), 2);
    }
}
