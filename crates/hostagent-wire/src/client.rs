//! Client side of a node connection.
//!
//! A [`TcpConnection`] dials a node, authenticates, and then multiplexes
//! calls over the socket by message ID. It can optionally answer calls
//! forwarded to it through a [`PeerHandle`].

use crate::handshake;
use crate::message::*;
use crate::node::{read_message, write_message};
use crate::transport::{CallContext, PeerConnection, PeerHandle, RpcTransport, WireError};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Identity and credentials presented by outbound connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity registered with the node.
    pub identity: String,
    /// Register as `{identity}.{suffix}` with a random suffix, so several
    /// connections sharing a base identity never collide on one node.
    pub unique_suffix: bool,
    /// Public key announced in the handshake.
    pub public_key: String,
    /// Pre-shared key for the HMAC handshake.
    pub shared_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Ready,
    Closed,
}

/// Normalize `tcp://host:port[?query]` or `host:port` to `host:port`.
pub fn parse_address(address: &str) -> Result<String, WireError> {
    let trimmed = address.trim();
    let rest = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    let rest = rest.split('?').next().unwrap_or_default();
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(rest.to_string()),
        _ => Err(WireError::InvalidAddress(address.to_string())),
    }
}

/// Removes a pending call entry when the caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<WireResponse>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// One authenticated connection to a node.
pub struct TcpConnection {
    address: String,
    socket: String,
    identity: String,
    public_key: String,
    shared_secret: String,
    state: watch::Sender<ConnState>,
    outbox: mpsc::UnboundedSender<WireMessage>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<WireMessage>>>,
    pending: DashMap<String, oneshot::Sender<WireResponse>>,
    handle: Option<Arc<dyn PeerHandle>>,
}

impl TcpConnection {
    /// Create a connection object. Nothing is dialled until
    /// [`PeerConnection::run`] is spawned.
    pub fn new(
        address: &str,
        config: &ClientConfig,
        handle: Option<Arc<dyn PeerHandle>>,
    ) -> Result<Arc<Self>, WireError> {
        let socket = parse_address(address)?;
        let identity = if config.unique_suffix {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}.{}", config.identity, &suffix[..8])
        } else {
            config.identity.clone()
        };
        let (state, _) = watch::channel(ConnState::Connecting);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            address: address.to_string(),
            socket,
            identity,
            public_key: config.public_key.clone(),
            shared_secret: config.shared_secret.clone(),
            state,
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            pending: DashMap::new(),
            handle,
        }))
    }

    /// The identity this connection registered under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Ask the node to forward publishes whose topic starts with `prefix`.
    pub fn subscribe(&self, prefix: &str) -> Result<(), WireError> {
        self.send(WireMessage::notification(WireNotification::Subscribe {
            prefix: prefix.to_string(),
        }))
    }

    /// Tell the node this side is going away.
    pub fn shutdown(&self) {
        let _ = self.send(WireMessage::notification(WireNotification::ShuttingDown));
    }

    fn send(&self, msg: WireMessage) -> Result<(), WireError> {
        if *self.state.borrow() == ConnState::Closed {
            return Err(WireError::ConnectionClosed);
        }
        self.outbox.send(msg).map_err(|_| WireError::ConnectionClosed)
    }

    async fn request(&self, req: WireRequest) -> Result<WireResponse, WireError> {
        let msg = WireMessage::request(req);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg.id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: msg.id.clone(),
        };
        self.send(msg)?;
        rx.await.map_err(|_| WireError::ConnectionClosed)
    }

    async fn drive(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<WireMessage>) -> Result<(), WireError> {
        let stream = TcpStream::connect(&self.socket).await?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = WireMessage::request(handshake::client_hello(
            &self.shared_secret,
            &self.identity,
            &self.public_key,
        ));
        write_message(&mut writer, &hello).await?;

        match read_message(&mut reader).await?.kind {
            WireMessageKind::Response(WireResponse::HandshakeAck {
                identity,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                handshake::verify(&self.shared_secret, &identity, protocol_version, &nonce, &auth_hmac)?;
                info!(address = %self.address, node = %identity, "Connected");
            }
            WireMessageKind::Response(WireResponse::Error { message, .. }) => {
                return Err(WireError::HandshakeFailed(message));
            }
            other => {
                return Err(WireError::UnexpectedResponse(format!("{other:?}")));
            }
        }
        self.state.send_replace(ConnState::Ready);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &frame).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
        });

        let result = loop {
            let msg = match read_message(&mut reader).await {
                Ok(m) => m,
                Err(WireError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            };
            self.dispatch(msg);
        };
        writer_task.abort();
        result
    }

    fn dispatch(self: &Arc<Self>, msg: WireMessage) {
        match msg.kind {
            WireMessageKind::Response(resp) => match self.pending.remove(&msg.id) {
                Some((_, tx)) => {
                    let _ = tx.send(resp);
                }
                None => debug!(id = %msg.id, "Late or unknown response"),
            },
            WireMessageKind::Request(WireRequest::Call {
                method,
                args,
                kwargs,
                sender,
                sender_key,
                ..
            }) => {
                let Some(handle) = self.handle.clone() else {
                    let _ = self.outbox.send(WireMessage::response(
                        msg.id,
                        WireResponse::Error {
                            code: hostagent_types::error::METHOD_NOT_FOUND,
                            message: format!("{} does not accept calls", self.identity),
                        },
                    ));
                    return;
                };
                let ctx = CallContext::new(sender.unwrap_or_default(), sender_key);
                let outbox = self.outbox.clone();
                let id = msg.id;
                tokio::spawn(async move {
                    let resp = match handle.handle_call(&ctx, &method, args, kwargs).await {
                        Ok(value) => WireResponse::Result { value },
                        Err(e) => WireResponse::Error {
                            code: e.code(),
                            message: e.detail(),
                        },
                    };
                    let _ = outbox.send(WireMessage::response(id, resp));
                });
            }
            WireMessageKind::Request(WireRequest::Ping { .. }) => {
                let uptime_secs = self.handle.as_ref().map(|h| h.uptime_secs()).unwrap_or(0);
                let _ = self.outbox.send(WireMessage::response(
                    msg.id,
                    WireResponse::Pong {
                        identity: self.identity.clone(),
                        uptime_secs,
                    },
                ));
            }
            WireMessageKind::Request(WireRequest::Handshake { .. }) => {
                warn!(address = %self.address, "Node sent a handshake after connect");
            }
            WireMessageKind::Notification(WireNotification::Publish {
                topic,
                headers,
                message,
                sender,
            }) => {
                if let Some(handle) = self.handle.clone() {
                    let ctx = CallContext::new(sender.unwrap_or_default(), None);
                    tokio::spawn(async move {
                        handle.handle_publish(&ctx, &topic, &headers, &message).await;
                    });
                }
            }
            WireMessageKind::Notification(WireNotification::ShuttingDown) => {
                info!(address = %self.address, "Node is shutting down");
            }
            WireMessageKind::Notification(WireNotification::Subscribe { .. }) => {}
        }
    }
}

#[async_trait]
impl PeerConnection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run(self: Arc<Self>) {
        let rx = self.outbox_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(rx) = rx else {
            return;
        };
        if let Err(e) = self.drive(rx).await {
            debug!(address = %self.address, error = %e, "Connection ended");
        }
        self.state.send_replace(ConnState::Closed);
        // Dropping the senders fails every waiting call with ConnectionClosed.
        self.pending.clear();
    }

    async fn ready(&self) -> Result<(), WireError> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnState::Ready => return Ok(()),
                ConnState::Closed => return Err(WireError::NotReady(self.address.clone())),
                ConnState::Connecting => {}
            }
            rx.changed().await.map_err(|_| WireError::ConnectionClosed)?;
        }
    }

    async fn call(
        &self,
        peer: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WireError> {
        let resp = self
            .request(WireRequest::Call {
                peer: peer.to_string(),
                method: method.to_string(),
                args,
                kwargs,
                sender: None,
                sender_key: None,
            })
            .await?;
        match resp {
            WireResponse::Result { value } => Ok(value),
            WireResponse::Error { code, message } => Err(WireError::Remote { code, message }),
            other => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        headers: Map<String, Value>,
        message: Value,
    ) -> Result<(), WireError> {
        self.send(WireMessage::notification(WireNotification::Publish {
            topic: topic.to_string(),
            headers,
            message,
            sender: None,
        }))
    }

    async fn ping(&self, peer: &str) -> Result<(), WireError> {
        match self
            .request(WireRequest::Ping {
                peer: peer.to_string(),
            })
            .await?
        {
            WireResponse::Pong { .. } => Ok(()),
            WireResponse::Error { code, message } => Err(WireError::Remote { code, message }),
            other => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

/// Opens [`TcpConnection`]s with a shared client configuration.
pub struct TcpTransport {
    config: ClientConfig,
    handle: Option<Arc<dyn PeerHandle>>,
}

impl TcpTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    /// Answer calls forwarded over opened connections with `handle`.
    pub fn with_handle(mut self, handle: Arc<dyn PeerHandle>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Open a concrete connection, keeping access to TCP-only methods.
    pub fn connect(&self, address: &str) -> Result<Arc<TcpConnection>, WireError> {
        TcpConnection::new(address, &self.config, self.handle.clone())
    }
}

impl RpcTransport for TcpTransport {
    fn open(&self, address: &str) -> Result<Arc<dyn PeerConnection>, WireError> {
        let conn: Arc<dyn PeerConnection> = self.connect(address)?;
        Ok(conn)
    }
}
