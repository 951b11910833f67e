//! Correlated-call client: one WebSocket connection that multiplexes
//! outbound JSON-RPC calls and dispatches inbound ones to local handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use dartlink_protocol::{Inbound, RequestIdGen, RpcRequest, RpcResponse, id_key, parse_frame};

use crate::error::{Error, Result};
use crate::supervisor::{self, SupervisorHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the outbound message channel.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the connection-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Target endpoint of a correlated client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            host: host.into(),
            port,
            path,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }

    /// Endpoint for a relay connection, declaring this client's type and id
    /// as handshake query parameters. A random UUID id is generated when the
    /// caller supplies none.
    pub fn for_relay(
        host: impl Into<String>,
        port: u16,
        path: &str,
        client_type: crate::server::ClientType,
        client_id: Option<String>,
    ) -> Self {
        let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let base = if path.is_empty() { "/" } else { path };
        Self::new(
            host,
            port,
            format!("{}?clientType={}&clientId={}", base, client_type, client_id),
        )
    }

    /// Parse a `ws://host:port/path` URI, e.g. the one `flutter run` prints
    /// for the VM Service.
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("ws://")?;
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        let (host, port) = authority.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?, path))
    }
}

/// Handler for one inbound method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value>;
}

/// Adapter so plain async functions can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, params: Value) -> Result<Value> {
        (self.0)(params).await
    }
}

/// Current connection state of an [`RpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Lifecycle and dispatch events observable on a client.
///
/// `MethodCalled` is the per-method sub-topic: subscribers match on the
/// carried name instead of a string-keyed event registry.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    MethodCalled { method: String },
}

/// Tunables for a correlated client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Re-dial the last endpoint on unexpected closure.
    pub auto_reconnect: bool,
    /// Interval between reconnect attempts.
    pub reconnect_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(2),
        }
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct ClientInner {
    config: ClientConfig,
    state: std::sync::RwLock<ConnectionState>,
    endpoint: std::sync::RwLock<Option<Endpoint>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    outbound: Mutex<Option<mpsc::Sender<WsMessage>>>,
    id_gen: std::sync::Mutex<RequestIdGen>,
    events: broadcast::Sender<ClientEvent>,
    supervisor: std::sync::Mutex<Option<SupervisorHandle>>,
    /// Bumped on every successful connect so a finished read task can tell
    /// whether it still owns the connection it is cleaning up after.
    generation: AtomicU64,
}

/// A JSON-RPC endpoint over one WebSocket connection.
///
/// Cheap to clone; all clones share the connection, the pending-request
/// table, and the handler table.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: std::sync::RwLock::new(ConnectionState::Disconnected),
                endpoint: std::sync::RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                id_gen: std::sync::Mutex::new(RequestIdGen::new()),
                events,
                supervisor: std::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to connection lifecycle and dispatch events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Connect to `ws://host:port/path`.
    ///
    /// Idempotent: returns immediately when already connected. A failed dial
    /// still arms the reconnection supervisor (unless `auto_reconnect` is
    /// off), so the connection converges once the peer appears.
    pub async fn connect(&self, host: &str, port: u16, path: &str) -> Result<()> {
        self.connect_endpoint(Endpoint::new(host, port, path)).await
    }

    /// Connect to an already-built [`Endpoint`].
    pub async fn connect_to(&self, endpoint: Endpoint) -> Result<()> {
        self.connect_endpoint(endpoint).await
    }

    /// Re-dial the last endpoint. Used by the reconnection supervisor.
    pub async fn connect_last(&self) -> Result<()> {
        let endpoint = self
            .inner
            .endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::NotConnected)?;
        self.connect_endpoint(endpoint).await
    }

    async fn connect_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        // Remember the target before dialing so the supervisor can retry it
        // even when this first attempt fails.
        {
            let mut guard = self
                .inner
                .endpoint
                .write()
                .unwrap_or_else(|e| e.into_inner());
            *guard = Some(endpoint.clone());
        }
        if self.inner.config.auto_reconnect {
            self.arm_supervisor();
        }

        let (ws, _response) = connect_async(endpoint.url())
            .await
            .map_err(|err| Error::Connection(format!("connect {}: {}", endpoint.url(), err)))?;

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_CHANNEL_CAPACITY);

        // Discard any stale handle: replacing the sender ends the previous
        // writer task, which closes its half of the old socket.
        {
            let mut outbound = self.inner.outbound.lock().await;
            *outbound = Some(out_tx);
        }
        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            *state = ConnectionState::Connected;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(run_write_task(sink, out_rx));
        tokio::spawn(run_read_task(self.inner.clone(), stream, generation));

        info!("connected to {}", endpoint.url());
        let _ = self.inner.events.send(ClientEvent::Connected);
        Ok(())
    }

    fn arm_supervisor(&self) {
        let mut guard = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(supervisor::arm(
                self.clone(),
                self.inner.config.reconnect_interval,
            ));
        }
    }

    /// Register `handler` for inbound requests named `method`, replacing any
    /// previous handler for that name.
    pub async fn register_method(&self, method: &str, handler: Arc<dyn MethodHandler>) {
        let mut handlers = self.inner.handlers.write().await;
        handlers.insert(method.to_string(), handler);
    }

    /// Issue a call and wait for the correlated reply.
    pub async fn call_method(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_method_with_timeout(method, params, None).await
    }

    /// Issue a call with an optional deadline.
    ///
    /// A fired deadline removes the pending entry, so a late reply is
    /// silently dropped rather than leaking the slot.
    pub async fn call_method_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let sender = {
            let outbound = self.inner.outbound.lock().await;
            outbound.clone()
        };
        let sender = match (sender, self.is_connected()) {
            (Some(sender), true) => sender,
            _ => return Err(Error::NotConnected),
        };

        let id = {
            let mut id_gen = self.inner.id_gen.lock().unwrap_or_else(|e| e.into_inner());
            id_gen.next_id()
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        let request = RpcRequest::new(id.clone(), method, params);
        let text = serde_json::to_string(&request)?;
        if sender.send(WsMessage::Text(text.into())).await.is_err() {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(&id);
            return Err(Error::NotConnected);
        }

        // A disconnect can drain the table between taking the sender and the
        // insert landing; re-check so the slot cannot outlive the connection.
        if !self.is_connected() {
            let mut pending = self.inner.pending.lock().await;
            if pending.remove(&id).is_some() {
                return Err(Error::NotConnected);
            }
        }

        match deadline {
            None => rx.await.map_err(|_| Error::NotConnected)?,
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(reply) => reply.map_err(|_| Error::NotConnected)?,
                Err(_) => {
                    let mut pending = self.inner.pending.lock().await;
                    pending.remove(&id);
                    Err(Error::Timeout {
                        method: method.to_string(),
                    })
                }
            },
        }
    }

    /// Fire-and-forget a raw frame.
    pub async fn send_message(&self, message: Value) -> Result<()> {
        let sender = {
            let outbound = self.inner.outbound.lock().await;
            outbound.clone()
        };
        let sender = sender.ok_or(Error::NotConnected)?;
        let text = serde_json::to_string(&message)?;
        sender
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Deliberately close the connection.
    ///
    /// Cancels the reconnection supervisor, closes the transport, and rejects
    /// every outstanding call.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut guard = self
                .inner
                .supervisor
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(supervisor) = supervisor {
            supervisor.cancel();
        }

        {
            let mut outbound = self.inner.outbound.lock().await;
            *outbound = None;
        }
        mark_disconnected(&self.inner).await;
    }
}

/// Flip shared state to disconnected and reject all pending calls.
async fn mark_disconnected(inner: &Arc<ClientInner>) {
    let was_connected = {
        let mut state = inner.state.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *state, ConnectionState::Disconnected) == ConnectionState::Connected
    };

    let drained: Vec<(String, PendingRequest)> = {
        let mut pending = inner.pending.lock().await;
        pending.drain().collect()
    };
    for (id, entry) in drained {
        debug!("rejecting pending call {} ({}): disconnected", entry.method, id);
        let _ = entry.tx.send(Err(Error::NotConnected));
    }

    if was_connected {
        let _ = inner.events.send(ClientEvent::Disconnected);
    }
}

async fn run_write_task(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut out_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = out_rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}

async fn run_read_task(
    inner: Arc<ClientInner>,
    mut stream: SplitStream<WsStream>,
    generation: u64,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_text(&inner, text.as_str()).await,
            Ok(WsMessage::Close(_)) => {
                debug!("received Close frame");
                break;
            }
            Ok(_) => {
                // Ping/Pong/Binary
            }
            Err(err) => {
                warn!("WebSocket read error: {}", err);
                break;
            }
        }
    }

    // Only clean up if no newer connection has replaced this one.
    if inner.generation.load(Ordering::SeqCst) == generation {
        {
            let mut outbound = inner.outbound.lock().await;
            *outbound = None;
        }
        mark_disconnected(&inner).await;
    }
}

async fn handle_text(inner: &Arc<ClientInner>, text: &str) {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropping unparseable frame: {}", err);
            return;
        }
    };

    match frame {
        Inbound::Request(request) => dispatch_request(inner, request, true),
        Inbound::Notification(request) => dispatch_request(inner, request, false),
        Inbound::Reply(reply) => resolve_reply(inner, reply).await,
        Inbound::Other(value) => {
            debug!("ignoring non-frame message: {}", value);
        }
    }
}

/// Route a reply to its pending request; duplicate and unknown ids are
/// ignored.
async fn resolve_reply(inner: &Arc<ClientInner>, reply: RpcResponse) {
    let key = match reply.id.as_ref() {
        Some(id) => id_key(id),
        None => return,
    };
    let entry = {
        let mut pending = inner.pending.lock().await;
        pending.remove(&key)
    };
    match entry {
        Some(entry) => {
            let _ = entry.tx.send(reply.into_result().map_err(Error::Rpc));
        }
        None => {
            debug!("reply for unknown request id {}", key);
        }
    }
}

/// Invoke the local handler for an inbound request on its own task.
///
/// Handler failures never reach the transport layer raw: they are converted
/// to a JSON-RPC error reply (internal error for plain failures, -32601 when
/// no handler is registered).
fn dispatch_request(inner: &Arc<ClientInner>, request: RpcRequest, wants_reply: bool) {
    let inner = inner.clone();
    tokio::spawn(async move {
        let handler = {
            let handlers = inner.handlers.read().await;
            handlers.get(&request.method).cloned()
        };

        let _ = inner.events.send(ClientEvent::MethodCalled {
            method: request.method.clone(),
        });

        let reply = match handler {
            None => {
                if !wants_reply {
                    debug!("no handler for notification {}", request.method);
                    return;
                }
                RpcResponse::err(
                    request.id,
                    dartlink_protocol::RpcError::method_not_found(&request.method),
                )
            }
            Some(handler) => {
                let params = request.params.unwrap_or(Value::Null);
                let outcome = handler.handle(params).await;
                if !wants_reply {
                    if let Err(err) = outcome {
                        warn!("notification handler {} failed: {}", request.method, err);
                    }
                    return;
                }
                match outcome {
                    Ok(result) => RpcResponse::ok(request.id, result),
                    Err(err) => RpcResponse::err(request.id, err.to_rpc_error()),
                }
            }
        };

        let sender = {
            let outbound = inner.outbound.lock().await;
            outbound.clone()
        };
        let Some(sender) = sender else {
            debug!("connection closed before reply could be sent");
            return;
        };
        match serde_json::to_string(&reply) {
            Ok(text) => {
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    debug!("connection closed before reply could be sent");
                }
            }
            Err(err) => warn!("failed to serialize reply: {}", err),
        }
    });
}
