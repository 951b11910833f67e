//! Relay server: accepts WebSocket connections tagged with a client type and
//! forwards JSON-RPC traffic between the two sides.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, info, warn};

use dartlink_protocol::{
    Inbound, RequestIdGen, RpcError, RpcRequest, RpcResponse, id_key, parse_frame,
};

use crate::error::{Error, Result};

/// Default deadline for server-originated calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a loop-prevention marker survives when no reply is observed.
const FORWARD_MARKER_TTL: Duration = Duration::from_secs(30);

/// Capacity of each connection's outbound channel.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the server-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Declared role of a connection, used to decide forwarding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Flutter,
    Inspector,
}

impl ClientType {
    /// The side this type's traffic is forwarded to.
    pub fn complement(self) -> Self {
        match self {
            ClientType::Flutter => ClientType::Inspector,
            ClientType::Inspector => ClientType::Flutter,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "flutter" => Some(ClientType::Flutter),
            "inspector" => Some(ClientType::Inspector),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientType::Flutter => write!(f, "flutter"),
            ClientType::Inspector => write!(f, "inspector"),
        }
    }
}

/// Connection lifecycle events emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        connection_id: String,
        client_type: ClientType,
    },
    ClientDisconnected {
        connection_id: String,
        client_type: ClientType,
    },
    ClientError {
        connection_id: String,
        message: String,
    },
}

/// Handler for a method the relay answers itself instead of forwarding.
#[async_trait]
pub trait ServerMethod: Send + Sync {
    async fn handle(&self, connection_id: &str, params: Value) -> Result<Value>;
}

struct ConnectionRecord {
    client_type: ClientType,
    outbound: mpsc::Sender<WsMessage>,
    reader: JoinHandle<()>,
}

struct PendingServerRequest {
    method: String,
    target: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct ForwardMarker {
    to: ClientType,
    at: Instant,
}

struct ListenerState {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct ServerInner {
    connections: RwLock<HashMap<String, ConnectionRecord>>,
    methods: RwLock<HashMap<String, Arc<dyn ServerMethod>>>,
    pending: Mutex<HashMap<String, PendingServerRequest>>,
    forwarded: Mutex<HashMap<String, ForwardMarker>>,
    id_gen: std::sync::Mutex<RequestIdGen>,
    events: broadcast::Sender<ServerEvent>,
    listener: Mutex<Option<ListenerState>>,
}

/// The relay between Flutter-side and inspector-side connections.
///
/// Cheap to clone; all clones share the connection table.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                connections: RwLock::new(HashMap::new()),
                methods: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                forwarded: Mutex::new(HashMap::new()),
                id_gen: std::sync::Mutex::new(RequestIdGen::new()),
                events,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Idempotent: a second `start` while running is a logged no-op that
    /// returns the existing address. Pass port 0 to bind an ephemeral port.
    pub async fn start(&self, port: u16, path: &str) -> Result<SocketAddr> {
        let mut guard = self.inner.listener.lock().await;
        if let Some(state) = guard.as_ref() {
            debug!("relay server already running on {}", state.local_addr);
            return Ok(state.local_addr);
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(run_accept_loop(
            self.inner.clone(),
            listener,
            path.to_string(),
        ));
        *guard = Some(ListenerState { task, local_addr });
        info!("relay server listening on ws://{}{}", local_addr, path);
        Ok(local_addr)
    }

    /// Address the listener is bound to, when running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// Close every tracked connection, clear the table, and stop listening.
    /// Safe to call when no listener is active.
    pub async fn stop(&self) {
        let listener = {
            let mut guard = self.inner.listener.lock().await;
            guard.take()
        };
        match listener {
            Some(state) => state.task.abort(),
            None => return,
        }

        let drained: Vec<(String, ConnectionRecord)> = {
            let mut connections = self.inner.connections.write().await;
            connections.drain().collect()
        };
        for (connection_id, record) in drained {
            record.reader.abort();
            drop(record.outbound);
            let _ = self.inner.events.send(ServerEvent::ClientDisconnected {
                connection_id,
                client_type: record.client_type,
            });
        }

        let pending: Vec<(String, PendingServerRequest)> = {
            let mut pending = self.inner.pending.lock().await;
            pending.drain().collect()
        };
        for (_, entry) in pending {
            let _ = entry.tx.send(Err(Error::NotConnected));
        }

        self.inner.forwarded.lock().await.clear();
        info!("relay server stopped");
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Register `handler` for requests the relay answers itself (e.g. the
    /// dynamic-registration call). Dispatch happens before forwarding.
    pub async fn register_method(&self, method: &str, handler: Arc<dyn ServerMethod>) {
        let mut methods = self.inner.methods.write().await;
        methods.insert(method.to_string(), handler);
    }

    /// Ids of all currently-open connections.
    pub async fn connection_ids(&self) -> Vec<String> {
        self.inner.connections.read().await.keys().cloned().collect()
    }

    /// Ids of open connections with the given type.
    pub async fn connections_of(&self, client_type: ClientType) -> Vec<String> {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.client_type == client_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Call one specific tracked connection and await its reply.
    pub async fn call_client_method(
        &self,
        connection_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        self.call_client_method_with_timeout(connection_id, method, params, DEFAULT_CALL_TIMEOUT)
            .await
    }

    pub async fn call_client_method_with_timeout(
        &self,
        connection_id: &str,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let sender = {
            let connections = self.inner.connections.read().await;
            connections
                .get(connection_id)
                .map(|record| record.outbound.clone())
        };
        let sender = sender.ok_or_else(|| Error::ClientNotFound(connection_id.to_string()))?;

        let id = {
            let mut id_gen = self.inner.id_gen.lock().unwrap_or_else(|e| e.into_inner());
            id_gen.next_id()
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(
                id.clone(),
                PendingServerRequest {
                    method: method.to_string(),
                    target: connection_id.to_string(),
                    tx,
                },
            );
        }

        let request = RpcRequest::new(id.clone(), method, params);
        let text = serde_json::to_string(&request)?;
        if sender.send(WsMessage::Text(text.into())).await.is_err() {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(&id);
            return Err(Error::ClientNotFound(connection_id.to_string()));
        }

        // The connection can close between taking the sender and the insert
        // landing; re-check so the slot is not stranded until the deadline.
        if !self.inner.connections.read().await.contains_key(connection_id) {
            let mut pending = self.inner.pending.lock().await;
            if pending.remove(&id).is_some() {
                return Err(Error::ClientNotFound(connection_id.to_string()));
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(reply) => reply.map_err(|_| Error::NotConnected)?,
            Err(_) => {
                let mut pending = self.inner.pending.lock().await;
                pending.remove(&id);
                Err(Error::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Call every open connection concurrently and collect each outcome
    /// independently; one connection's failure never hides another's result.
    pub async fn broadcast_method(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> HashMap<String, Result<Value>> {
        let targets = self.connection_ids().await;
        let calls = targets.into_iter().map(|connection_id| {
            let params = params.clone();
            async move {
                let outcome = self
                    .call_client_method(&connection_id, method, params)
                    .await;
                (connection_id, outcome)
            }
        });
        futures::future::join_all(calls).await.into_iter().collect()
    }
}

async fn run_accept_loop(inner: Arc<ServerInner>, listener: TcpListener, path: String) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let inner = inner.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(inner, stream, peer_addr, &path).await {
                        debug!("connection from {} ended with error: {}", peer_addr, err);
                    }
                });
            }
            Err(err) => {
                warn!("accept failed: {}", err);
            }
        }
    }
}

/// Pull `clientType` / `clientId` out of a handshake query string.
fn parse_handshake_params(query: Option<&str>) -> (Option<ClientType>, Option<String>) {
    let mut client_type = None;
    let mut client_id = None;
    if let Some(query) = query {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            match key {
                "clientType" => client_type = ClientType::parse(value),
                "clientId" if !value.is_empty() => client_id = Some(value.to_string()),
                _ => {}
            }
        }
    }
    (client_type, client_id)
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    expected_path: &str,
) -> Result<()> {
    let mut query: Option<String> = None;
    let mut request_path = String::new();
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        request_path = req.uri().path().to_string();
        query = req.uri().query().map(|q| q.to_string());
        Ok(resp)
    })
    .await
    .map_err(|err| Error::Connection(format!("handshake with {}: {}", peer_addr, err)))?;

    if !expected_path.is_empty() && request_path != expected_path {
        debug!(
            "connection from {} requested {} instead of {}",
            peer_addr, request_path, expected_path
        );
    }

    let (declared_type, declared_id) = parse_handshake_params(query.as_deref());
    let client_type = declared_type.unwrap_or_else(|| {
        warn!(
            "connection from {} declared no valid clientType, defaulting to inspector",
            peer_addr
        );
        ClientType::Inspector
    });
    let mut connection_id = declared_id.unwrap_or_else(|| peer_addr.to_string());

    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_CHANNEL_CAPACITY);
    let (sink, read_stream) = ws.split();
    tokio::spawn(run_connection_writer(sink, out_rx));

    {
        let mut connections = inner.connections.write().await;
        if connections.contains_key(&connection_id) {
            let unique = format!("{}-{}", connection_id, uuid::Uuid::new_v4().simple());
            warn!(
                "connection id {} already in use, assigning {}",
                connection_id, unique
            );
            connection_id = unique;
        }
        let reader = tokio::spawn(run_connection_reader(
            inner.clone(),
            read_stream,
            connection_id.clone(),
            client_type,
        ));
        connections.insert(
            connection_id.clone(),
            ConnectionRecord {
                client_type,
                outbound: out_tx,
                reader,
            },
        );
    }

    info!("client connected: {} ({})", connection_id, client_type);
    let _ = inner.events.send(ServerEvent::ClientConnected {
        connection_id: connection_id.clone(),
        client_type,
    });
    notify_peers(
        &inner,
        client_type.complement(),
        "client.connected",
        &connection_id,
        client_type,
    )
    .await;
    Ok(())
}

async fn run_connection_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
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

async fn run_connection_reader(
    inner: Arc<ServerInner>,
    mut stream: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    connection_id: String,
    client_type: ClientType,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                handle_frame(&inner, &connection_id, client_type, text.as_str()).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {
                // Ping/Pong/Binary
            }
            Err(err) => {
                warn!("client {} transport error: {}", connection_id, err);
                let _ = inner.events.send(ServerEvent::ClientError {
                    connection_id: connection_id.clone(),
                    message: err.to_string(),
                });
                break;
            }
        }
    }

    // Remove the record before anything else so no forwarding decision can
    // pick this connection up again.
    {
        let mut connections = inner.connections.write().await;
        connections.remove(&connection_id);
    }

    // Reject server-originated calls that were waiting on this connection.
    let orphaned: Vec<PendingServerRequest> = {
        let mut pending = inner.pending.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.target == connection_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    };
    for entry in orphaned {
        debug!(
            "rejecting pending call {} to {}: disconnected",
            entry.method, connection_id
        );
        let _ = entry.tx.send(Err(Error::NotConnected));
    }

    info!("client disconnected: {} ({})", connection_id, client_type);
    let _ = inner.events.send(ServerEvent::ClientDisconnected {
        connection_id: connection_id.clone(),
        client_type,
    });
    notify_peers(
        &inner,
        client_type.complement(),
        "client.disconnected",
        &connection_id,
        client_type,
    )
    .await;
}

/// Send a lifecycle notification to every connection of `to`.
async fn notify_peers(
    inner: &Arc<ServerInner>,
    to: ClientType,
    method: &str,
    connection_id: &str,
    client_type: ClientType,
) {
    let notification = RpcRequest::notification(
        method,
        Some(serde_json::json!({
            "connectionId": connection_id,
            "clientType": client_type,
        })),
    );
    let text = match serde_json::to_string(&notification) {
        Ok(text) => text,
        Err(_) => return,
    };
    deliver_to_type(inner, to, &text).await;
}

/// Relay a raw frame to every open connection of `to`.
async fn deliver_to_type(inner: &Arc<ServerInner>, to: ClientType, text: &str) {
    let targets: Vec<(String, mpsc::Sender<WsMessage>)> = {
        let connections = inner.connections.read().await;
        connections
            .iter()
            .filter(|(_, record)| record.client_type == to)
            .map(|(id, record)| (id.clone(), record.outbound.clone()))
            .collect()
    };
    for (connection_id, sender) in targets {
        if sender
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .is_err()
        {
            debug!("failed to deliver frame to {}", connection_id);
        }
    }
}

async fn handle_frame(
    inner: &Arc<ServerInner>,
    connection_id: &str,
    client_type: ClientType,
    text: &str,
) {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("client {} sent unparseable frame: {}", connection_id, err);
            // No id is recoverable, so the reply carries a null id.
            let reply = RpcResponse::err(None, RpcError::parse_error(err.to_string()));
            reply_to(inner, connection_id, &reply).await;
            return;
        }
    };

    match frame {
        Inbound::Request(request) => {
            let handler = {
                let methods = inner.methods.read().await;
                methods.get(&request.method).cloned()
            };
            match handler {
                Some(handler) => {
                    dispatch_server_method(inner, connection_id, handler, request);
                }
                None => forward_request(inner, client_type, request, text).await,
            }
        }
        Inbound::Notification(request) => {
            let handler = {
                let methods = inner.methods.read().await;
                methods.get(&request.method).cloned()
            };
            match handler {
                Some(handler) => {
                    // Notification: run the handler, nothing to send back.
                    let connection_id = connection_id.to_string();
                    tokio::spawn(async move {
                        let params = request.params.unwrap_or(Value::Null);
                        if let Err(err) = handler.handle(&connection_id, params).await {
                            warn!("notification handler {} failed: {}", request.method, err);
                        }
                    });
                }
                // Notifications carry no id, so the loop-prevention marker
                // does not apply; they are relayed as-is.
                None => deliver_to_type(inner, client_type.complement(), text).await,
            }
        }
        Inbound::Reply(reply) => handle_reply(inner, client_type, reply, text).await,
        Inbound::Other(value) => {
            debug!("client {} sent unrecognized frame: {}", connection_id, value);
        }
    }
}

/// Answer a request the relay handles itself, on its own task.
fn dispatch_server_method(
    inner: &Arc<ServerInner>,
    connection_id: &str,
    handler: Arc<dyn ServerMethod>,
    request: RpcRequest,
) {
    let inner = inner.clone();
    let connection_id = connection_id.to_string();
    tokio::spawn(async move {
        let params = request.params.unwrap_or(Value::Null);
        let reply = match handler.handle(&connection_id, params).await {
            Ok(result) => RpcResponse::ok(request.id, result),
            Err(err) => RpcResponse::err(request.id, err.to_rpc_error()),
        };
        reply_to(&inner, &connection_id, &reply).await;
    });
}

async fn reply_to(inner: &Arc<ServerInner>, connection_id: &str, reply: &RpcResponse) {
    let sender = {
        let connections = inner.connections.read().await;
        connections
            .get(connection_id)
            .map(|record| record.outbound.clone())
    };
    let Some(sender) = sender else {
        debug!("client {} vanished before reply could be sent", connection_id);
        return;
    };
    match serde_json::to_string(reply) {
        Ok(text) => {
            let _ = sender.send(WsMessage::Text(text.into())).await;
        }
        Err(err) => warn!("failed to serialize reply: {}", err),
    }
}

/// Relay a request to the complementary side, unless it is a bounce of a
/// message the relay itself just forwarded in this direction.
async fn forward_request(
    inner: &Arc<ServerInner>,
    from: ClientType,
    request: RpcRequest,
    text: &str,
) {
    let to = from.complement();
    if let Some(id) = request.id.as_ref() {
        let key = id_key(id);
        let mut forwarded = inner.forwarded.lock().await;
        prune_markers(&mut forwarded);
        if let Some(marker) = forwarded.get(&key) {
            if marker.to == from {
                debug!("loop prevented: id {} bounced back from {}", key, from);
                return;
            }
        }
        forwarded.insert(
            key,
            ForwardMarker {
                to,
                at: Instant::now(),
            },
        );
    }
    deliver_to_type(inner, to, text).await;
}

/// Route a reply: server-originated calls resolve their pending slot; relayed
/// calls flow back to the complementary side and clear their marker.
async fn handle_reply(inner: &Arc<ServerInner>, from: ClientType, reply: RpcResponse, text: &str) {
    let key = match reply.id.as_ref() {
        Some(id) => id_key(id),
        None => return,
    };

    let entry = {
        let mut pending = inner.pending.lock().await;
        pending.remove(&key)
    };
    if let Some(entry) = entry {
        let _ = entry.tx.send(reply.into_result().map_err(Error::Rpc));
        return;
    }

    {
        let mut forwarded = inner.forwarded.lock().await;
        if let Some(marker) = forwarded.get(&key) {
            if marker.to == from {
                forwarded.remove(&key);
            }
        }
    }
    deliver_to_type(inner, from.complement(), text).await;
}

fn prune_markers(forwarded: &mut HashMap<String, ForwardMarker>) {
    forwarded.retain(|_, marker| marker.at.elapsed() < FORWARD_MARKER_TTL);
}
