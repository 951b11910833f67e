//! End-to-end tests for the forwarding core: correlated clients talking
//! through a relay server over loopback WebSockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use dartlink_protocol::ErrorCode;
use dartlink_relay::client::{ClientConfig, Endpoint, FnHandler, RpcClient};
use dartlink_relay::registry::{
    ProcedureKind, RegisterDynamicsMethod, RegisteredProcedure, RegistryConfig, ToolRegistry,
};
use dartlink_relay::server::{ClientType, RelayServer, ServerEvent};
use dartlink_relay::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `cond` until it holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond().await {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("timed out waiting for {}", what);
}

fn no_reconnect() -> ClientConfig {
    ClientConfig {
        auto_reconnect: false,
        ..ClientConfig::default()
    }
}

async fn start_relay() -> (RelayServer, u16) {
    let server = RelayServer::new();
    let addr = server.start(0, "/ws").await.expect("bind relay");
    (server, addr.port())
}

async fn connect_as(
    server: &RelayServer,
    port: u16,
    client_type: ClientType,
    client_id: &str,
    config: ClientConfig,
) -> RpcClient {
    let client = RpcClient::new(config);
    let endpoint = Endpoint::for_relay(
        "127.0.0.1",
        port,
        "/ws",
        client_type,
        Some(client_id.to_string()),
    );
    client.connect_to(endpoint).await.expect("connect");
    let id = client_id.to_string();
    wait_for("connection to be tracked", Duration::from_secs(2), || {
        let server = server.clone();
        let id = id.clone();
        async move { server.connection_ids().await.contains(&id) }
    })
    .await;
    client
}

fn pong_handler() -> Arc<FnHandler<impl Fn(Value) -> std::future::Ready<Result<Value>> + Send + Sync>>
{
    Arc::new(FnHandler(|_params| std::future::ready(Ok(json!("pong")))))
}

#[tokio::test]
async fn test_call_is_relayed_and_answered() {
    let (server, port) = start_relay().await;

    let flutter = connect_as(&server, port, ClientType::Flutter, "app-1", no_reconnect()).await;
    flutter.register_method("ping", pong_handler()).await;

    let inspector =
        connect_as(&server, port, ClientType::Inspector, "ins-1", no_reconnect()).await;

    let result = inspector
        .call_method("ping", Some(json!({})))
        .await
        .expect("relayed call");
    assert_eq!(result, json!("pong"));

    server.stop().await;
}

#[tokio::test]
async fn test_missing_handler_rejects_with_method_not_found() {
    let (server, port) = start_relay().await;

    let _flutter = connect_as(&server, port, ClientType::Flutter, "app-1", no_reconnect()).await;
    let inspector =
        connect_as(&server, port, ClientType::Inspector, "ins-1", no_reconnect()).await;

    let err = inspector
        .call_method("missing", Some(json!({})))
        .await
        .expect_err("no handler on the far side");
    match err {
        Error::Rpc(rpc) => {
            assert_eq!(rpc.code, ErrorCode::METHOD_NOT_FOUND);
            assert!(rpc.message.contains("Method not found"));
        }
        other => panic!("expected rpc error, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_forwarding_skips_same_side_connections() {
    let (server, port) = start_relay().await;

    let flutter = connect_as(&server, port, ClientType::Flutter, "app-1", no_reconnect()).await;
    flutter.register_method("probe", pong_handler()).await;

    let other_inspector =
        connect_as(&server, port, ClientType::Inspector, "ins-2", no_reconnect()).await;
    let sibling_hit = Arc::new(AtomicBool::new(false));
    let hit = sibling_hit.clone();
    other_inspector
        .register_method(
            "probe",
            Arc::new(FnHandler(move |_params| {
                let hit = hit.clone();
                async move {
                    hit.store(true, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })),
        )
        .await;

    let inspector =
        connect_as(&server, port, ClientType::Inspector, "ins-1", no_reconnect()).await;
    let result = inspector
        .call_method("probe", Some(json!({})))
        .await
        .expect("relayed call");
    assert_eq!(result, json!("pong"));

    // The sibling inspector never saw the request.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sibling_hit.load(Ordering::SeqCst));

    server.stop().await;
}

#[tokio::test]
async fn test_echoed_request_is_not_forwarded_twice() {
    let (server, port) = start_relay().await;

    let (mut inspector, _) = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{}/ws?clientType=inspector&clientId=raw-i",
        port
    ))
    .await
    .expect("inspector handshake");
    let (mut flutter, _) = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{}/ws?clientType=flutter&clientId=raw-f",
        port
    ))
    .await
    .expect("flutter handshake");

    let request = r#"{"jsonrpc":"2.0","id":"loop-1","method":"x","params":{}}"#;
    inspector
        .send(WsMessage::Text(request.into()))
        .await
        .expect("send request");

    // The flutter side receives the forwarded request once (skipping
    // lifecycle notifications).
    let first = read_frame_with_method(&mut flutter, "x", Duration::from_secs(2))
        .await
        .expect("forwarded request");
    assert_eq!(first["id"], json!("loop-1"));

    // Echo it back unchanged: the relay must drop it instead of forwarding
    // it to the flutter side again.
    flutter
        .send(WsMessage::Text(request.into()))
        .await
        .expect("echo request");
    let again = read_frame_with_method(&mut flutter, "x", Duration::from_millis(300)).await;
    assert!(again.is_none(), "echoed request was forwarded a second time");

    server.stop().await;
}

/// Read frames until one is a request with `method`, or the deadline passes.
async fn read_frame_with_method(
    socket: &mut (impl Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
    method: &str,
    deadline: Duration,
) -> Option<Value> {
    let result = tokio::time::timeout(deadline, async {
        while let Some(Ok(frame)) = socket.next().await {
            if let WsMessage::Text(text) = frame {
                if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                    if value["method"] == json!(method) {
                        return Some(value);
                    }
                }
            }
        }
        None
    })
    .await;
    result.unwrap_or(None)
}

#[tokio::test]
async fn test_replies_resolve_by_id_not_position() {
    // A bare WebSocket peer that reads two requests, then answers them in
    // reverse order.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");
        let mut requests = Vec::new();
        while requests.len() < 2 {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).expect("request json");
                    requests.push(value);
                }
                Some(Ok(_)) => {}
                _ => return,
            }
        }
        for request in requests.iter().rev() {
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": request["method"],
            });
            ws.send(WsMessage::Text(reply.to_string().into()))
                .await
                .expect("send reply");
        }
    });

    let client = RpcClient::new(no_reconnect());
    client.connect("127.0.0.1", port, "/").await.expect("connect");

    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
    let first = {
        let client = client.clone();
        let order_tx = order_tx.clone();
        tokio::spawn(async move {
            let result = client.call_method("m1", None).await.expect("m1 reply");
            let _ = order_tx.send("m1");
            result
        })
    };
    // Make sure m1 hits the wire before m2.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let client = client.clone();
        let order_tx = order_tx.clone();
        tokio::spawn(async move {
            let result = client.call_method("m2", None).await.expect("m2 reply");
            let _ = order_tx.send("m2");
            result
        })
    };

    assert_eq!(first.await.expect("join"), json!("m1"));
    assert_eq!(second.await.expect("join"), json!("m2"));
    assert_eq!(order_rx.recv().await, Some("m2"));
    assert_eq!(order_rx.recv().await, Some("m1"));
}

#[tokio::test]
async fn test_disconnect_drains_pending_calls() {
    let (server, port) = start_relay().await;

    // No flutter connection exists, so this call can never be answered.
    let inspector =
        connect_as(&server, port, ClientType::Inspector, "ins-1", no_reconnect()).await;
    let pending = {
        let inspector = inspector.clone();
        tokio::spawn(async move { inspector.call_method("void", None).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    inspector.disconnect().await;

    let err = pending.await.expect("join").expect_err("drained call");
    assert!(matches!(err, Error::NotConnected));

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_reply_has_no_effect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");
        while let Some(Ok(frame)) = ws.next().await {
            if let WsMessage::Text(text) = frame {
                let request: Value = serde_json::from_str(text.as_str()).expect("request json");
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": "ok",
                });
                // Same reply twice: the second must be ignored.
                ws.send(WsMessage::Text(reply.to_string().into()))
                    .await
                    .expect("reply");
                ws.send(WsMessage::Text(reply.to_string().into()))
                    .await
                    .expect("duplicate reply");
            }
        }
    });

    let client = RpcClient::new(no_reconnect());
    client.connect("127.0.0.1", port, "/").await.expect("connect");

    let first = client.call_method("a", None).await.expect("first call");
    assert_eq!(first, json!("ok"));

    // The connection is still healthy after the duplicate.
    let second = client.call_method("b", None).await.expect("second call");
    assert_eq!(second, json!("ok"));
}

#[tokio::test]
async fn test_malformed_frame_does_not_break_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");
        // Truncated JSON straight after the handshake.
        ws.send(WsMessage::Text(
            r#"{"jsonrpc":"2.0","id":5,"method":"test""#.into(),
        ))
        .await
        .expect("garbage frame");
        while let Some(Ok(frame)) = ws.next().await {
            if let WsMessage::Text(text) = frame {
                let request: Value = serde_json::from_str(text.as_str()).expect("request json");
                let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": "alive"});
                ws.send(WsMessage::Text(reply.to_string().into()))
                    .await
                    .expect("reply");
            }
        }
    });

    let client = RpcClient::new(no_reconnect());
    client.connect("127.0.0.1", port, "/").await.expect("connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = client.call_method("ping", None).await.expect("still alive");
    assert_eq!(result, json!("alive"));
}

#[tokio::test]
async fn test_call_timeout_rejects_and_clears_the_slot() {
    let (server, port) = start_relay().await;
    let inspector =
        connect_as(&server, port, ClientType::Inspector, "ins-1", no_reconnect()).await;

    let err = inspector
        .call_method_with_timeout("void", None, Some(Duration::from_millis(100)))
        .await
        .expect_err("deadline fires");
    match err {
        Error::Timeout { method } => assert_eq!(method, "void"),
        other => panic!("expected timeout, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_converges_without_caller_intervention() {
    let server = RelayServer::new();
    let addr = server.start(0, "/ws").await.expect("bind");
    let port = addr.port();

    let client = RpcClient::new(ClientConfig {
        auto_reconnect: true,
        reconnect_interval: Duration::from_millis(100),
    });
    client
        .connect("127.0.0.1", port, "/ws?clientType=inspector&clientId=ins-1")
        .await
        .expect("connect");
    assert!(client.is_connected());

    server.stop().await;
    wait_for("client to notice the close", Duration::from_secs(2), || {
        let client = client.clone();
        async move { !client.is_connected() }
    })
    .await;

    // The peer reappears on the same port; the supervisor re-dials it.
    let revived = RelayServer::new();
    revived.start(port, "/ws").await.expect("rebind");
    wait_for("supervisor to reconnect", Duration::from_secs(3), || {
        let client = client.clone();
        async move { client.is_connected() }
    })
    .await;

    // Deliberate disconnect cancels supervision for good.
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.is_connected());

    revived.stop().await;
}

#[tokio::test]
async fn test_broadcast_isolates_per_connection_failures() {
    let (server, port) = start_relay().await;

    let healthy = connect_as(&server, port, ClientType::Flutter, "app-1", no_reconnect()).await;
    healthy.register_method("status", pong_handler()).await;
    let _mute = connect_as(&server, port, ClientType::Inspector, "ins-1", no_reconnect()).await;

    let outcomes = server.broadcast_method("status", Some(json!({}))).await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes.get("app-1").expect("healthy branch").as_ref().expect("ok"),
        &json!("pong")
    );
    let err = outcomes
        .get("ins-1")
        .expect("mute branch")
        .as_ref()
        .expect_err("method not found");
    assert!(matches!(err, Error::Rpc(_)));

    server.stop().await;
}

#[tokio::test]
async fn test_register_invoke_invalidate_lifecycle() {
    let (server, port) = start_relay().await;
    let registry = Arc::new(
        ToolRegistry::new(server.clone(), Vec::new(), RegistryConfig::default())
            .expect("registry"),
    );
    server
        .register_method(
            "registerDynamics",
            Arc::new(RegisterDynamicsMethod::new(registry.clone())),
        )
        .await;

    // Mirror the production wiring: owner invalidation on disconnect.
    {
        let registry = registry.clone();
        let mut events = server.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ServerEvent::ClientDisconnected { connection_id, .. } = event {
                    registry.invalidate_owner(&connection_id);
                }
            }
        });
    }

    let flutter = connect_as(&server, port, ClientType::Flutter, "app-1", no_reconnect()).await;
    flutter
        .register_method(
            "ext.say_hello",
            Arc::new(FnHandler(|_params| {
                std::future::ready(Ok(json!({"greeting": "hello"})))
            })),
        )
        .await;

    let receipt = flutter
        .call_method(
            "registerDynamics",
            Some(json!([{
                "id": "say_hello",
                "kind": "tool",
                "displayName": "Say hello",
                "invocationTarget": "ext.say_hello",
                "inputSchema": {"type": "object"},
                "outputSchema": {
                    "type": "object",
                    "properties": {"greeting": {"type": "string"}},
                    "required": ["greeting"]
                }
            }])),
        )
        .await
        .expect("registration receipt");
    assert_eq!(receipt["tools"], json!(["say_hello"]));
    assert_eq!(receipt["totalEntries"], json!(1));

    let result = registry
        .invoke("say_hello", json!({}))
        .await
        .expect("proxied invocation");
    assert_eq!(result["greeting"], json!("hello"));

    // The owner goes away; its registrations must go with it.
    flutter.disconnect().await;
    wait_for("owner invalidation", Duration::from_secs(2), || {
        let registry = registry.clone();
        async move { registry.list_all(None).is_empty() }
    })
    .await;

    let err = registry
        .invoke("say_hello", json!({}))
        .await
        .expect_err("stale procedure");
    assert!(matches!(err, Error::MethodNotFound(_)));

    server.stop().await;
}

/// Server-side handler that answers every call with a fixed value.
struct StaticReply(Value);

#[async_trait::async_trait]
impl dartlink_relay::server::ServerMethod for StaticReply {
    async fn handle(&self, _connection_id: &str, _params: Value) -> Result<Value> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_static_tool_routes_through_vm_client() {
    // Stand-in for the Dart VM Service: answers getVM and one extension.
    let vm_sim = RelayServer::new();
    let addr = vm_sim.start(0, "/vm").await.expect("bind vm sim");
    vm_sim
        .register_method(
            "getVM",
            Arc::new(StaticReply(json!({
                "isolates": [
                    {"id": "isolates/1", "name": "vm-service", "isSystemIsolate": true},
                    {"id": "isolates/7", "name": "main"}
                ]
            }))),
        )
        .await;
    vm_sim
        .register_method(
            "ext.flutter.reassemble",
            Arc::new(StaticReply(json!({"type": "Success"}))),
        )
        .await;

    let vm_client = RpcClient::new(no_reconnect());
    vm_client
        .connect("127.0.0.1", addr.port(), "/vm?clientType=flutter&clientId=vm")
        .await
        .expect("dial vm sim");

    let registry = ToolRegistry::new(
        RelayServer::new(),
        vec![RegisteredProcedure {
            id: "hot_reload".to_string(),
            kind: ProcedureKind::Tool,
            display_name: "Hot reload".to_string(),
            description: None,
            invocation_target: "ext.flutter.reassemble".to_string(),
            input_schema: Some(json!({"type": "object"})),
            output_schema: None,
            owner_connection_id: None,
        }],
        RegistryConfig::default(),
    )
    .expect("registry");
    registry.set_vm_target(Arc::new(dartlink_relay::vm::IsolateTracker::new(
        vm_client.clone(),
    )));

    let result = registry
        .invoke("hot_reload", json!({}))
        .await
        .expect("vm-routed invocation");
    assert_eq!(result["type"], json!("Success"));

    vm_sim.stop().await;
}

#[tokio::test]
async fn test_kind_batches_produce_resource_entries() {
    let (server, _port) = start_relay().await;
    let registry =
        ToolRegistry::new(server.clone(), Vec::new(), RegistryConfig::default()).expect("registry");

    let receipt = registry.register_batch(
        "app-1",
        vec![RegisteredProcedure {
            id: "widget_tree".to_string(),
            kind: ProcedureKind::Resource,
            display_name: "Widget tree".to_string(),
            description: None,
            invocation_target: "ext.widget_tree".to_string(),
            input_schema: None,
            output_schema: None,
            owner_connection_id: None,
        }],
    );
    assert!(receipt.tools.is_empty());
    assert_eq!(receipt.resources, vec!["widget_tree"]);

    server.stop().await;
}
