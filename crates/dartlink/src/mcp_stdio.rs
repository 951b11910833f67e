//! Line-delimited JSON-RPC loop speaking MCP on stdin/stdout, fronting the
//! relay and its registry.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use dartlink_protocol::{RpcError, RpcRequest, RpcResponse};
use dartlink_relay::client::{ClientConfig, Endpoint, RpcClient};
use dartlink_relay::registry::{
    ProcedureKind, RegisterDynamicsMethod, RegistryConfig, ToolRegistry,
};
use dartlink_relay::server::{RelayServer, ServerEvent};
use dartlink_relay::vm::IsolateTracker;

use crate::config::BridgeConfig;
use crate::static_tools;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const RESOURCE_URI_PREFIX: &str = "dartlink://";

pub async fn serve(config: BridgeConfig) -> anyhow::Result<()> {
    eprintln!("Starting Dartlink MCP server...");

    let server = RelayServer::new();
    server.start(config.relay_port, &config.relay_path).await?;
    eprintln!(
        "Relay listening on ws://127.0.0.1:{}{}",
        config.relay_port, config.relay_path
    );

    let static_set = static_tools::load(config.static_tools_file.as_deref())?;
    let registry = Arc::new(ToolRegistry::new(
        server.clone(),
        static_set,
        RegistryConfig {
            storage_path: config.registry_file.clone(),
            ..RegistryConfig::default()
        },
    )?);
    server
        .register_method(
            "registerDynamics",
            Arc::new(RegisterDynamicsMethod::new(registry.clone())),
        )
        .await;

    // Registrations die with their owning connection.
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

    // Direct VM Service route for the static pass-through tools. A failed
    // first dial is fine; the supervisor keeps retrying until the debug
    // session appears.
    if let Some(uri) = config.vm_service_uri.as_deref() {
        match Endpoint::parse(uri) {
            None => warn!("ignoring unparseable DARTLINK_VM_SERVICE uri {}", uri),
            Some(endpoint) => {
                let vm_client = RpcClient::new(ClientConfig::default());
                if let Err(err) = vm_client.connect_to(endpoint).await {
                    warn!("VM Service not reachable yet: {}", err);
                }
                registry.set_vm_target(Arc::new(IsolateTracker::new(vm_client)));
                eprintln!("VM Service target: {}", uri);
            }
        }
    }

    let procedures = registry.list_all(None);
    eprintln!("Available procedures: {}", procedures.len());
    for procedure in &procedures {
        eprintln!("  - {}: {}", procedure.id, procedure.display_name);
    }
    eprintln!("\nMCP server ready. Listening for JSON-RPC requests on stdin...");

    serve_stdio(registry).await
}

async fn serve_stdio(registry: Arc<ToolRegistry>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let reply = RpcResponse::err(
                    None,
                    RpcError::parse_error(format!("Parse error: {}", err)),
                );
                write_reply(&mut stdout, &reply).await?;
                continue;
            }
        };

        if let Some(reply) = handle_request(&registry, request).await {
            write_reply(&mut stdout, &reply).await?;
        }
    }
    Ok(())
}

async fn write_reply(
    stdout: &mut tokio::io::Stdout,
    reply: &RpcResponse,
) -> anyhow::Result<()> {
    let mut text = serde_json::to_string(reply)?;
    text.push('\n');
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Answer one MCP request. Notifications return `None`.
async fn handle_request(registry: &ToolRegistry, request: RpcRequest) -> Option<RpcResponse> {
    let is_notification = request.id.is_none();
    if is_notification {
        match request.method.as_str() {
            "notifications/initialized" => debug!("client initialized"),
            other => debug!("ignoring notification {}", other),
        }
        return None;
    }

    let id = request.id;
    let reply = match request.method.as_str() {
        "initialize" => RpcResponse::ok(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": true},
                    "resources": {}
                },
                "serverInfo": {
                    "name": "dartlink",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "ping" => RpcResponse::ok(id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = registry
                .list_all(None)
                .into_iter()
                .filter(|p| p.kind == ProcedureKind::Tool)
                .map(|p| {
                    json!({
                        "name": p.id,
                        "description": p.description.unwrap_or(p.display_name),
                        "inputSchema": p.input_schema.unwrap_or(json!({"type": "object"})),
                    })
                })
                .collect();
            RpcResponse::ok(id, json!({"tools": tools}))
        }
        "tools/call" => match parse_tool_call(request.params) {
            Err(err) => RpcResponse::err(id, err),
            Ok((name, arguments)) => match registry.invoke(&name, arguments).await {
                Ok(result) => {
                    let text = serde_json::to_string_pretty(&result)
                        .unwrap_or_else(|_| result.to_string());
                    RpcResponse::ok(
                        id,
                        json!({"content": [{"type": "text", "text": text}]}),
                    )
                }
                Err(err) => {
                    warn!("tool {} failed: {}", name, err);
                    RpcResponse::err(id, err.to_rpc_error())
                }
            },
        },
        "resources/list" => {
            let resources: Vec<Value> = registry
                .list_all(None)
                .into_iter()
                .filter(|p| p.kind == ProcedureKind::Resource)
                .map(|p| {
                    json!({
                        "uri": format!("{}{}", RESOURCE_URI_PREFIX, p.id),
                        "name": p.display_name,
                        "description": p.description,
                        "mimeType": "application/json",
                    })
                })
                .collect();
            RpcResponse::ok(id, json!({"resources": resources}))
        }
        "resources/read" => {
            let uri = request
                .params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
                .map(str::to_string);
            match uri {
                None => RpcResponse::err(id, RpcError::invalid_params("missing 'uri'")),
                Some(uri) => match uri.strip_prefix(RESOURCE_URI_PREFIX) {
                    None => RpcResponse::err(
                        id,
                        RpcError::invalid_params(format!("unrecognized uri {}", uri)),
                    ),
                    Some(procedure_id) => {
                        match registry.invoke(procedure_id, json!({})).await {
                            Ok(result) => {
                                let text = serde_json::to_string_pretty(&result)
                                    .unwrap_or_else(|_| result.to_string());
                                RpcResponse::ok(
                                    id,
                                    json!({"contents": [{
                                        "uri": uri,
                                        "mimeType": "application/json",
                                        "text": text,
                                    }]}),
                                )
                            }
                            Err(err) => RpcResponse::err(id, err.to_rpc_error()),
                        }
                    }
                },
            }
        }
        other => RpcResponse::err(id, RpcError::method_not_found(other)),
    };
    Some(reply)
}

fn parse_tool_call(params: Option<Value>) -> Result<(String, Value), RpcError> {
    let params = params.ok_or_else(|| RpcError::invalid_params("params required"))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("missing 'name'"))?
        .to_string();
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    Ok((name, arguments))
}
