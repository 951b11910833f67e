use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_codes::ErrorCode;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request or notification.
///
/// A request carries an `id` and expects a correlated reply; a notification
/// has no `id` and expects nothing back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 reply. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the `result` payload or the carried error.
    ///
    /// A reply with neither field is treated as an internal error, since the
    /// peer violated the protocol.
    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else if let Some(result) = self.result {
            Ok(result)
        } else {
            Err(RpcError::internal("reply contained neither result nor error"))
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }
}

/// Classification of one inbound frame.
///
/// Mirrors the dispatch rules: `id` + `method` is a request, `method` without
/// `id` is a notification, `id` with `result`/`error` but no `method` is a
/// reply, anything else is not a frame this protocol recognizes.
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(RpcRequest),
    Notification(RpcRequest),
    Reply(RpcResponse),
    Other(Value),
}

/// Classify a parsed JSON value as an inbound JSON-RPC frame.
pub fn classify(value: Value) -> Inbound {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Inbound::Other(value),
    };

    if obj.get("method").and_then(Value::as_str).is_some() {
        // Request or notification; malformed variants fall through to Other.
        match serde_json::from_value::<RpcRequest>(value.clone()) {
            Ok(req) if req.id.is_some() => return Inbound::Request(req),
            Ok(req) => return Inbound::Notification(req),
            Err(_) => return Inbound::Other(value),
        }
    }

    if obj.contains_key("id") && (obj.contains_key("result") || obj.contains_key("error")) {
        match serde_json::from_value::<RpcResponse>(value.clone()) {
            Ok(resp) => return Inbound::Reply(resp),
            Err(_) => return Inbound::Other(value),
        }
    }

    Inbound::Other(value)
}

/// Canonical map key for a correlation id.
///
/// Ids are strings in every frame this bridge generates, but peers may reply
/// with numeric ids; both forms must land on the same key.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a raw text frame and classify it.
///
/// Returns the serde error on invalid JSON so callers can decide between
/// dropping the frame and answering with a parse-error reply.
pub fn parse_frame(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(classify(value))
}
