use dartlink_protocol::{ErrorCode, RpcError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Timed out waiting for reply to {method}")]
    Timeout { method: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Peer returned an error: {0}")]
    Rpc(#[from] RpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map this error onto the JSON-RPC error object sent back to a peer.
    ///
    /// Handler and unexpected failures become internal errors; errors that
    /// already carry a JSON-RPC code keep it.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Error::MethodNotFound(method) => RpcError::method_not_found(method),
            Error::Validation(msg) => RpcError::new(ErrorCode::VALIDATION_ERROR, msg.clone()),
            Error::Timeout { .. } => RpcError::new(ErrorCode::TIMEOUT_ERROR, self.to_string()),
            Error::NotConnected => RpcError::new(ErrorCode::NOT_CONNECTED, self.to_string()),
            Error::ClientNotFound(_) => RpcError::new(ErrorCode::CLIENT_NOT_FOUND, self.to_string()),
            Error::Rpc(err) => err.clone(),
            other => RpcError::internal(other.to_string()),
        }
    }
}
