mod error_codes;
mod id;
mod jsonrpc;

pub use error_codes::ErrorCode;
pub use id::RequestIdGen;
pub use jsonrpc::{
    Inbound, RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION, classify, id_key, parse_frame,
};
