use serde::{Deserialize, Serialize};

/// JSON-RPC error codes used across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    // Standard JSON-RPC error codes
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);

    // Bridge-specific codes (implementation-defined range -32000 to -32099)
    pub const PROCEDURE_NOT_FOUND: Self = Self(-32000);
    pub const FORWARDING_FAILED: Self = Self(-32001);
    pub const VALIDATION_ERROR: Self = Self(-32003);
    pub const TIMEOUT_ERROR: Self = Self(-32004);
    pub const NOT_CONNECTED: Self = Self(-32005);
    pub const CLIENT_NOT_FOUND: Self = Self(-32006);
}

impl ErrorCode {
    /// Human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self.0 {
            -32700 => "Parse error: Invalid JSON was received",
            -32600 => "Invalid Request: The JSON sent is not a valid Request object",
            -32601 => "Method not found: The method does not exist or is not available",
            -32602 => "Invalid params: Invalid method parameter(s)",
            -32603 => "Internal error: Internal JSON-RPC error",
            -32000 => "Procedure not found: No registered procedure with that id",
            -32001 => "Forwarding failed: The call could not be relayed to its target",
            -32003 => "Validation error: Arguments or result did not match the declared schema",
            -32004 => "Timeout error: No reply arrived before the deadline",
            -32005 => "Not connected: No open connection to the peer",
            -32006 => "Client not found: No tracked connection with that id",
            _ => "Unknown error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_descriptions() {
        assert_eq!(
            ErrorCode::PARSE_ERROR.description(),
            "Parse error: Invalid JSON was received"
        );
        assert_eq!(
            ErrorCode::CLIENT_NOT_FOUND.description(),
            "Client not found: No tracked connection with that id"
        );
        assert_eq!(ErrorCode(-1).description(), "Unknown error");
    }

    #[test]
    fn test_error_code_serializes_transparent() {
        let text = serde_json::to_string(&ErrorCode::METHOD_NOT_FOUND).expect("serialize");
        assert_eq!(text, "-32601");
    }

    #[test]
    fn test_error_code_equality() {
        assert_eq!(ErrorCode::VALIDATION_ERROR, ErrorCode(-32003));
        assert_ne!(ErrorCode::VALIDATION_ERROR, ErrorCode::TIMEOUT_ERROR);
    }
}
