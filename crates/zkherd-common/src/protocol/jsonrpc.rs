//! JSON-RPC 2.0 Protocol Types
//!
//! zkherd instances talk to each other (and the CLI talks to instances)
//! using JSON-RPC 2.0 over HTTP POST.
//!
//! # Error Codes
//!
//! Standard codes:
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//!
//! Application codes (server error range):
//! - `-32000`: Generic server error
//! - `-32010`: Config store unavailable
//! - `-32011`: Version conflict
//! - `-32012`: Lock timeout
//! - `-32013`: Peer unreachable

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::error::ZkherdError;

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Name of the method to invoke
    pub method: String,
    /// Parameter values
    #[serde(default)]
    pub params: Value,
    /// Request identifier
    pub id: Value,
}

/// JSON-RPC 2.0 response
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

/// Invalid JSON was received by the server
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i32 = -32603;
/// Generic application error
pub const SERVER_ERROR: i32 = -32000;
/// The shared config store could not be reached
pub const STORE_UNAVAILABLE: i32 = -32010;
/// Someone else committed a config change first
pub const VERSION_CONFLICT: i32 = -32011;
/// The pseudo-lock could not be acquired in time
pub const LOCK_TIMEOUT: i32 = -32012;
/// A peer instance could not be reached
pub const PEER_UNREACHABLE: i32 = -32013;

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    /// Create an invalid params error (-32602)
    pub fn invalid_params(msg: &str) -> Self {
        Self::new(INVALID_PARAMS, msg)
    }

    /// Create an internal error (-32603)
    pub fn internal_error(msg: &str) -> Self {
        Self::new(INTERNAL_ERROR, msg)
    }

    /// Create a generic server error (-32000)
    pub fn server_error(msg: &str) -> Self {
        Self::new(SERVER_ERROR, msg)
    }

    /// Maps a core error onto a JSON-RPC error object.
    ///
    /// Coordination outcomes the caller is expected to react to (conflicts,
    /// lock timeouts, store outages) get their own codes so a remote caller
    /// can tell them apart from plain failures.
    pub fn from_error(err: &ZkherdError) -> Self {
        let code = match err {
            ZkherdError::StoreUnavailable(_) => STORE_UNAVAILABLE,
            ZkherdError::VersionConflict { .. } => VERSION_CONFLICT,
            ZkherdError::LockTimeout(_) => LOCK_TIMEOUT,
            ZkherdError::PeerUnreachable { .. } => PEER_UNREACHABLE,
            ZkherdError::InvalidServerList(_)
            | ZkherdError::InvalidConfig(_)
            | ZkherdError::JsonSerialization(_) => INVALID_PARAMS,
            _ => SERVER_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl JsonRpcResponse {
    /// Create a success response
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must match the request id)
    /// * `result` - Result value
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must match the request id)
    /// * `error` - Error object
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(error),
            id,
        }
    }
}
