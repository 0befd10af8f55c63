//! HTTP Transport Utilities
//!
//! Conversion between HTTP bodies and JSON-RPC messages, shared by the
//! server surface and the peer client.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde_json::Value;

use crate::protocol::error::ZkherdError;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Parse a JSON-RPC request from an HTTP body
    ///
    /// # Example
    ///
    /// ```
    /// use zkherd_common::transport::HttpTransport;
    /// use hyper::body::Bytes;
    ///
    /// let body = Bytes::from(r#"{"jsonrpc":"2.0","method":"state","params":{},"id":1}"#);
    /// let request = HttpTransport::parse_jsonrpc(body).unwrap();
    /// assert_eq!(request.method, "state");
    /// ```
    pub fn parse_jsonrpc(body: Bytes) -> Result<JsonRpcRequest, ZkherdError> {
        Ok(serde_json::from_slice(&body)?)
    }

    /// Extracts the result of a JSON-RPC response body.
    ///
    /// A JSON-RPC error object becomes `ZkherdError::InvalidResponse` carrying
    /// the remote message, so callers can attribute the failure to the peer.
    pub fn parse_result(body: &[u8]) -> Result<Value, ZkherdError> {
        let response: JsonRpcResponse = serde_json::from_slice(body)?;

        if let Some(error) = response.error {
            return Err(ZkherdError::InvalidResponse(format!(
                "remote error {}: {}",
                error.code, error.message
            )));
        }

        response.result.ok_or_else(|| {
            ZkherdError::InvalidResponse("Missing result in success response".to_string())
        })
    }

    /// Create an HTTP response from a JSON-RPC response
    pub fn to_http_response(jsonrpc: JsonRpcResponse) -> HyperResponse {
        Self::to_http_response_with_status(jsonrpc, StatusCode::OK)
    }

    /// Create an HTTP error response from a JSON-RPC error
    pub fn to_http_error(id: Value, error: JsonRpcError) -> HyperResponse {
        Self::to_http_response(JsonRpcResponse::error(id, error))
    }

    /// Create an HTTP response with a custom status code
    pub fn to_http_response_with_status(
        jsonrpc: JsonRpcResponse,
        status: StatusCode,
    ) -> HyperResponse {
        let body = serde_json::to_vec(&jsonrpc).unwrap_or_default();

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// Build a JSON-RPC request
    ///
    /// # Arguments
    ///
    /// * `method` - Method name to invoke
    /// * `params` - Method parameters
    /// * `id` - Request identifier
    pub fn build_request(method: &str, params: Value, id: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}
