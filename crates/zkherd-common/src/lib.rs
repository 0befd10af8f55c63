//! zkherd Common Types and Transport
//!
//! This crate provides the protocol definitions and HTTP transport helpers
//! shared by every zkherd component.
//!
//! # Overview
//!
//! zkherd supervises a ZooKeeper ensemble. Each supervised host runs one
//! zkherd instance, and instances talk to each other over JSON-RPC 2.0 on
//! HTTP. This crate contains:
//!
//! - **Protocol Layer**: JSON-RPC types, the cluster method names and the
//!   error taxonomy
//! - **Transport Layer**: conversion between HTTP bodies and JSON-RPC
//!   messages
//!
//! # Example
//!
//! ```
//! use zkherd_common::protocol::{ClusterMethod, JsonRpcResponse};
//! use zkherd_common::transport::HttpTransport;
//! use serde_json::json;
//!
//! let request = HttpTransport::build_request(ClusterMethod::State.as_str(), json!({}), json!(1));
//! assert_eq!(request.method, "state");
//!
//! let response = JsonRpcResponse::success(json!(1), json!({"state": "serving"}));
//! assert!(response.error.is_none());
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
