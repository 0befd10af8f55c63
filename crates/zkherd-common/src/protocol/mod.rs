pub mod error;
pub mod jsonrpc;
pub mod methods;

pub use error::{Result, ZkherdError};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use methods::ClusterMethod;
