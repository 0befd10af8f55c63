//! zkherd Server
//!
//! The HTTP surface of a zkherd instance: JSON-RPC at `POST /` for peers and
//! operators, and `GET /__health` for load balancers and probes.

pub mod http_router;
pub mod http_server;

pub use http_router::SupervisorRouter;
pub use http_server::HttpServer;
