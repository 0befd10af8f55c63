//! HTTP Server for a zkherd Instance
//!
//! Serves the cluster methods as JSON-RPC over `POST /` and a liveness probe
//! at `GET /__health`, using axum.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use hyper::body::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use zkherd_common::protocol::error::ZkherdError;
use zkherd_common::protocol::{JsonRpcError, JsonRpcResponse};
use zkherd_common::transport::HttpTransport;
use zkherd_core::Supervisor;

use crate::http_router::SupervisorRouter;

/// HTTP server for one supervisor.
///
/// This server:
/// - Handles JSON-RPC POST requests at `/`
/// - Provides a health check endpoint at `/__health`
/// - Uses [`SupervisorRouter`] for request routing
pub struct HttpServer {
    router: Arc<SupervisorRouter>,
}

impl HttpServer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            router: Arc::new(SupervisorRouter::new(supervisor)),
        }
    }

    fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/", axum::routing::post(handle_jsonrpc))
            .route("/__health", axum::routing::get(health_check))
            .layer(CorsLayer::permissive())
            .with_state(self.router.clone())
    }

    /// Binds `addr` and serves until the process exits.
    ///
    /// # Errors
    /// `Transport` if the address cannot be bound or the server fails.
    pub async fn run(self, addr: SocketAddr) -> Result<(), ZkherdError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ZkherdError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ZkherdError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener
            .local_addr()
            .map_err(|e| ZkherdError::Transport(format!("Failed to get local addr: {}", e)))?;
        info!("zkherd HTTP server listening on {}", local);

        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ZkherdError::Transport(format!("Server error: {}", e)))?;

        info!("zkherd HTTP server on {} stopped", local);
        Ok(())
    }
}

async fn handle_jsonrpc(
    State(router): State<Arc<SupervisorRouter>>,
    body: Bytes,
) -> Json<JsonRpcResponse> {
    let request = match HttpTransport::parse_jsonrpc(body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Failed to parse JSON-RPC request: {}", e);
            return Json(JsonRpcResponse::error(
                serde_json::Value::Null,
                JsonRpcError::parse_error(),
            ));
        }
    };

    Json(router.handle_request(request).await)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
