//! Requests to other instances of the ensemble.
//!
//! Requests addressed to this instance are answered in-process; everything
//! else goes over JSON-RPC. Failures are captured per request so a fan-out
//! across the ensemble can report exactly which peers did not answer.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use zkherd_client::{ClientConfig, ZkherdClient};
use zkherd_common::protocol::error::{Result, ZkherdError};
use zkherd_common::protocol::ClusterMethod;

use crate::state::{InstanceStatus, SharedInstanceState};

/// Transport to a peer instance.
#[async_trait]
pub trait RemoteInstanceRequestClient: Send + Sync {
    async fn call(&self, hostname: &str, method: ClusterMethod, params: Value) -> Result<Value>;
}

/// Answers requests addressed to this instance without a network hop.
#[async_trait]
pub trait LocalInstanceHandler: Send + Sync {
    async fn handle(&self, method: ClusterMethod, params: Value) -> Result<Value>;
}

/// HTTP client for peers, keyed by hostname.
///
/// All peers are assumed to serve JSON-RPC on the same port. Connection
/// failures and timeouts surface as [`ZkherdError::PeerUnreachable`]; an
/// error answered by the peer itself is passed through unchanged.
pub struct HttpRemoteInstanceClient {
    port: u16,
    config: ClientConfig,
    clients: Mutex<HashMap<String, ZkherdClient>>,
}

impl HttpRemoteInstanceClient {
    pub fn new(port: u16, config: ClientConfig) -> Self {
        Self {
            port,
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, hostname: &str) -> ZkherdClient {
        self.clients
            .lock()
            .entry(hostname.to_string())
            .or_insert_with(|| {
                ZkherdClient::with_config(
                    format!("http://{}:{}", hostname, self.port),
                    self.config.clone(),
                )
            })
            .clone()
    }
}

#[async_trait]
impl RemoteInstanceRequestClient for HttpRemoteInstanceClient {
    async fn call(&self, hostname: &str, method: ClusterMethod, params: Value) -> Result<Value> {
        self.client_for(hostname)
            .call(method.as_str(), params)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    ZkherdError::PeerUnreachable {
                        hostname: hostname.to_string(),
                        reason: e.to_string(),
                    }
                } else {
                    e
                }
            })
    }
}

/// The in-process side of a peer request: this instance's state and its
/// config poll trigger.
pub struct LocalInstance {
    hostname: String,
    state: Arc<SharedInstanceState>,
    poll_trigger: Arc<Notify>,
}

impl LocalInstance {
    pub fn new(hostname: impl Into<String>, state: Arc<SharedInstanceState>, poll_trigger: Arc<Notify>) -> Self {
        Self {
            hostname: hostname.into(),
            state,
            poll_trigger,
        }
    }
}

#[async_trait]
impl LocalInstanceHandler for LocalInstance {
    async fn handle(&self, method: ClusterMethod, _params: Value) -> Result<Value> {
        match method {
            ClusterMethod::State => Ok(serde_json::to_value(self.state.status(&self.hostname))?),
            ClusterMethod::ConfigChanged => {
                self.poll_trigger.notify_one();
                Ok(json!({"ok": true}))
            }
            other => Err(ZkherdError::InvalidConfig(format!(
                "{} is not answered for local peer requests",
                other
            ))),
        }
    }
}

/// Result of one peer request. `response` is an empty object when the
/// request failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub response: Value,
    pub error_message: Option<String>,
}

impl RemoteResponse {
    pub fn is_ok(&self) -> bool {
        self.error_message.is_none()
    }
}

/// Routes a request to this instance or to a peer.
#[derive(Clone)]
pub struct RemoteInstanceRequest {
    this_hostname: String,
    client: Arc<dyn RemoteInstanceRequestClient>,
    local: Arc<dyn LocalInstanceHandler>,
}

impl RemoteInstanceRequest {
    pub fn new(
        this_hostname: impl Into<String>,
        client: Arc<dyn RemoteInstanceRequestClient>,
        local: Arc<dyn LocalInstanceHandler>,
    ) -> Self {
        Self {
            this_hostname: this_hostname.into(),
            client,
            local,
        }
    }

    pub fn this_hostname(&self) -> &str {
        &self.this_hostname
    }

    /// Sends `method` to `hostname`. Never fails; errors are reported in the
    /// returned [`RemoteResponse`].
    pub async fn invoke(&self, hostname: &str, method: ClusterMethod, params: Value) -> RemoteResponse {
        let result = if hostname == self.this_hostname {
            self.local.handle(method, params).await
        } else {
            self.client.call(hostname, method, params).await
        };

        match result {
            Ok(response) => RemoteResponse {
                response,
                error_message: None,
            },
            Err(e) => {
                let message = e.to_string();
                RemoteResponse {
                    response: json!({}),
                    error_message: Some(if message.is_empty() {
                        "Unknown".to_string()
                    } else {
                        message
                    }),
                }
            }
        }
    }

    /// Fetches and decodes the `state` of one instance.
    pub async fn state_of(&self, hostname: &str) -> InstanceStatus {
        let remote = self.invoke(hostname, ClusterMethod::State, json!({})).await;
        if let Some(error) = remote.error_message {
            return InstanceStatus::unreachable(hostname, error);
        }
        match serde_json::from_value::<InstanceStatus>(remote.response) {
            Ok(mut status) => {
                status.hostname = hostname.to_string();
                status
            }
            Err(e) => InstanceStatus::unreachable(hostname, format!("bad state response: {}", e)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakePeers;
    use super::*;
    use crate::state::InstanceStateType;

    fn request(peers: Arc<FakePeers>, shared: Arc<SharedInstanceState>) -> (RemoteInstanceRequest, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        let local = Arc::new(LocalInstance::new("a", shared, notify.clone()));
        (RemoteInstanceRequest::new("a", peers, local), notify)
    }

    #[tokio::test]
    async fn test_self_requests_skip_the_network() {
        let peers = Arc::new(FakePeers::default());
        let (request, _) = request(peers.clone(), Arc::new(SharedInstanceState::new()));

        let status = request.state_of("a").await;
        assert_eq!(status.hostname, "a");
        assert_eq!(status.state, InstanceStateType::Unknown);
        assert!(status.error.is_none());
        assert!(peers.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_config_changed_triggers_poll() {
        let peers = Arc::new(FakePeers::default());
        let (request, notify) = request(peers, Arc::new(SharedInstanceState::new()));

        let response = request.invoke("a", ClusterMethod::ConfigChanged, json!({})).await;
        assert!(response.is_ok());
        // the permit stored by notify_one resolves immediately
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_failure_is_attributed() {
        let peers = Arc::new(FakePeers::default());
        peers.fail("b", "connection refused");
        let (request, _) = request(peers, Arc::new(SharedInstanceState::new()));

        let response = request.invoke("b", ClusterMethod::State, json!({})).await;
        assert_eq!(response.response, json!({}));
        let message = response.error_message.unwrap();
        assert!(message.contains("b"));
        assert!(message.contains("connection refused"));

        let status = request.state_of("b").await;
        assert_eq!(status.state, InstanceStateType::Unknown);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_peer_state_decoded() {
        let peers = Arc::new(FakePeers::default());
        peers.respond(
            "b",
            serde_json::to_value(InstanceStatus::new(
                "b",
                InstanceStateType::Serving,
                true,
                "1:a,2:b".into(),
            ))
            .unwrap(),
        );
        let (request, _) = request(peers, Arc::new(SharedInstanceState::new()));

        let status = request.state_of("b").await;
        assert_eq!(status.state, InstanceStateType::Serving);
        assert!(status.is_leader);
        assert_eq!(status.server_spec, "1:a,2:b");
    }

    /// Answers one HTTP request with `body` and closes.
    async fn serve_once(body: &'static str) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"}") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_http_peer_errors_keep_their_kind() {
        let body = r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bad servers"},"id":1}"#;
        let port = serve_once(body).await;
        let client = HttpRemoteInstanceClient::new(
            port,
            ClientConfig {
                timeout: std::time::Duration::from_secs(2),
            },
        );

        let err = client
            .call("127.0.0.1", ClusterMethod::State, json!({}))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("-32602"));

        // nothing listens any more
        let err = client
            .call("127.0.0.1", ClusterMethod::State, json!({}))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        match err {
            ZkherdError::PeerUnreachable { hostname, .. } => assert_eq!(hostname, "127.0.0.1"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_state_counts_as_unreachable() {
        let peers = Arc::new(FakePeers::default());
        peers.respond("b", json!({}));
        let (request, _) = request(peers, Arc::new(SharedInstanceState::new()));

        let status = request.state_of("b").await;
        assert_eq!(status.state, InstanceStateType::Unknown);
        assert!(status.error.unwrap().contains("bad state response"));
    }
}
