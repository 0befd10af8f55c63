use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use zkherd_common::protocol::error::{Result, ZkherdError};
use zkherd_common::transport::HttpTransport;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for one request, connect included
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// JSON-RPC over HTTP client for a single zkherd instance.
///
/// The underlying hyper client pools connections, so a `ZkherdClient` is cheap
/// to clone and safe to share between tasks.
#[derive(Clone)]
pub struct ZkherdClient {
    url: String,
    config: ClientConfig,
    http: Client<HttpConnector, Full<Bytes>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ZkherdClient {
    /// Creates a client for the instance at `url` (e.g. `http://zk1:8080`).
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: ClientConfig) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }

        Self {
            url,
            config,
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Calls `method` with `params` and returns the JSON-RPC result.
    ///
    /// # Returns
    /// - `Ok(Value)` - the `result` member of the response
    /// - `Err(ZkherdError::Timeout)` - no response within the configured timeout
    /// - `Err(ZkherdError::Transport)` - connection or HTTP failure
    /// - `Err(ZkherdError::InvalidResponse)` - the remote returned a JSON-RPC error
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let request = HttpTransport::build_request(method, params, Value::from(id));
        let body = serde_json::to_vec(&request)?;

        let http_request = Request::builder()
            .method("POST")
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ZkherdError::Transport(format!("Failed to build request: {}", e)))?;

        let timeout = self.config.timeout;
        let exchange = async {
            let response = self
                .http
                .request(http_request)
                .await
                .map_err(|e| ZkherdError::Transport(format!("HTTP request failed: {}", e)))?;

            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ZkherdError::Transport(format!("Failed to read response: {}", e)))?
                .to_bytes();

            if !status.is_success() {
                return Err(ZkherdError::Transport(format!(
                    "HTTP {} from {}",
                    status, self.url
                )));
            }

            HttpTransport::parse_result(&bytes)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!("Call {} to {} failed: {}", method, self.url, e);
                }
                result
            }
            Err(_) => Err(ZkherdError::Timeout(timeout.as_millis() as u64)),
        }
    }
}
