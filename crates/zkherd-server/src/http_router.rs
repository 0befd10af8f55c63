//! JSON-RPC Router for the Supervisor
//!
//! Maps each cluster method onto the supervisor. Parameters are decoded
//! here; everything else is the supervisor's business.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use zkherd_common::protocol::{ClusterMethod, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use zkherd_core::{CancelMode, ControlPanelSwitch, FourLetterWord, Supervisor};

#[derive(Debug, Deserialize)]
struct CancelParams {
    #[serde(default = "default_cancel_mode")]
    mode: String,
}

fn default_cancel_mode() -> String {
    CancelMode::Rollback.to_string()
}

#[derive(Debug, Deserialize)]
struct FourLetterWordParams {
    word: String,
}

#[derive(Debug, Deserialize)]
struct ControlPanelParams {
    switch: String,
    value: bool,
}

#[derive(Debug, Deserialize)]
struct BackupParams {
    name: String,
}

/// Routes JSON-RPC requests to a [`Supervisor`].
///
/// Built-in `_info` is answered like any other method. Unknown method names
/// get a `Method not found` error; core errors are mapped with
/// [`JsonRpcError::from_error`].
pub struct SupervisorRouter {
    supervisor: Arc<Supervisor>,
}

impl SupervisorRouter {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Handles an incoming JSON-RPC request.
    ///
    /// # Returns
    /// A JSON-RPC response carrying the request id and either the result or
    /// an error object
    pub async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.jsonrpc != "2.0" {
            return JsonRpcResponse::error(req.id, JsonRpcError::invalid_request());
        }
        let Ok(method) = req.method.parse::<ClusterMethod>() else {
            debug!("Unknown method: {}", req.method);
            return JsonRpcResponse::error(req.id, JsonRpcError::method_not_found());
        };

        match self.dispatch(method, req.params).await {
            Ok(result) => JsonRpcResponse::success(req.id, result),
            Err(error) => JsonRpcResponse::error(req.id, error),
        }
    }

    async fn dispatch(&self, method: ClusterMethod, params: Value) -> Result<Value, JsonRpcError> {
        let supervisor = &self.supervisor;
        match method {
            ClusterMethod::State => to_json(supervisor.state()),
            ClusterMethod::ConfigChanged => {
                supervisor.config_changed();
                Ok(json!({"ok": true}))
            }
            ClusterMethod::GetConfig => Ok(supervisor.get_config()),
            ClusterMethod::UpdateConfig => {
                let applied = supervisor
                    .update_config(config_overrides(&params))
                    .await
                    .map_err(|e| JsonRpcError::from_error(&e))?;
                Ok(json!({"applied": applied}))
            }
            ClusterMethod::StartRollingConfig => {
                let started = supervisor
                    .start_rolling_config(config_overrides(&params))
                    .await
                    .map_err(|e| JsonRpcError::from_error(&e))?;
                Ok(json!({"started": started}))
            }
            ClusterMethod::CancelRollingConfig => {
                let CancelParams { mode } = decode(params)?;
                let mode: CancelMode = mode
                    .parse()
                    .map_err(|e: String| JsonRpcError::invalid_params(&e))?;
                let cancelled = supervisor
                    .cancel_rolling_config(mode)
                    .await
                    .map_err(|e| JsonRpcError::from_error(&e))?;
                Ok(json!({"cancelled": cancelled, "mode": mode}))
            }
            ClusterMethod::RollingState => to_json(supervisor.rolling_state()),
            ClusterMethod::ClusterStatus => to_json(supervisor.cluster_status().await),
            ClusterMethod::FourLetterWord => {
                let FourLetterWordParams { word } = decode(params)?;
                let word: FourLetterWord = word
                    .parse()
                    .map_err(|e: String| JsonRpcError::invalid_params(&e))?;
                let response = supervisor.four_letter_word(word).await;
                Ok(json!({"word": word.as_str(), "response": response}))
            }
            ClusterMethod::SetControlPanel => {
                let ControlPanelParams { switch, value } = decode(params)?;
                let switch: ControlPanelSwitch = switch
                    .parse()
                    .map_err(|e: String| JsonRpcError::invalid_params(&e))?;
                supervisor.set_control_panel(switch, value);
                Ok(supervisor.control_panel().to_json())
            }
            ClusterMethod::GetBackup => {
                let BackupParams { name } = decode(params)?;
                let data = supervisor
                    .open_backup(&name)
                    .await
                    .map_err(|e| JsonRpcError::from_error(&e))?;
                Ok(json!({"name": name, "size": data.len(), "data": data}))
            }
            ClusterMethod::Info => {
                let mut info = supervisor.info();
                let backups = supervisor
                    .backups()
                    .await
                    .map_err(|e| JsonRpcError::from_error(&e))?;
                info["backups"] = json!(backups.into_iter().map(|b| b.name).collect::<Vec<_>>());
                Ok(info)
            }
        }
    }
}

/// Config changes come either wrapped as `{"config": {...}}` or as the bare
/// object of overrides.
fn config_overrides(params: &Value) -> &Value {
    match params.get("config") {
        Some(config) => config,
        None => params,
    }
}

fn decode<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, JsonRpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
}
