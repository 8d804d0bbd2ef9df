//! Line-delimited JSON control protocol.
//!
//! One request object per input line, one response object per output line.
//!
//! ```text
//! → {"requestId":1,"op":"create","config":{"networkMode":"bridge","files":[{"path":"input.sql","content":"U0VMRUNUIDE7"}]}}
//! ← {"requestId":1,"ok":true,"result":{"id":"sandbox-…","hostPort":50000,"state":"running",…}}
//! → {"op":"destroy","id":"sandbox-…"}
//! ← {"ok":true,"result":null}
//! ```
//!
//! File contents are base64. Responses may arrive out of order; clients
//! correlate them through `requestId`.

use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use mcp_sandbox::{is_port_free, SandboxConfig, SandboxId, SandboxRegistry};
use mcp_sandbox_core::Error;

const DEFAULT_LOG_TAIL: usize = 100;

fn default_tail() -> usize {
    DEFAULT_LOG_TAIL
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    Create {
        #[serde(default)]
        id: Option<SandboxId>,
        config: SandboxConfig,
    },
    Destroy {
        id: SandboxId,
    },
    Get {
        id: SandboxId,
    },
    List,
    CheckHealth {
        id: SandboxId,
    },
    Logs {
        id: SandboxId,
        #[serde(default = "default_tail")]
        tail: usize,
    },
    IsPortFree {
        port: u16,
    },
    Metrics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    request_id: Option<Value>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(request_id: Option<Value>, result: Value) -> Self {
        Self {
            request_id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(request_id: Option<Value>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    /// Serialized as one line, without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"error":{{"kind":"internal","message":"unserializable response: {}"}}}}"#,
                e
            )
        })
    }
}

/// Executes control requests against a registry.
#[derive(Clone)]
pub struct ControlHandler {
    registry: SandboxRegistry,
    metrics: Option<PrometheusHandle>,
}

impl ControlHandler {
    pub fn new(registry: SandboxRegistry) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub async fn handle_line(&self, line: &str) -> Response {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed control request");
                let request_id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("requestId").cloned());
                return Response::failure(request_id, "invalid_request", e.to_string());
            }
        };

        match self.dispatch(envelope.request).await {
            Ok(result) => Response::success(envelope.request_id, result),
            Err(e) => Response::failure(envelope.request_id, e.kind(), e.to_string()),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value, Error> {
        match request {
            Request::Create { id, config } => {
                let handle = match id {
                    Some(id) => self.registry.create_with_id(id, config).await?,
                    None => self.registry.create(config).await?,
                };
                to_value(&handle)
            }
            Request::Destroy { id } => {
                self.registry.destroy(&id).await;
                Ok(Value::Null)
            }
            Request::Get { id } => match self.registry.get(&id).await {
                Some(handle) => to_value(&handle),
                None => Err(Error::SandboxNotFound(id.to_string())),
            },
            Request::List => to_value(&self.registry.list_active().await),
            Request::CheckHealth { id } => {
                let state = self.registry.check_health(&id).await?;
                Ok(json!({ "state": state }))
            }
            Request::Logs { id, tail } => {
                let logs = self.registry.logs(&id, tail).await?;
                Ok(json!({ "logs": logs }))
            }
            Request::IsPortFree { port } => Ok(json!({ "free": is_port_free(port) })),
            Request::Metrics => match &self.metrics {
                Some(handle) => Ok(json!({ "text": handle.render() })),
                None => Err(Error::config("metrics recorder is not installed")),
            },
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::runtime(format!("failed to encode result: {}", e)))
}
