//! Tool-call dispatch
//!
//! Bridges model-issued function calls to backend side effects. Handlers run
//! on their own tasks so audio and transcript processing never wait on a
//! round trip, and every call is answered exactly once: success, handler
//! error, unknown tool, or timeout.

use crate::protocol::{ClientMessage, FunctionCall, FunctionResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upper bound on a single handler invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for tool dispatch
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no handler registered for tool `{0}`")]
    Unknown(String),

    #[error("tool backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tool `{0}` timed out")]
    Timeout(String),

    #[error("{0}")]
    Handler(String),
}

/// A named action the model may invoke mid-conversation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// Registry of tool handlers plus the per-call timeout.
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Registered tool names, for the setup declaration.
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Dispatch one model-issued batch. Spawns a task per call and returns
    /// immediately; each task eventually sends exactly one tool response
    /// through `outbound`, correlated by call id.
    pub fn dispatch(&self, calls: Vec<FunctionCall>, outbound: mpsc::UnboundedSender<ClientMessage>) {
        for call in calls {
            let handler = self.handlers.get(&call.name).cloned();
            let timeout = self.timeout;
            let outbound = outbound.clone();

            tokio::spawn(async move {
                let result = match handler {
                    None => Err(ToolError::Unknown(call.name.clone())),
                    Some(handler) => {
                        match tokio::time::timeout(timeout, handler.call(call.args.clone())).await {
                            Ok(result) => result,
                            Err(_) => Err(ToolError::Timeout(call.name.clone())),
                        }
                    }
                };

                let response = match result {
                    Ok(value) => {
                        info!("tool `{}` completed", call.name);
                        value
                    }
                    Err(e) => {
                        warn!("tool `{}` failed: {}", call.name, e);
                        serde_json::json!({ "error": e.to_string() })
                    }
                };

                let msg = ClientMessage::tool_response(vec![FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response,
                }]);
                if outbound.send(msg).is_err() {
                    debug!("connection closed before tool `{}` could respond", call.name);
                }
            });
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that forwards the call to a conventional HTTP backend endpoint:
/// the structured arguments plus a timestamp go out, the JSON body comes
/// back verbatim.
pub struct HttpToolHandler {
    client: reqwest::Client,
    url: String,
}

impl HttpToolHandler {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for HttpToolHandler {
    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let body = serde_json::json!({ "args": args, "timestamp": timestamp });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}
