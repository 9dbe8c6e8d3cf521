use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Everything the bridge can hand back to a caller.
///
/// The enum is `Clone` because one handshake failure is delivered to every
/// caller that was waiting on it; non-clonable sources are held in an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("invalid json-rpc envelope: {0}")]
    InvalidEnvelope(String),
    #[error("request id {0} is already in flight")]
    DuplicateId(String),
    #[error("bridge is at capacity ({ceiling} requests in flight)")]
    CapacityExceeded { ceiling: usize },
    #[error("timed out after {timeout_ms}ms waiting for response to `{method}`")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("engine process exited (code: {code:?}, signal: {signal:?})")]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: Option<String>,
    },
    #[error("engine returned error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("engine process is not running")]
    NotRunning,
    #[error("failed to spawn engine `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed to capture engine {0}")]
    MissingPipe(&'static str),
    #[error("failed to write engine stdin: {0}")]
    Write(#[source] Arc<std::io::Error>),
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(#[source] Arc<serde_json::Error>),
    #[error("handshake was abandoned before completing")]
    HandshakeAborted,
    #[error("bridge is shut down")]
    Shutdown,
}

impl BridgeError {
    pub(crate) fn write(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => Self::NotRunning,
            _ => Self::Write(Arc::new(err)),
        }
    }

    pub(crate) fn serialize(err: serde_json::Error) -> Self {
        Self::Serialize(Arc::new(err))
    }

    /// Builds a `Protocol` error from the `error` member of a json-rpc response.
    pub(crate) fn from_rpc_error(error: &Value) -> Self {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown engine error")
            .to_string();
        Self::Protocol {
            code,
            message,
            data: error.get("data").cloned(),
        }
    }

    /// True for failures caused by the bridge being full, as opposed to the engine.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
