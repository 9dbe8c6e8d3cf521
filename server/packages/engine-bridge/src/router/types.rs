use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

/// Inbound JSON-RPC message. Which members are present decides the route:
/// `method` + `id` is a request, `method` alone a notification, `id` with
/// `result`/`error` an answer to an engine-initiated request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub spawn_count: u64,
    pub handshake: String,
    pub handshake_attempts: u64,
    pub pending_requests: usize,
    pub subscribers: usize,
    pub dropped_notifications: u64,
    pub uptime_ms: Option<u64>,
    pub command: String,
    pub server_info: Option<Value>,
    pub shut_down: bool,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub rejected_requests: u64,
    pub started_at: String,
}

impl StatusResponse {
    pub fn new(status: GatewayStatus, started_at: DateTime<Utc>) -> Self {
        let bridge = status.bridge;
        let handshake = match bridge.handshake {
            HandshakeState::Uninitialized => "uninitialized",
            HandshakeState::Initializing => "initializing",
            HandshakeState::Ready => "ready",
        };
        Self {
            running: bridge.running,
            pid: bridge.pid,
            generation: bridge.generation,
            spawn_count: bridge.spawn_count,
            handshake: handshake.to_string(),
            handshake_attempts: bridge.handshake_attempts,
            pending_requests: bridge.pending_requests,
            subscribers: bridge.subscribers,
            dropped_notifications: bridge.dropped_notifications,
            uptime_ms: bridge.uptime_ms,
            command: bridge.command,
            server_info: bridge.server_info,
            shut_down: bridge.shut_down,
            in_flight: status.in_flight,
            max_in_flight: status.max_in_flight,
            rejected_requests: status.rejected_requests,
            started_at: started_at.to_rfc3339(),
        }
    }
}
