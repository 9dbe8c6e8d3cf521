use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    CapacityExceeded,
    Timeout,
    ProcessExited,
    EngineUnavailable,
    ShuttingDown,
    TokenInvalid,
    UnsupportedMediaType,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:engine-bridge:error:invalid_request",
            Self::CapacityExceeded => "urn:engine-bridge:error:capacity_exceeded",
            Self::Timeout => "urn:engine-bridge:error:timeout",
            Self::ProcessExited => "urn:engine-bridge:error:process_exited",
            Self::EngineUnavailable => "urn:engine-bridge:error:engine_unavailable",
            Self::ShuttingDown => "urn:engine-bridge:error:shutting_down",
            Self::TokenInvalid => "urn:engine-bridge:error:token_invalid",
            Self::UnsupportedMediaType => "urn:engine-bridge:error:unsupported_media_type",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::CapacityExceeded => "Capacity Exceeded",
            Self::Timeout => "Timeout",
            Self::ProcessExited => "Engine Process Exited",
            Self::EngineUnavailable => "Engine Unavailable",
            Self::ShuttingDown => "Shutting Down",
            Self::TokenInvalid => "Token Invalid",
            Self::UnsupportedMediaType => "Unsupported Media Type",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::CapacityExceeded => 503,
            Self::Timeout => 504,
            Self::ProcessExited => 502,
            Self::EngineUnavailable => 502,
            Self::ShuttingDown => 503,
            Self::TokenInvalid => 401,
            Self::UnsupportedMediaType => 415,
        }
    }
}

/// RFC 7807 problem document returned by every failing HTTP route.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("bridge is at capacity ({ceiling} requests in flight)")]
    CapacityExceeded { ceiling: usize },
    #[error("timed out after {timeout_ms}ms waiting for `{method}`")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("engine process exited")]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: Option<String>,
    },
    #[error("engine unavailable: {message}")]
    EngineUnavailable { message: String },
    #[error("bridge is shutting down")]
    ShuttingDown,
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::CapacityExceeded { .. } => ErrorType::CapacityExceeded,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::ProcessExited { .. } => ErrorType::ProcessExited,
            Self::EngineUnavailable { .. } => ErrorType::EngineUnavailable,
            Self::ShuttingDown => ErrorType::ShuttingDown,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
        }
    }

    /// Machine-readable fields carried next to the human-readable detail.
    pub fn details(&self) -> Option<Value> {
        let mut map = Map::new();
        match self {
            Self::CapacityExceeded { ceiling } => {
                map.insert("maxInFlight".to_string(), Value::from(*ceiling));
            }
            Self::Timeout { method, timeout_ms } => {
                map.insert("method".to_string(), Value::String(method.clone()));
                map.insert("timeoutMs".to_string(), Value::from(*timeout_ms));
            }
            Self::ProcessExited {
                code,
                signal,
                stderr,
            } => {
                if let Some(code) = code {
                    map.insert("exitCode".to_string(), Value::from(*code));
                }
                if let Some(signal) = signal {
                    map.insert("signal".to_string(), Value::from(*signal));
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::TokenInvalid {
                message: Some(message),
            } => {
                map.insert("message".to_string(), Value::String(message.clone()));
            }
            _ => {}
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(details) = self.details() {
            problem.extensions.insert("details".to_string(), details);
        }
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_urn_and_status() {
        let problem = GatewayError::CapacityExceeded { ceiling: 5 }.to_problem_details();
        assert_eq!(problem.type_, "urn:engine-bridge:error:capacity_exceeded");
        assert_eq!(problem.status, 503);
        assert_eq!(problem.extensions["details"]["maxInFlight"], 5);

        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "urn:engine-bridge:error:capacity_exceeded");
        assert_eq!(json["title"], "Capacity Exceeded");
        assert_eq!(json["details"]["maxInFlight"], 5);
    }

    #[test]
    fn exit_details_skip_missing_fields() {
        let problem = GatewayError::ProcessExited {
            code: Some(2),
            signal: None,
            stderr: None,
        }
        .to_problem_details();
        assert_eq!(problem.status, 502);
        let details = &problem.extensions["details"];
        assert_eq!(details["exitCode"], 2);
        assert!(details.get("signal").is_none());
        assert!(details.get("stderr").is_none());

        let shutting_down = GatewayError::ShuttingDown.to_problem_details();
        assert!(shutting_down.extensions.is_empty());
    }
}
