use std::time::Duration;

use serde_json::{json, Value};

use crate::fanout::DEFAULT_SUBSCRIBER_BUFFER;
use crate::framing::DEFAULT_MAX_LINE_BYTES;
use crate::launch::LaunchSpec;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

pub const ENV_REQUEST_TIMEOUT_MS: &str = "ENGINE_BRIDGE_REQUEST_TIMEOUT_MS";
pub const ENV_NOTIFICATION_BUFFER: &str = "ENGINE_BRIDGE_NOTIFICATION_BUFFER";
pub const ENV_MAX_LINE_BYTES: &str = "ENGINE_BRIDGE_MAX_LINE_BYTES";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub launch: LaunchSpec,
    /// Deadline for one request/response round trip.
    pub request_timeout: Duration,
    pub handshake: HandshakeConfig,
    pub max_line_bytes: usize,
    /// Queue depth of each notification subscriber.
    pub notification_buffer: usize,
}

impl BridgeConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            handshake: HandshakeConfig::default(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            notification_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }

    /// Defaults overridden by `ENGINE_BRIDGE_*` environment variables.
    pub fn from_env(launch: LaunchSpec) -> Self {
        let defaults = Self::new(launch);
        Self {
            request_timeout: duration_from_env_ms(ENV_REQUEST_TIMEOUT_MS, defaults.request_timeout),
            notification_buffer: usize_from_env(
                ENV_NOTIFICATION_BUFFER,
                defaults.notification_buffer,
            ),
            max_line_bytes: usize_from_env(ENV_MAX_LINE_BYTES, defaults.max_line_bytes),
            ..defaults
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_notification_buffer(mut self, buffer: usize) -> Self {
        self.notification_buffer = buffer;
        self
    }
}

/// The initialize/initialized exchange sent to every fresh process.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub initialize_method: String,
    pub initialize_params: Value,
    pub initialized_method: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            initialize_method: "initialize".to_string(),
            initialize_params: json!({
                "protocolVersion": DEFAULT_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            initialized_method: "notifications/initialized".to_string(),
        }
    }
}

pub fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}

pub fn usize_from_env(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|value| *value > 0)
            .unwrap_or(default),
        Err(_) => default,
    }
}

pub fn bool_from_env(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed == "1" || trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("yes")
    {
        Some(true)
    } else if trimmed == "0"
        || trimmed.eq_ignore_ascii_case("false")
        || trimmed.eq_ignore_ascii_case("no")
    {
        Some(false)
    } else {
        None
    }
}
