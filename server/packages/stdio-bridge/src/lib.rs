//! Multiplexes concurrent JSON-RPC callers onto one child process that speaks
//! newline-delimited JSON over stdin/stdout.

pub mod admission;
pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod fanout;
pub mod framing;
pub mod handshake;
pub mod launch;
pub mod mock;
pub mod supervisor;

pub use admission::{AdmissionController, AdmissionPermit, Gateway, GatewayStatus};
pub use bridge::{BridgeStatus, ProcessBridge, PROCESS_EXITED_METHOD};
pub use config::{BridgeConfig, HandshakeConfig};
pub use error::BridgeError;
pub use fanout::{ListenerGuard, Notification, NotificationFanout, SubscriberId, Subscription};
pub use handshake::HandshakeState;
pub use launch::{LaunchError, LaunchSpec};
pub use supervisor::ExitInfo;
