use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::bridge::{BridgeStatus, ProcessBridge};
use crate::error::BridgeError;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;
pub const ENV_MAX_IN_FLIGHT: &str = "ENGINE_BRIDGE_MAX_IN_FLIGHT";

/// Caps the number of requests inside the bridge at once. Requests over the
/// ceiling are refused immediately; nothing is queued.
#[derive(Debug)]
pub struct AdmissionController {
    ceiling: usize,
    in_flight: AtomicUsize,
    rejected: AtomicU64,
}

impl AdmissionController {
    /// A ceiling of zero is treated as one.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            in_flight: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn try_admit(&self) -> Result<AdmissionPermit<'_>, BridgeError> {
        let admitted = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.ceiling).then_some(current + 1)
            });
        match admitted {
            Ok(_) => Ok(AdmissionPermit { controller: self }),
            Err(current) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    in_flight = current,
                    ceiling = self.ceiling,
                    "admission: request refused, bridge at capacity"
                );
                Err(BridgeError::CapacityExceeded {
                    ceiling: self.ceiling,
                })
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Holds one admission slot; the slot is released on drop, whatever the
/// outcome of the request.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    controller: &'a AdmissionController,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    #[serde(flatten)]
    pub bridge: BridgeStatus,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub rejected_requests: u64,
}

/// The bridge behind an admission ceiling; what outer surfaces call into.
#[derive(Debug, Clone)]
pub struct Gateway {
    bridge: ProcessBridge,
    admission: Arc<AdmissionController>,
}

impl Gateway {
    pub fn new(bridge: ProcessBridge, max_in_flight: usize) -> Self {
        Self {
            bridge,
            admission: Arc::new(AdmissionController::new(max_in_flight)),
        }
    }

    pub fn bridge(&self) -> &ProcessBridge {
        &self.bridge
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Forwards a request if a slot is free, with a bridge-assigned id.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let _permit = self.admission.try_admit()?;
        self.bridge.send(method, params, None).await
    }

    /// Notifications are not round trips and bypass the ceiling.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        self.bridge.notify(method, params).await
    }

    pub async fn send_raw(&self, message: Value) -> Result<(), BridgeError> {
        self.bridge.send_raw(message).await
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            bridge: self.bridge.status().await,
            in_flight: self.admission.in_flight(),
            max_in_flight: self.admission.ceiling(),
            rejected_requests: self.admission.rejected(),
        }
    }
}
