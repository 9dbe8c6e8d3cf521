use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::correlation::{CorrelationTable, PendingGuard};
use crate::error::BridgeError;
use crate::fanout::{NotificationFanout, Subscription};
use crate::framing::{classify, encode_line, id_key, DecodedMessage};
use crate::handshake::{HandshakeSequencer, HandshakeState};
use crate::supervisor::{ExitInfo, LineWriter, ProcessEvent, ProcessHandle, ProcessSupervisor};

/// Method of the synthetic notification published when the engine exits.
pub const PROCESS_EXITED_METHOD: &str = "bridge/processExited";

/// Point-in-time view of the bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub generation: u64,
    pub spawn_count: u64,
    pub handshake: HandshakeState,
    pub handshake_attempts: u64,
    pub pending_requests: usize,
    pub subscribers: usize,
    /// Notifications skipped for subscribers whose queue was full.
    pub dropped_notifications: u64,
    pub uptime_ms: Option<u64>,
    pub command: String,
    pub server_info: Option<Value>,
    pub shut_down: bool,
}

/// Request/response multiplexer in front of one stdio engine process.
///
/// Any number of tasks may call [`ProcessBridge::send`] concurrently; each
/// gets exactly the response carrying its id. The engine is spawned and
/// initialized lazily on first use and again after it exits.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    inner: Arc<BridgeInner>,
}

#[derive(Debug)]
struct BridgeInner {
    config: BridgeConfig,
    supervisor: ProcessSupervisor,
    table: Arc<CorrelationTable>,
    handshake: HandshakeSequencer,
    fanout: NotificationFanout,
}

impl ProcessBridge {
    /// Must be called inside a tokio runtime; the event router is spawned here.
    pub fn new(config: BridgeConfig) -> Self {
        let fanout = NotificationFanout::new(config.notification_buffer);
        Self::with_fanout(config, fanout)
    }

    pub fn with_fanout(config: BridgeConfig, fanout: NotificationFanout) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let table = Arc::new(CorrelationTable::new());
        let handshake = HandshakeSequencer::new();

        tokio::spawn(route_events(
            events_rx,
            table.clone(),
            handshake.clone(),
            fanout.clone(),
        ));

        let supervisor =
            ProcessSupervisor::new(config.launch.clone(), config.max_line_bytes, events_tx);
        Self {
            inner: Arc::new(BridgeInner {
                config,
                supervisor,
                table,
                handshake,
                fanout,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn notifications(&self) -> &NotificationFanout {
        &self.inner.fanout
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.fanout.subscribe()
    }

    /// Sends a request and waits for its response using the configured timeout.
    ///
    /// `id` is optional; when absent the bridge assigns the next integer id.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        id: Option<Value>,
    ) -> Result<Value, BridgeError> {
        self.send_with_timeout(method, params, id, self.inner.config.request_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        id: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        if method.is_empty() {
            return Err(BridgeError::InvalidEnvelope("method must not be empty".into()));
        }
        let id = match id {
            None | Some(Value::Null) => None,
            Some(id @ (Value::Number(_) | Value::String(_))) => Some(id),
            Some(other) => {
                return Err(BridgeError::InvalidEnvelope(format!(
                    "id must be a string or number, got {other}"
                )))
            }
        };

        let handle = self.ensure_initialized().await?;
        self.inner
            .dispatch(&handle, method, params, id, timeout)
            .await
    }

    /// Sends a notification; nothing is awaited besides the write itself.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        if method.is_empty() {
            return Err(BridgeError::InvalidEnvelope("method must not be empty".into()));
        }
        self.send_raw(notification_envelope(method, params)).await
    }

    /// Writes an arbitrary JSON object to the engine, e.g. the answer to an
    /// engine-initiated request.
    pub async fn send_raw(&self, message: Value) -> Result<(), BridgeError> {
        if !message.is_object() {
            return Err(BridgeError::InvalidEnvelope(
                "message must be a json object".into(),
            ));
        }
        let handle = self.ensure_initialized().await?;
        self.inner
            .write_message(&handle, &message, self.inner.config.request_timeout)
            .await
    }

    /// Spawns the engine if needed and completes the handshake for it.
    pub async fn ensure_initialized(&self) -> Result<Arc<ProcessHandle>, BridgeError> {
        let handle = self.inner.supervisor.ensure_running().await?;
        let inner = self.inner.clone();
        let bootstrap = handle.clone();
        self.inner
            .handshake
            .ensure(handle.generation(), move || async move {
                inner.bootstrap(&bootstrap).await
            })
            .await?;
        Ok(handle)
    }

    /// Kills the running engine. Its pending requests fail with
    /// `ProcessExited`; the next call spawns a fresh process.
    pub async fn restart(&self) -> Option<ExitInfo> {
        tracing::info!("bridge: restart requested");
        self.inner.supervisor.kill_current().await
    }

    /// Stops the engine and rejects every outstanding and future request.
    pub async fn shutdown(&self) {
        let exit = self.inner.supervisor.shutdown().await;
        let error = exit.map(ExitInfo::into_error).unwrap_or(BridgeError::Shutdown);
        let failed = self.inner.table.fail_all(&error);
        tracing::info!(failed_requests = failed, "bridge: shut down");
    }

    pub async fn status(&self) -> BridgeStatus {
        let current = self.inner.supervisor.current().await;
        BridgeStatus {
            running: current.is_some(),
            pid: current.as_ref().and_then(|handle| handle.pid()),
            generation: current
                .as_ref()
                .map(|handle| handle.generation())
                .unwrap_or_else(|| self.inner.supervisor.spawn_count()),
            spawn_count: self.inner.supervisor.spawn_count(),
            handshake: self.inner.handshake.state(),
            handshake_attempts: self.inner.handshake.attempts(),
            pending_requests: self.inner.table.len(),
            subscribers: self.inner.fanout.subscriber_count(),
            dropped_notifications: self.inner.fanout.dropped_notifications(),
            uptime_ms: current
                .as_ref()
                .map(|handle| handle.uptime().as_millis() as u64),
            command: self.inner.config.launch.display(),
            server_info: self.inner.handshake.server_info(),
            shut_down: self.inner.supervisor.is_closed(),
        }
    }
}

impl BridgeInner {
    async fn bootstrap(&self, handle: &ProcessHandle) -> Result<Value, BridgeError> {
        let handshake = &self.config.handshake;
        let server_info = self
            .dispatch(
                handle,
                &handshake.initialize_method,
                handshake.initialize_params.clone(),
                None,
                self.config.request_timeout,
            )
            .await?;
        self.write_message(
            handle,
            &notification_envelope(&handshake.initialized_method, Value::Null),
            self.config.request_timeout,
        )
        .await?;
        Ok(server_info)
    }

    async fn dispatch(
        &self,
        handle: &ProcessHandle,
        method: &str,
        params: Value,
        id: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let id = id.unwrap_or_else(|| Value::from(self.table.next_id()));
        let key = id_key(&id);
        let mut message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if !params.is_null() {
            message["params"] = params;
        }
        let frame = encode_line(&message).map_err(BridgeError::serialize)?;

        // The deadline covers the writer lock and the write as well as the
        // wait, so an engine that stops reading stdin cannot stall a caller.
        let deadline = tokio::time::Instant::now() + timeout;

        // Registration happens under the writer lock and before the write, so
        // the response can never arrive ahead of its record.
        let (mut rx, guard) = {
            let mut writer = lock_writer(handle, deadline, method, timeout).await?;
            let rx = self
                .table
                .register(key.clone(), method, handle.generation())?;
            let guard = PendingGuard::new(&self.table, key);
            write_within(handle, &mut writer, &frame, deadline, method, timeout).await?;
            (rx, guard)
        };

        let started = Instant::now();
        tracing::debug!(
            method = method,
            id = guard.key(),
            generation = handle.generation(),
            "bridge: request written"
        );

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => {
                tracing::debug!(
                    method = method,
                    id = guard.key(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "bridge: response delivered"
                );
                outcome
            }
            Ok(Err(_)) => Err(BridgeError::NotRunning),
            Err(_) => {
                if guard.take() {
                    tracing::warn!(
                        method = method,
                        id = guard.key(),
                        timeout_ms = timeout.as_millis() as u64,
                        "bridge: request timed out"
                    );
                    return Err(timeout_error(method, timeout));
                }
                // Resolved in the same instant the deadline fired.
                rx.try_recv()
                    .unwrap_or_else(|_| Err(timeout_error(method, timeout)))
            }
        }
    }

    async fn write_message(
        &self,
        handle: &ProcessHandle,
        message: &Value,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        let frame = encode_line(message).map_err(BridgeError::serialize)?;
        let label = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("response");
        let deadline = tokio::time::Instant::now() + timeout;
        let mut writer = lock_writer(handle, deadline, label, timeout).await?;
        write_within(handle, &mut writer, &frame, deadline, label, timeout).await
    }
}

fn timeout_error(method: &str, timeout: Duration) -> BridgeError {
    BridgeError::Timeout {
        method: method.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

async fn lock_writer<'a>(
    handle: &'a ProcessHandle,
    deadline: tokio::time::Instant,
    method: &str,
    timeout: Duration,
) -> Result<LineWriter<'a>, BridgeError> {
    match tokio::time::timeout_at(deadline, handle.writer()).await {
        Ok(writer) => writer,
        Err(_) => {
            tracing::warn!(
                method = method,
                generation = handle.generation(),
                timeout_ms = timeout.as_millis() as u64,
                "bridge: engine stdin still busy at the deadline"
            );
            Err(timeout_error(method, timeout))
        }
    }
}

/// A write cut off by the deadline may leave half a frame on stdin, so the
/// engine is killed rather than reused.
async fn write_within(
    handle: &ProcessHandle,
    writer: &mut LineWriter<'_>,
    frame: &[u8],
    deadline: tokio::time::Instant,
    method: &str,
    timeout: Duration,
) -> Result<(), BridgeError> {
    match tokio::time::timeout_at(deadline, writer.write_frame(frame)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(
                method = method,
                generation = handle.generation(),
                pid = handle.pid(),
                timeout_ms = timeout.as_millis() as u64,
                "bridge: engine stopped reading stdin, killing it"
            );
            handle.kill();
            Err(timeout_error(method, timeout))
        }
    }
}

fn notification_envelope(method: &str, params: Value) -> Value {
    let mut message = json!({
        "jsonrpc": "2.0",
        "method": method,
    });
    if !params.is_null() {
        message["params"] = params;
    }
    message
}

async fn route_events(
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    table: Arc<CorrelationTable>,
    handshake: HandshakeSequencer,
    fanout: NotificationFanout,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Message {
                generation,
                payload,
            } => route_message(generation, payload, &table, &fanout),
            ProcessEvent::Exited { generation, exit } => {
                handshake.reset(generation);
                let failed = table.fail_generation(generation, &exit.clone().into_error());
                if failed > 0 {
                    tracing::warn!(
                        generation = generation,
                        failed_requests = failed,
                        "bridge: rejected requests of exited engine"
                    );
                }
                fanout.publish(
                    PROCESS_EXITED_METHOD,
                    json!({
                        "generation": generation,
                        "code": exit.code,
                        "signal": exit.signal,
                        "stderrTail": exit.stderr_tail,
                        "failedRequests": failed,
                    }),
                    None,
                );
            }
        }
    }
    tracing::debug!("bridge: event router stopped");
}

fn route_message(
    generation: u64,
    payload: Value,
    table: &CorrelationTable,
    fanout: &NotificationFanout,
) {
    match classify(payload) {
        DecodedMessage::Response { id, outcome } => {
            let key = id_key(&id);
            let outcome = outcome.map_err(|error| BridgeError::from_rpc_error(&error));
            match table.complete(&key, outcome) {
                Some(elapsed) => tracing::trace!(
                    id = %key,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "bridge: response routed"
                ),
                None => tracing::debug!(
                    id = %key,
                    generation = generation,
                    "bridge: dropping response with no pending request"
                ),
            }
        }
        DecodedMessage::Notification { method, params, id } => {
            fanout.publish(method, params, id);
        }
        DecodedMessage::Unrecognized(value) => {
            tracing::warn!(
                generation = generation,
                message = %value,
                "bridge: ignoring message with neither method nor id"
            );
        }
    }
}
