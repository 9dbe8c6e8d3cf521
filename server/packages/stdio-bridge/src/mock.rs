//! A scriptable stdio engine used by the test suites and for local smoke tests.
//!
//! It speaks newline-delimited JSON-RPC on stdin/stdout and refuses ordinary
//! requests until the client has completed the initialize handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{oneshot, Mutex};

pub const BANNER: &str = "mock-engine starting up (this line is not json)";
pub const NOT_INITIALIZED: i64 = -32002;
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Answer `initialize` with an error.
    pub fail_initialize: bool,
}

impl MockOptions {
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for arg in args {
            if arg.as_ref() == "--fail-initialize" {
                options.fail_initialize = true;
            }
        }
        options
    }
}

#[derive(Default)]
struct MockState {
    options: MockOptions,
    initialize_count: AtomicU64,
    initialized_count: AtomicU64,
    initialized: AtomicBool,
    next_ask: AtomicU64,
    asks: std::sync::Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

type SharedStdout = Arc<Mutex<Stdout>>;

/// Serves stdin until EOF.
pub async fn run(options: MockOptions) -> std::io::Result<()> {
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let state = Arc::new(MockState {
        options,
        ..MockState::default()
    });

    write_line(&stdout, BANNER).await?;
    tracing::info!(
        fail_initialize = state.options.fail_initialize,
        "mock engine ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let message = match serde_json::from_str::<Value>(&line) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "mock engine: ignoring unparseable line");
                continue;
            }
        };

        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").cloned().filter(|id| !id.is_null());
        match (method, id) {
            (Some(method), Some(id)) => {
                let method = method.to_string();
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let stdout = stdout.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_request(&stdout, &state, id, &method, params).await {
                        tracing::error!(error = %err, method = %method, "mock engine: write failed");
                    }
                });
            }
            (Some(method), None) => handle_notification(&state, method),
            (None, Some(id)) => {
                let key = serde_json::to_string(&id).unwrap_or_default();
                let waiter = state.asks.lock().ok().and_then(|mut asks| asks.remove(&key));
                match waiter {
                    Some(waiter) => {
                        let answer = message
                            .get("result")
                            .or_else(|| message.get("error"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let _ = waiter.send(answer);
                    }
                    None => tracing::warn!(id = %key, "mock engine: response to unknown ask"),
                }
            }
            (None, None) => tracing::warn!("mock engine: message with neither method nor id"),
        }
    }

    tracing::info!("mock engine: stdin closed");
    Ok(())
}

fn handle_notification(state: &MockState, method: &str) {
    if method == "notifications/initialized" {
        state.initialized_count.fetch_add(1, Ordering::SeqCst);
        state.initialized.store(true, Ordering::SeqCst);
    } else {
        tracing::debug!(method = method, "mock engine: notification received");
    }
}

async fn handle_request(
    stdout: &SharedStdout,
    state: &MockState,
    id: Value,
    method: &str,
    params: Value,
) -> std::io::Result<()> {
    if method == "initialize" {
        state.initialize_count.fetch_add(1, Ordering::SeqCst);
        if state.options.fail_initialize {
            return write_error(stdout, id, -32000, "initialize refused", None).await;
        }
        return write_result(
            stdout,
            id,
            json!({
                "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(Value::Null),
                "serverInfo": {"name": "mock-engine", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {},
            }),
        )
        .await;
    }

    if !state.initialized.load(Ordering::SeqCst) {
        return write_error(stdout, id, NOT_INITIALIZED, "engine not initialized", None).await;
    }

    match method {
        "mock/echo" => {
            write_result(stdout, id, json!({"method": method, "params": params})).await
        }
        "mock/sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            write_result(stdout, id, json!({"value": value, "sleptMs": ms})).await
        }
        "mock/error" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("mock failure")
                .to_string();
            write_error(stdout, id, code, &message, Some(params)).await
        }
        "mock/notify" => {
            let count = params.get("count").and_then(Value::as_u64).unwrap_or(1);
            let notify_method = params
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("mock/event");
            for index in 0..count {
                write_message(
                    stdout,
                    &json!({
                        "jsonrpc": "2.0",
                        "method": notify_method,
                        "params": {"index": index},
                    }),
                )
                .await?;
            }
            write_result(stdout, id, json!({"sent": count})).await
        }
        "mock/split" => {
            let line = encode(&json!({"jsonrpc": "2.0", "id": id, "result": {"split": true}}));
            let (head, tail) = line.split_at(line.len() / 2);
            let mut out = stdout.lock().await;
            out.write_all(head).await?;
            out.flush().await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            out.write_all(tail).await?;
            out.flush().await
        }
        "mock/noise" => {
            let mut out = stdout.lock().await;
            out.write_all(b"warning: engine is feeling chatty\n{not json either\n")
                .await?;
            out.write_all(&encode(
                &json!({"jsonrpc": "2.0", "id": id, "result": {"noisy": true}}),
            ))
            .await?;
            out.flush().await
        }
        "mock/env" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let cwd = std::env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default();
            write_result(
                stdout,
                id,
                json!({"cwd": cwd, "value": std::env::var(name).ok()}),
            )
            .await
        }
        "mock/ignore" => Ok(()),
        "mock/exit" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
            tracing::warn!(code = code, "mock engine: exiting on request");
            stdout.lock().await.flush().await?;
            std::process::exit(code);
        }
        "mock/stats" => {
            write_result(
                stdout,
                id,
                json!({
                    "initializeCount": state.initialize_count.load(Ordering::SeqCst),
                    "initializedCount": state.initialized_count.load(Ordering::SeqCst),
                }),
            )
            .await
        }
        "mock/ask" => {
            let ask_id = format!("ask-{}", state.next_ask.fetch_add(1, Ordering::SeqCst) + 1);
            let (tx, rx) = oneshot::channel();
            if let Ok(mut asks) = state.asks.lock() {
                asks.insert(serde_json::to_string(&json!(ask_id)).unwrap_or_default(), tx);
            }
            write_message(
                stdout,
                &json!({
                    "jsonrpc": "2.0",
                    "id": ask_id,
                    "method": "mock/question",
                    "params": {"prompt": params.get("prompt").cloned().unwrap_or(Value::Null)},
                }),
            )
            .await?;
            let answer = rx.await.unwrap_or(Value::Null);
            write_result(stdout, id, json!({"answer": answer})).await
        }
        other => {
            write_error(
                stdout,
                id,
                METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
                None,
            )
            .await
        }
    }
}

fn encode(message: &Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(message).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

async fn write_line(stdout: &SharedStdout, line: &str) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

async fn write_message(stdout: &SharedStdout, message: &Value) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(&encode(message)).await?;
    out.flush().await
}

async fn write_result(stdout: &SharedStdout, id: Value, result: Value) -> std::io::Result<()> {
    write_message(
        stdout,
        &json!({"jsonrpc": "2.0", "id": id, "result": result}),
    )
    .await
}

async fn write_error(
    stdout: &SharedStdout,
    id: Value,
    code: i64,
    message: &str,
    data: Option<Value>,
) -> std::io::Result<()> {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data.filter(|data| !data.is_null()) {
        error["data"] = data;
    }
    write_message(
        stdout,
        &json!({"jsonrpc": "2.0", "id": id, "error": error}),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_known_flags_only() {
        let options = MockOptions::from_args(["--verbose", "--fail-initialize"]);
        assert!(options.fail_initialize);
        assert!(!MockOptions::from_args(Vec::<String>::new()).fail_initialize);
    }
}
