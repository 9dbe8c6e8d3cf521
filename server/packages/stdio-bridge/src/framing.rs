//! Newline-delimited JSON framing for the engine's stdout.
//!
//! The engine writes one JSON document per line, but reads from a pipe hand
//! back arbitrary chunks. [`LineDecoder`] keeps the unterminated tail of each
//! chunk until the rest of the line arrives. Lines that are not valid JSON are
//! logged and skipped: some engines print diagnostics on stdout and those
//! must never stall the lines after them.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const LOG_PREVIEW_BYTES: usize = 200;

#[derive(Debug)]
pub struct LineDecoder {
    carry: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
    line_count: u64,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            carry: Vec::new(),
            max_line_bytes,
            discarding: false,
            line_count: 0,
        }
    }

    /// Feeds one chunk and returns every document completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut decoded = Vec::new();
        let mut rest = chunk;

        while let Some(newline) = rest.iter().position(|byte| *byte == b'\n') {
            let (head, tail) = rest.split_at(newline);
            rest = &tail[1..];

            if self.discarding {
                // Tail of an oversized line.
                self.discarding = false;
                self.carry.clear();
                continue;
            }

            let line_bytes = self.carry.len() + head.len();
            if line_bytes > self.max_line_bytes {
                tracing::warn!(
                    line_bytes = line_bytes,
                    max_line_bytes = self.max_line_bytes,
                    "engine stdout: line exceeds limit, discarding"
                );
                self.carry.clear();
                continue;
            }

            if self.carry.is_empty() {
                self.decode_line(head, &mut decoded);
            } else {
                self.carry.extend_from_slice(head);
                let line = std::mem::take(&mut self.carry);
                self.decode_line(&line, &mut decoded);
            }
        }

        if !self.discarding {
            self.carry.extend_from_slice(rest);
            if self.carry.len() > self.max_line_bytes {
                tracing::warn!(
                    buffered_bytes = self.carry.len(),
                    max_line_bytes = self.max_line_bytes,
                    "engine stdout: line exceeds limit, discarding"
                );
                self.carry.clear();
                self.discarding = true;
            }
        }

        decoded
    }

    /// Decodes whatever unterminated fragment is left once the stream ends.
    pub fn finish(&mut self) -> Option<Value> {
        let discarding = std::mem::replace(&mut self.discarding, false);
        let line = std::mem::take(&mut self.carry);
        if discarding {
            return None;
        }
        let mut decoded = Vec::with_capacity(1);
        self.decode_line(&line, &mut decoded);
        decoded.pop()
    }

    /// Bytes currently held back waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<Value>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        self.line_count += 1;
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => out.push(value),
            Err(err) => {
                let preview = String::from_utf8_lossy(&line[..line.len().min(LOG_PREVIEW_BYTES)]);
                tracing::warn!(
                    error = %err,
                    line_number = self.line_count,
                    raw = %preview,
                    "engine stdout: invalid JSON, skipping line"
                );
            }
        }
    }
}

/// Async reader yielding one decoded document at a time.
#[derive(Debug)]
pub struct FramedReader<R> {
    inner: R,
    decoder: LineDecoder,
    ready: VecDeque<Value>,
    buffer: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_decoder(inner, LineDecoder::new())
    }

    pub fn with_decoder(inner: R, decoder: LineDecoder) -> Self {
        Self {
            inner,
            decoder,
            ready: VecDeque::new(),
            buffer: vec![0; READ_CHUNK_BYTES],
            eof: false,
        }
    }

    /// Returns the next document, or `Ok(None)` once the stream has ended.
    pub async fn next_message(&mut self) -> std::io::Result<Option<Value>> {
        loop {
            if let Some(value) = self.ready.pop_front() {
                return Ok(Some(value));
            }
            if self.eof {
                return Ok(None);
            }

            let read = self.inner.read(&mut self.buffer).await?;
            if read == 0 {
                self.eof = true;
                if let Some(value) = self.decoder.finish() {
                    self.ready.push_back(value);
                }
                continue;
            }
            self.ready.extend(self.decoder.push(&self.buffer[..read]));
        }
    }
}

/// One inbound document after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Answer to a request the bridge sent.
    Response {
        id: Value,
        outcome: Result<Value, Value>,
    },
    /// Anything carrying a method name, including engine-initiated requests.
    Notification {
        method: String,
        params: Value,
        id: Option<Value>,
    },
    /// Neither a method nor an id.
    Unrecognized(Value),
}

pub fn classify(value: Value) -> DecodedMessage {
    if let Some(method) = value.get("method").and_then(Value::as_str) {
        return DecodedMessage::Notification {
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
            id: value.get("id").cloned(),
        };
    }

    match value.get("id") {
        Some(id) if !id.is_null() => {
            let outcome = match value.get("error") {
                Some(error) if !error.is_null() => Err(error.clone()),
                _ => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            };
            DecodedMessage::Response {
                id: id.clone(),
                outcome,
            }
        }
        _ => DecodedMessage::Unrecognized(value),
    }
}

/// Correlation key for an id: its compact JSON text, so `1` and `"1"` differ.
pub fn id_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Serializes one message as a single line, terminator included.
pub fn encode_line(message: &Value) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_complete_line() {
        let mut decoder = LineDecoder::new();
        let out = decoder.push(b"{\"id\":1}\n{\"id\":2}\n");
        assert_eq!(out, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn document_split_across_chunks_decodes_once() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"jsonrpc\":\"2.0\",\"id\":7,").is_empty());
        assert!(decoder.pending_bytes() > 0);
        let out = decoder.push(b"\"result\":{\"ok\":true}}\n");
        assert_eq!(out, vec![json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}})]);
        assert!(decoder.push(b"").is_empty());
    }

    #[test]
    fn noise_lines_are_skipped() {
        let mut decoder = LineDecoder::new();
        let out = decoder.push(b"Listening on stdio\n{\"id\":1}\n\n   \nnot json {\n{\"id\":2}\n");
        assert_eq!(out, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[test]
    fn crlf_terminators_are_accepted() {
        let mut decoder = LineDecoder::new();
        let out = decoder.push(b"{\"id\":1}\r\n");
        assert_eq!(out, vec![json!({"id": 1})]);
    }

    #[test]
    fn oversized_line_is_dropped_without_losing_the_next() {
        let mut decoder = LineDecoder::with_max_line_bytes(16);
        assert!(decoder.push(b"{\"padding\":\"aaaaaaaaaaaaaaaaaaaa").is_empty());
        assert_eq!(decoder.pending_bytes(), 0);
        let out = decoder.push(b"aaaa\"}\n{\"id\":3}\n");
        assert_eq!(out, vec![json!({"id": 3})]);
    }

    #[test]
    fn oversized_complete_lines_are_dropped() {
        let mut decoder = LineDecoder::with_max_line_bytes(16);
        let out = decoder.push(b"{\"padding\":\"aaaaaaaaaaaa\"}\n{\"id\":1}\n");
        assert_eq!(out, vec![json!({"id": 1})]);

        // Carry and head are each under the limit, together over it.
        assert!(decoder.push(b"{\"pad\":\"aaaa").is_empty());
        let out = decoder.push(b"aaaaaaa\"}\n{\"id\":2}\n");
        assert_eq!(out, vec![json!({"id": 2})]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn finish_decodes_unterminated_tail() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"id\":9}").is_empty());
        assert_eq!(decoder.finish(), Some(json!({"id": 9})));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn framed_reader_reassembles_across_reads() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut framed = FramedReader::new(reader);

        let producer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(b"{\"method\":\"a\"").await.unwrap();
            writer.flush().await.unwrap();
            tokio::task::yield_now().await;
            writer.write_all(b"}\ngarbage\n{\"id\":1,\"result\":2}\n").await.unwrap();
        });

        let first = framed.next_message().await.unwrap();
        assert_eq!(first, Some(json!({"method": "a"})));
        let second = framed.next_message().await.unwrap();
        assert_eq!(second, Some(json!({"id": 1, "result": 2})));
        producer.await.unwrap();
        assert_eq!(framed.next_message().await.unwrap(), None);
    }

    #[test]
    fn classify_distinguishes_shapes() {
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "id": 1, "result": {"x": 1}})),
            DecodedMessage::Response {
                id: json!(1),
                outcome: Ok(json!({"x": 1})),
            }
        );
        assert_eq!(
            classify(json!({"id": "a", "error": {"code": 1, "message": "bad"}})),
            DecodedMessage::Response {
                id: json!("a"),
                outcome: Err(json!({"code": 1, "message": "bad"})),
            }
        );
        assert_eq!(
            classify(json!({"method": "page/loaded", "params": {"url": "x"}})),
            DecodedMessage::Notification {
                method: "page/loaded".to_string(),
                params: json!({"url": "x"}),
                id: None,
            }
        );
        assert!(matches!(
            classify(json!({"method": "elicit", "id": 4})),
            DecodedMessage::Notification { id: Some(_), .. }
        ));
        assert!(matches!(
            classify(json!({"result": 1})),
            DecodedMessage::Unrecognized(_)
        ));
    }

    #[test]
    fn id_keys_keep_numbers_and_strings_apart() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
        assert_eq!(id_key(&json!(42)), "42");
    }
}
