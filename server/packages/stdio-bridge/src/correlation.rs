use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BridgeError;

pub type Outcome = Result<Value, BridgeError>;

/// One outstanding round trip.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
    pub generation: u64,
    pub registered_at: Instant,
    responder: oneshot::Sender<Outcome>,
}

/// Outstanding requests keyed by correlation id.
///
/// A key leaves the table exactly once: through `complete`, `remove`, or one
/// of the `fail_*` purges. Whoever removes it owns the responder, and the
/// responder is fired while the lock is held so a caller that finds its key
/// gone can rely on the outcome already sitting in its receiver.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
    next_id: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next auto-assigned id, starting at 1.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register(
        &self,
        key: String,
        method: &str,
        generation: u64,
    ) -> Result<oneshot::Receiver<Outcome>, BridgeError> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(BridgeError::DuplicateId(key));
        }
        let (responder, rx) = oneshot::channel();
        entries.insert(
            key,
            PendingRequest {
                method: method.to_string(),
                generation,
                registered_at: Instant::now(),
                responder,
            },
        );
        Ok(rx)
    }

    /// Resolves `key` with `outcome`. Returns the elapsed time if the key was
    /// pending, `None` for stale or unknown ids.
    pub fn complete(&self, key: &str, outcome: Outcome) -> Option<Duration> {
        let mut entries = self.lock();
        let pending = entries.remove(key)?;
        let elapsed = pending.registered_at.elapsed();
        // The caller may have given up already; nothing to do then.
        let _ = pending.responder.send(outcome);
        Some(elapsed)
    }

    /// Drops `key` without resolving it.
    pub fn remove(&self, key: &str) -> Option<PendingRequest> {
        self.lock().remove(key)
    }

    /// Fails every request dispatched to process `generation`.
    pub fn fail_generation(&self, generation: u64, error: &BridgeError) -> usize {
        let mut entries = self.lock();
        let keys = entries
            .iter()
            .filter(|(_, pending)| pending.generation == generation)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &keys {
            if let Some(pending) = entries.remove(key) {
                let _ = pending.responder.send(Err(error.clone()));
            }
        }
        keys.len()
    }

    pub fn fail_all(&self, error: &BridgeError) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        for (_, pending) in entries.drain() {
            let _ = pending.responder.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Removes its key from the table when dropped, so a caller that abandons a
/// request never leaves a record behind.
pub(crate) struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    key: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a CorrelationTable, key: String) -> Self {
        Self { table, key }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Removes the record now; true if it was still pending.
    pub(crate) fn take(&self) -> bool {
        self.table.remove(&self.key).is_some()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}
