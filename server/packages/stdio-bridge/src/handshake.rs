use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::BridgeError;

type Outcome = Option<Result<Value, BridgeError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Uninitialized,
    Initializing,
    Ready,
}

#[derive(Debug)]
enum Phase {
    Uninitialized,
    Initializing {
        generation: u64,
        outcome: watch::Receiver<Outcome>,
    },
    Ready {
        generation: u64,
        server_info: Value,
    },
}

/// Runs the initialize exchange once per engine process.
///
/// The first caller for a process generation starts the handshake on its own
/// task; every caller, the first included, waits on the shared outcome. A
/// failed attempt rejects all of them with the same error and leaves the
/// sequencer uninitialized so the next call retries.
#[derive(Debug, Clone)]
pub struct HandshakeSequencer {
    phase: Arc<Mutex<Phase>>,
    attempts: Arc<AtomicU64>,
}

impl Default for HandshakeSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeSequencer {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase::Uninitialized)),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Resolves once the engine of `generation` is initialized, returning
    /// whatever the engine answered to `initialize`.
    pub async fn ensure<F, Fut>(&self, generation: u64, start: F) -> Result<Value, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BridgeError>> + Send + 'static,
    {
        let mut outcome = {
            let mut phase = lock(&self.phase);
            let joined = match &*phase {
                Phase::Ready {
                    generation: ready,
                    server_info,
                } if *ready == generation => return Ok(server_info.clone()),
                Phase::Initializing {
                    generation: running,
                    outcome,
                } if *running == generation => Some(outcome.clone()),
                _ => None,
            };
            match joined {
                Some(outcome) => outcome,
                None => {
                    let (tx, rx) = watch::channel(None);
                    *phase = Phase::Initializing {
                        generation,
                        outcome: rx.clone(),
                    };
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::info!(
                        generation = generation,
                        attempt = attempt,
                        "handshake: starting"
                    );
                    self.spawn_attempt(generation, tx, start());
                    rx
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Err(BridgeError::HandshakeAborted)),
            Err(_) => {
                self.reset_initializing(generation);
                Err(BridgeError::HandshakeAborted)
            }
        };
        result
    }

    /// Forgets any handshake belonging to `generation`.
    pub fn reset(&self, generation: u64) {
        let mut phase = lock(&self.phase);
        let matches = match &*phase {
            Phase::Uninitialized => false,
            Phase::Initializing { generation: g, .. } | Phase::Ready { generation: g, .. } => {
                *g == generation
            }
        };
        if matches {
            tracing::debug!(generation = generation, "handshake: reset");
            *phase = Phase::Uninitialized;
        }
    }

    pub fn state(&self) -> HandshakeState {
        match &*lock(&self.phase) {
            Phase::Uninitialized => HandshakeState::Uninitialized,
            Phase::Initializing { .. } => HandshakeState::Initializing,
            Phase::Ready { .. } => HandshakeState::Ready,
        }
    }

    pub fn server_info(&self) -> Option<Value> {
        match &*lock(&self.phase) {
            Phase::Ready { server_info, .. } => Some(server_info.clone()),
            _ => None,
        }
    }

    /// Handshakes started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn spawn_attempt<Fut>(&self, generation: u64, tx: watch::Sender<Outcome>, attempt: Fut)
    where
        Fut: Future<Output = Result<Value, BridgeError>> + Send + 'static,
    {
        let phase = self.phase.clone();
        tokio::spawn(async move {
            let result = attempt.await;
            {
                let mut phase = lock(&phase);
                let current = matches!(
                    &*phase,
                    Phase::Initializing { generation: g, .. } if *g == generation
                );
                if current {
                    *phase = match &result {
                        Ok(server_info) => Phase::Ready {
                            generation,
                            server_info: server_info.clone(),
                        },
                        Err(_) => Phase::Uninitialized,
                    };
                }
            }
            match &result {
                Ok(_) => tracing::info!(generation = generation, "handshake: ready"),
                Err(err) => tracing::warn!(
                    generation = generation,
                    error = %err,
                    "handshake: failed"
                ),
            }
            tx.send_replace(Some(result));
        });
    }

    fn reset_initializing(&self, generation: u64) {
        let mut phase = lock(&self.phase);
        if matches!(&*phase, Phase::Initializing { generation: g, .. } if *g == generation) {
            *phase = Phase::Uninitialized;
        }
    }
}

fn lock(phase: &Mutex<Phase>) -> MutexGuard<'_, Phase> {
    match phase.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let sequencer = HandshakeSequencer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let sequencer = sequencer.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                sequencer
                    .ensure(1, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"serverInfo": {"name": "engine"}}))
                    })
                    .await
            }));
        }

        for task in tasks {
            let info = task.await.unwrap().unwrap();
            assert_eq!(info["serverInfo"]["name"], "engine");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sequencer.attempts(), 1);
        assert_eq!(sequencer.state(), HandshakeState::Ready);
    }

    #[tokio::test]
    async fn failure_rejects_every_waiter_and_allows_retry() {
        let sequencer = HandshakeSequencer::new();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let sequencer = sequencer.clone();
            tasks.push(tokio::spawn(async move {
                sequencer
                    .ensure(1, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(BridgeError::Protocol {
                            code: -32000,
                            message: "engine refused".into(),
                            data: None,
                        })
                    })
                    .await
            }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::Protocol { code: -32000, .. }));
        }
        assert_eq!(sequencer.attempts(), 1);
        assert_eq!(sequencer.state(), HandshakeState::Uninitialized);

        let info = sequencer
            .ensure(1, || async { Ok(json!("second try")) })
            .await
            .unwrap();
        assert_eq!(info, json!("second try"));
        assert_eq!(sequencer.attempts(), 2);
    }

    #[tokio::test]
    async fn new_generation_needs_a_new_handshake() {
        let sequencer = HandshakeSequencer::new();
        sequencer.ensure(1, || async { Ok(json!(1)) }).await.unwrap();
        sequencer.ensure(1, || async { Ok(json!("unused")) }).await.unwrap();
        assert_eq!(sequencer.attempts(), 1);

        let info = sequencer.ensure(2, || async { Ok(json!(2)) }).await.unwrap();
        assert_eq!(info, json!(2));
        assert_eq!(sequencer.attempts(), 2);
    }

    #[tokio::test]
    async fn reset_only_touches_its_generation() {
        let sequencer = HandshakeSequencer::new();
        sequencer.ensure(3, || async { Ok(json!({})) }).await.unwrap();

        sequencer.reset(2);
        assert_eq!(sequencer.state(), HandshakeState::Ready);

        sequencer.reset(3);
        assert_eq!(sequencer.state(), HandshakeState::Uninitialized);
        assert!(sequencer.server_info().is_none());
    }

    #[tokio::test]
    async fn abandoned_first_caller_does_not_strand_waiters() {
        let sequencer = HandshakeSequencer::new();

        let first = {
            let sequencer = sequencer.clone();
            tokio::spawn(async move {
                sequencer
                    .ensure(1, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("done"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let info = sequencer
            .ensure(1, || async { Ok(json!("not started")) })
            .await
            .unwrap();
        assert_eq!(info, json!("done"));
    }
}
