//! One-to-many delivery of engine notifications.
//!
//! There is no history: a subscriber only sees what is published while it is
//! attached. Each subscriber is either a bounded channel (SSE streams) or a
//! callback; both detach automatically when their handle is dropped.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&Notification) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub sequence: u64,
    pub method: String,
    pub params: Value,
    /// Set when the engine expects an answer (engine-initiated request).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Notification {
    /// The json-rpc message as the engine sent it.
    pub fn to_jsonrpc(&self) -> Value {
        let mut message = json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "params": self.params,
        });
        if let Some(id) = &self.id {
            message["id"] = id.clone();
        }
        message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
enum Sink {
    Channel(mpsc::Sender<Arc<Notification>>),
    Callback(Callback),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Channel"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
struct FanoutInner {
    subscribers: Mutex<Vec<(SubscriberId, Sink)>>,
    next_subscriber: AtomicU64,
    sequence: AtomicU64,
    dropped: AtomicU64,
    buffer: usize,
}

impl FanoutInner {
    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriberId, Sink)>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn attach(&self, sink: Sink) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().push((id, sink));
        id
    }

    fn detach(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        before != subscribers.len()
    }
}

#[derive(Debug, Clone)]
pub struct NotificationFanout {
    inner: Arc<FanoutInner>,
}

impl Default for NotificationFanout {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl NotificationFanout {
    /// `buffer` is the per-subscriber queue depth for channel subscribers.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.attach(Sink::Channel(tx));
        tracing::debug!(subscriber = %id, "fanout: subscriber attached");
        Subscription {
            id,
            rx,
            fanout: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a callback invoked synchronously on every publish.
    pub fn subscribe_fn<F>(&self, callback: F) -> ListenerGuard
    where
        F: Fn(&Notification) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.inner.attach(Sink::Callback(Arc::new(callback)));
        tracing::debug!(subscriber = %id, "fanout: listener attached");
        ListenerGuard {
            id,
            fanout: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.detach(id);
        if removed {
            tracing::debug!(subscriber = %id, "fanout: subscriber detached");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Deliveries skipped because a subscriber's queue was full, across all
    /// subscribers. SSE clients see the gap as a jump in event ids.
    pub fn dropped_notifications(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Delivers a notification to every attached subscriber in registration
    /// order and returns its sequence number. A failing subscriber is logged
    /// and skipped; it never affects delivery to the others.
    pub fn publish(&self, method: impl Into<String>, params: Value, id: Option<Value>) -> u64 {
        let snapshot = self.inner.lock().clone();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = Arc::new(Notification {
            sequence,
            method: method.into(),
            params,
            id,
        });

        let mut closed = Vec::new();
        for (subscriber, sink) in &snapshot {
            match sink {
                Sink::Channel(tx) => match tx.try_send(notification.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            subscriber = %subscriber,
                            sequence = sequence,
                            method = %notification.method,
                            "fanout: subscriber queue full, dropping notification"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*subscriber),
                },
                Sink::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(&notification))) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(
                                subscriber = %subscriber,
                                method = %notification.method,
                                error = %err,
                                "fanout: listener failed"
                            );
                        }
                        Err(_) => {
                            tracing::error!(
                                subscriber = %subscriber,
                                method = %notification.method,
                                "fanout: listener panicked"
                            );
                        }
                    }
                }
            }
        }

        for subscriber in closed {
            self.inner.detach(subscriber);
        }

        tracing::trace!(
            sequence = sequence,
            method = %notification.method,
            subscribers = snapshot.len(),
            "fanout: published"
        );
        sequence
    }
}

/// Channel-backed subscription; also a `Stream` of notifications.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Notification>>,
    fanout: Weak<FanoutInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next notification; `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<Arc<Notification>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Notification>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Arc<Notification>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.fanout.upgrade() {
            if inner.detach(self.id) {
                tracing::debug!(subscriber = %self.id, "fanout: subscriber detached");
            }
        }
    }
}

/// Keeps a callback listener attached until dropped.
#[derive(Debug)]
pub struct ListenerGuard {
    id: SubscriberId,
    fanout: Weak<FanoutInner>,
}

impl ListenerGuard {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.fanout.upgrade() {
            inner.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let fanout = NotificationFanout::default();
        assert_eq!(fanout.publish("page/loaded", json!({}), None), 1);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn late_subscriber_gets_no_replay() {
        let fanout = NotificationFanout::default();
        fanout.publish("early", json!(1), None);
        let mut sub = fanout.subscribe();
        assert!(sub.try_recv().is_none());

        fanout.publish("late", json!(2), None);
        let got = sub.try_recv().expect("late notification");
        assert_eq!(got.method, "late");
        assert_eq!(got.sequence, 2);
    }

    #[test]
    fn every_subscriber_sees_every_notification_in_registration_order() {
        let fanout = NotificationFanout::default();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            fanout.subscribe_fn(move |n| {
                order.lock().unwrap().push(format!("first:{}", n.method));
                Ok(())
            })
        };
        let second = {
            let order = order.clone();
            fanout.subscribe_fn(move |n| {
                order.lock().unwrap().push(format!("second:{}", n.method));
                Ok(())
            })
        };

        fanout.publish("a", Value::Null, None);
        fanout.publish("b", Value::Null, None);

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
        drop(first);
        drop(second);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let fanout = NotificationFanout::default();
        let _broken = fanout.subscribe_fn(|_| Err("listener is broken".into()));
        let _panics = fanout.subscribe_fn(|_| panic!("listener exploded"));
        let mut healthy = fanout.subscribe();

        fanout.publish("still/delivered", json!({"ok": true}), None);
        let got = healthy.try_recv().expect("delivered past broken listeners");
        assert_eq!(got.params, json!({"ok": true}));
        assert_eq!(fanout.subscriber_count(), 3);
    }

    #[test]
    fn dropped_subscription_detaches() {
        let fanout = NotificationFanout::default();
        let sub = fanout.subscribe();
        let id = sub.id();
        assert_eq!(fanout.subscriber_count(), 1);
        drop(sub);
        assert_eq!(fanout.subscriber_count(), 0);
        assert!(!fanout.unsubscribe(id));
    }

    #[tokio::test]
    async fn explicit_unsubscribe_ends_the_stream() {
        let fanout = NotificationFanout::default();
        let mut sub = fanout.subscribe();
        fanout.publish("one", Value::Null, None);
        assert!(fanout.unsubscribe(sub.id()));
        fanout.publish("two", Value::Null, None);

        assert_eq!(sub.next().await.map(|n| n.method.clone()), Some("one".into()));
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let fanout = NotificationFanout::new(1);
        let mut slow = fanout.subscribe();
        let mut fast = fanout.subscribe();

        fanout.publish("one", Value::Null, None);
        assert!(fast.try_recv().is_some());
        fanout.publish("two", Value::Null, None);

        assert_eq!(fast.try_recv().map(|n| n.method.clone()), Some("two".into()));
        assert_eq!(slow.try_recv().map(|n| n.method.clone()), Some("one".into()));
        assert!(slow.try_recv().is_none());
        assert_eq!(fanout.dropped_notifications(), 1);
    }

    #[test]
    fn jsonrpc_rendering_keeps_request_ids() {
        let fanout = NotificationFanout::default();
        let mut sub = fanout.subscribe();
        fanout.publish("elicitation/create", json!({"q": 1}), Some(json!("req-1")));
        let message = sub.try_recv().unwrap().to_jsonrpc();
        assert_eq!(message["id"], "req-1");
        assert_eq!(message["method"], "elicitation/create");
        assert_eq!(message["jsonrpc"], "2.0");
    }
}
