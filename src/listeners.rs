//! Attach and detach inbound event listeners per connection.
//!
//! Each attached connection gets one dispatch task that drains the
//! connection's event channel and calls the listener serially. Detaching stops
//! the task through a oneshot signal and clears an `active` flag the task
//! checks before every dispatch, so nothing is delivered after [`detach`]
//! returns, even an event that was already dequeued.
//!
//! [`detach`]: ListenerRegistry::detach

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionId};

/// Receives the events of one connection. Every method defaults to a no-op.
pub trait ConnectionListener: Send + Sync + 'static {
    /// The initial connect succeeded.
    fn on_connected(&self) {}

    /// A server-pushed invocation (`Receive`, `GameChanged`, ...).
    fn on_message(&self, _target: &str, _arguments: &[Value]) {}

    /// The transport dropped and reconnect attempts started.
    fn on_reconnecting(&self, _reason: Option<&str>) {}

    /// The connection is back and the membership was replayed.
    fn on_reconnected(&self) {}

    /// The connection is back but the server refused the membership replay.
    fn on_rejoin_failed(&self, _reason: &str) {}

    /// The connection is gone for good.
    fn on_closed(&self, _reason: Option<&str>) {}
}

/// Listener that only logs what it sees.
#[derive(Debug, Clone, Copy)]
pub struct TracingListener {
    endpoint: &'static str,
}

impl TracingListener {
    pub fn new(endpoint: &'static str) -> Self {
        Self { endpoint }
    }
}

impl ConnectionListener for TracingListener {
    fn on_message(&self, target: &str, arguments: &[Value]) {
        trace!(endpoint = self.endpoint, target, args = arguments.len(), "server event");
    }

    fn on_reconnecting(&self, reason: Option<&str>) {
        debug!(endpoint = self.endpoint, reason = reason.unwrap_or(""), "reconnecting");
    }

    fn on_reconnected(&self) {
        debug!(endpoint = self.endpoint, "reconnected");
    }

    fn on_rejoin_failed(&self, reason: &str) {
        warn!(endpoint = self.endpoint, reason, "rejoin failed");
    }

    fn on_closed(&self, reason: Option<&str>) {
        debug!(endpoint = self.endpoint, reason = reason.unwrap_or(""), "connection closed");
    }
}

struct Attachment {
    active: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Attachment {
    fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Registry of attached listeners, keyed by connection identity.
#[derive(Default)]
pub struct ListenerRegistry {
    attachments: Mutex<HashMap<ConnectionId, Attachment>>,
    detached: Mutex<HashSet<ConnectionId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `listener` to the events of `handle`.
    ///
    /// Returns `false` when a listener is already attached or the handle's
    /// event receiver was taken elsewhere.
    pub fn attach(&self, handle: &ConnectionHandle, listener: Arc<dyn ConnectionListener>) -> bool {
        if self.is_attached(handle.id()) {
            debug!(connection = %handle.id(), "listener already attached");
            return false;
        }
        match handle.take_events() {
            Some(events) => self.attach_events(handle.id(), events, listener),
            None => {
                debug!(connection = %handle.id(), "event receiver already taken");
                false
            }
        }
    }

    /// Attach `listener` to a raw event channel.
    ///
    /// Returns `false` when a listener is already attached for `id`.
    pub fn attach_events(
        &self,
        id: ConnectionId,
        events: mpsc::Receiver<ConnectionEvent>,
        listener: Arc<dyn ConnectionListener>,
    ) -> bool {
        let mut attachments = lock(&self.attachments);
        if attachments.contains_key(&id) {
            return false;
        }

        let active = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(id, events, listener, Arc::clone(&active), stop_rx));
        attachments.insert(
            id,
            Attachment {
                active,
                stop_tx: Some(stop_tx),
                task,
            },
        );
        lock(&self.detached).remove(&id);
        debug!(connection = %id, "listener attached");
        true
    }

    /// Stop delivering events for `id`. Idempotent; safe on closed or
    /// unknown connections.
    pub fn detach(&self, id: ConnectionId) {
        if let Some(mut attachment) = lock(&self.attachments).remove(&id) {
            attachment.stop();
            debug!(connection = %id, "listener detached");
        }
        lock(&self.detached).insert(id);
    }

    /// Drop every trace of `id`, including its detached mark.
    pub fn forget(&self, id: ConnectionId) {
        if let Some(mut attachment) = lock(&self.attachments).remove(&id) {
            attachment.stop();
        }
        lock(&self.detached).remove(&id);
    }

    /// Returns `true` once `id` was detached (until it is forgotten or
    /// attached again).
    pub fn is_detached(&self, id: ConnectionId) -> bool {
        lock(&self.detached).contains(&id)
    }

    /// Returns `true` while a listener is attached for `id`.
    pub fn is_attached(&self, id: ConnectionId) -> bool {
        lock(&self.attachments).contains_key(&id)
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        for (_, mut attachment) in lock(&self.attachments).drain() {
            attachment.stop();
            attachment.task.abort();
        }
    }
}

async fn pump(
    id: ConnectionId,
    mut events: mpsc::Receiver<ConnectionEvent>,
    listener: Arc<dyn ConnectionListener>,
    active: Arc<AtomicBool>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        if !active.load(Ordering::Acquire) {
            break;
        }
        dispatch(listener.as_ref(), event);
    }
    trace!(connection = %id, "listener dispatch stopped");
}

fn dispatch(listener: &dyn ConnectionListener, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => listener.on_connected(),
        ConnectionEvent::Message { target, arguments } => listener.on_message(&target, &arguments),
        ConnectionEvent::Reconnecting { reason } => listener.on_reconnecting(reason.as_deref()),
        ConnectionEvent::Reconnected => listener.on_reconnected(),
        ConnectionEvent::RejoinFailed { reason } => listener.on_rejoin_failed(&reason),
        ConnectionEvent::Closed { reason } => listener.on_closed(reason.as_deref()),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    struct Recorder {
        seen: mpsc::UnboundedSender<String>,
    }

    impl ConnectionListener for Recorder {
        fn on_message(&self, target: &str, _arguments: &[Value]) {
            let _ = self.seen.send(target.to_string());
        }

        fn on_closed(&self, _reason: Option<&str>) {
            let _ = self.seen.send("closed".to_string());
        }
    }

    fn message(target: &str) -> ConnectionEvent {
        ConnectionEvent::Message {
            target: target.to_string(),
            arguments: vec![],
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        assert!(registry.attach_events(id, rx, Arc::new(Recorder { seen: seen_tx })));
        tx.send(message("Receive")).await.unwrap();
        tx.send(ConnectionEvent::Closed { reason: None }).await.unwrap();

        assert_eq!(seen.recv().await.unwrap(), "Receive");
        assert_eq!(seen.recv().await.unwrap(), "closed");
        assert!(registry.is_attached(id));
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_detach() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        registry.attach_events(id, rx, Arc::new(Recorder { seen: seen_tx }));
        tx.send(message("GameChanged")).await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "GameChanged");

        registry.detach(id);
        registry.detach(id);
        assert!(registry.is_detached(id));
        assert!(!registry.is_attached(id));

        let _ = tx.send(message("Receive")).await;
        let late = tokio::time::timeout(Duration::from_millis(100), seen.recv()).await;
        assert!(!matches!(late, Ok(Some(_))), "late event delivered: {late:?}");
    }

    #[tokio::test]
    async fn second_attach_is_refused() {
        let registry = ListenerRegistry::new();
        let (_tx1, rx1) = mpsc::channel(1);
        let (_tx2, rx2) = mpsc::channel(1);
        let (seen_tx, _seen) = mpsc::unbounded_channel();
        let listener: Arc<dyn ConnectionListener> = Arc::new(Recorder { seen: seen_tx });
        let id = Uuid::new_v4();

        assert!(registry.attach_events(id, rx1, Arc::clone(&listener)));
        assert!(!registry.attach_events(id, rx2, listener));
    }

    #[tokio::test]
    async fn forget_clears_detached_mark() {
        let registry = ListenerRegistry::new();
        let id = Uuid::new_v4();
        registry.detach(id);
        assert!(registry.is_detached(id));
        registry.forget(id);
        assert!(!registry.is_detached(id));
    }
}
