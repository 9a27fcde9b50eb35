//! Connection Registry (§4.B).

use std::sync::Arc;

use dashmap::DashMap;
use relaygate_protocol::AgentFrame;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::queue::{CloseReason, Queue};

/// A handle through which the registry can push server→agent frames to a connected socket.
/// The actual WebSocket write loop lives in `relaygate-gateway`; this is just the sending
/// half of its dedicated writer task's channel.
#[derive(Clone)]
pub struct AgentSocket {
    sender: mpsc::UnboundedSender<relaygate_protocol::ServerFrame>,
}

impl AgentSocket {
    pub fn new(sender: mpsc::UnboundedSender<relaygate_protocol::ServerFrame>) -> Self {
        Self { sender }
    }

    pub fn send(&self, frame: relaygate_protocol::ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

struct QueueEntry {
    queue: Arc<Queue<AgentFrame>>,
    identity: u32,
}

/// Invoked at most once per lost session, when the 60 s grace window elapses without any
/// socket reopening. May itself restart the browser and reopen sockets — the registry's
/// re-entrancy guard (a single in-flight grace timer) ensures this doesn't recurse.
pub type ConnectionLostCallback = Arc<dyn Fn() + Send + Sync>;

const GRACE_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

pub struct Registry {
    connections: Arc<DashMap<u32, AgentSocket>>,
    queues: Arc<DashMap<String, QueueEntry>>,
    grace_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_connection_lost: ConnectionLostCallback,
}

impl Registry {
    pub fn new(on_connection_lost: ConnectionLostCallback) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            queues: Arc::new(DashMap::new()),
            grace_timer: Mutex::new(None),
            on_connection_lost,
        }
    }

    /// `fresh_epoch` is set by the caller when it knows this is a brand-new browser/agent
    /// process (not merely a network blip reconnect) — only then are prior queues for this
    /// identity considered stale and closed with `connection_lost`.
    pub async fn on_socket_open(&self, identity: u32, socket: AgentSocket, fresh_epoch: bool) {
        self.cancel_grace_timer().await;

        if fresh_epoch {
            let stale: Vec<String> = self
                .queues
                .iter()
                .filter(|e| e.identity == identity)
                .map(|e| e.key().clone())
                .collect();
            for request_id in stale {
                self.remove_queue(&request_id, CloseReason::ConnectionLost)
                    .await;
            }
        }

        self.connections.insert(identity, socket);
    }

    pub async fn on_socket_message(&self, _identity: u32, frame: AgentFrame) {
        let request_id = frame.request_id().to_string();
        let Some(entry) = self.queues.get(&request_id) else {
            debug!(request_id, "no queue for frame, dropping");
            return;
        };
        entry.queue.enqueue(frame).await;
    }

    pub async fn on_socket_close(&self, identity: u32) {
        self.connections.remove(&identity);
        self.start_grace_timer().await;
    }

    async fn cancel_grace_timer(&self) {
        let mut guard = self.grace_timer.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    async fn start_grace_timer(&self) {
        self.cancel_grace_timer().await;

        let queues = self.queues.clone();
        let callback = self.on_connection_lost.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(GRACE_WINDOW).await;
            let request_ids: Vec<String> = queues.iter().map(|e| e.key().clone()).collect();
            for request_id in request_ids {
                if let Some((_, entry)) = queues.remove(&request_id) {
                    entry.queue.close(CloseReason::ConnectionLost).await;
                }
            }
            callback();
        });

        *self.grace_timer.lock().await = Some(handle);
    }

    /// If a prior queue exists under `request_id`, closes it with `replaced_on_retry` first.
    pub async fn create_queue(&self, request_id: impl Into<String>, identity: u32) -> Arc<Queue<AgentFrame>> {
        let request_id = request_id.into();
        if let Some((_, old)) = self.queues.remove(&request_id) {
            old.queue.close(CloseReason::ReplacedOnRetry).await;
        }
        let queue = Arc::new(Queue::new());
        self.queues.insert(
            request_id,
            QueueEntry {
                queue: queue.clone(),
                identity,
            },
        );
        queue
    }

    pub async fn remove_queue(&self, request_id: &str, reason: CloseReason) {
        if let Some((_, entry)) = self.queues.remove(request_id) {
            entry.queue.close(reason).await;
        }
    }

    pub fn broadcast(&self, frame: relaygate_protocol::ServerFrame) {
        for entry in self.connections.iter() {
            if !entry.value().send(frame.clone()) {
                warn!(identity = *entry.key(), "broadcast send failed, socket likely dead");
            }
        }
    }

    pub fn get_socket_by_identity(&self, identity: u32) -> Option<AgentSocket> {
        self.connections.get(&identity).map(|e| e.value().clone())
    }

    pub fn get_identity_by_request(&self, request_id: &str) -> Option<u32> {
        self.queues.get(request_id).map(|e| e.identity)
    }

    pub fn has_socket(&self, identity: u32) -> bool {
        self.connections.contains_key(&identity)
    }

    pub async fn grace_window_active(&self) -> bool {
        self.grace_timer.lock().await.is_some()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_protocol::ServerFrame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_callback() -> (ConnectionLostCallback, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let cb: ConnectionLostCallback = Arc::new(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        (cb, counter)
    }

    fn socket() -> (AgentSocket, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentSocket::new(tx), rx)
    }

    #[tokio::test]
    async fn create_queue_twice_closes_first_with_replaced_on_retry() {
        let (cb, _) = noop_callback();
        let registry = Registry::new(cb);
        let first = registry.create_queue("req-1", 0).await;
        let _second = registry.create_queue("req-1", 0).await;
        let err = first
            .dequeue(std::time::Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, crate::queue::QueueError::Closed(CloseReason::ReplacedOnRetry));
    }

    #[tokio::test]
    async fn message_routes_to_matching_queue() {
        let (cb, _) = noop_callback();
        let registry = Registry::new(cb);
        let queue = registry.create_queue("req-1", 0).await;
        registry
            .on_socket_message(
                0,
                AgentFrame::Chunk {
                    request_id: "req-1".into(),
                    data: "hello".into(),
                },
            )
            .await;
        let frame = queue.dequeue(std::time::Duration::from_millis(10)).await.unwrap();
        assert!(matches!(frame, AgentFrame::Chunk { .. }));
    }

    #[tokio::test]
    async fn message_with_unknown_request_id_is_dropped() {
        let (cb, _) = noop_callback();
        let registry = Registry::new(cb);
        registry
            .on_socket_message(
                0,
                AgentFrame::StreamClose {
                    request_id: "ghost".into(),
                },
            )
            .await;
        // No panic, no queue created — nothing further to assert beyond "didn't crash".
    }

    #[tokio::test]
    async fn socket_lookup_reflects_open_and_close() {
        let (cb, _) = noop_callback();
        let registry = Registry::new(cb);
        let (sock, _rx) = socket();
        registry.on_socket_open(0, sock, false).await;
        assert!(registry.has_socket(0));
        registry.on_socket_close(0).await;
        assert!(!registry.has_socket(0));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_closes_queues_and_fires_callback_exactly_once() {
        let (cb, counter) = noop_callback();
        let registry = Registry::new(cb);
        let (sock, _rx) = socket();
        registry.on_socket_open(0, sock, false).await;
        let queue = registry.create_queue("req-1", 0).await;

        registry.on_socket_close(0).await;
        assert!(registry.grace_window_active().await);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::advance(GRACE_WINDOW + std::time::Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        let err = queue
            .dequeue(std::time::Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, crate::queue::QueueError::Closed(CloseReason::ConnectionLost));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Advancing further must not fire the callback again — it is re-entrancy guarded to
        // run at most once per lost session.
        tokio::time::advance(GRACE_WINDOW).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_before_grace_window_elapses_cancels_the_timer() {
        let (cb, counter) = noop_callback();
        let registry = Registry::new(cb);
        let (sock, _rx) = socket();
        registry.on_socket_open(0, sock, false).await;
        let queue = registry.create_queue("req-1", 0).await;

        registry.on_socket_close(0).await;
        tokio::time::advance(GRACE_WINDOW / 2).await;
        tokio::task::yield_now().await;

        let (sock, _rx) = socket();
        registry.on_socket_open(0, sock, false).await;
        assert!(!registry.grace_window_active().await);

        tokio::time::advance(GRACE_WINDOW).await;
        tokio::task::yield_now().await;

        // The queue survives: the reconnect cancelled the grace timer before it could close it.
        assert!(queue.dequeue(std::time::Duration::from_millis(10)).await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
