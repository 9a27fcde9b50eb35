//! Message Queue (§4.A): an ordered, bounded-wait, closeable FIFO used for exactly one
//! in-flight request.

use std::{collections::VecDeque, time::Duration};

use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 300_000;

/// Sentinel reasons a [`Queue`] was closed, surfaced to a parked `dequeue` caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ConnectionLost,
    ClientDisconnect,
    RetryCreatingNewQueue,
    RequestComplete,
    ReplacedOnRetry,
    Unknown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::RetryCreatingNewQueue => "retry_creating_new_queue",
            CloseReason::RequestComplete => "request_complete",
            CloseReason::ReplacedOnRetry => "replaced_on_retry",
            CloseReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue closed: {0}")]
    Closed(CloseReason),
    #[error("queue dequeue timed out")]
    Timeout,
}

struct Inner<F> {
    buffer: VecDeque<F>,
    closed: Option<CloseReason>,
    waiter: Option<oneshot::Sender<Result<F, QueueError>>>,
}

/// Single-producer (frames arrive via [`Queue::enqueue`]), single-consumer (the request
/// pipeline calls [`Queue::dequeue`]) FIFO. Multiple concurrent `dequeue` calls are not
/// supported — the second caller simply replaces the first's parked waiter.
pub struct Queue<F> {
    inner: Mutex<Inner<F>>,
}

impl<F> Default for Queue<F> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                closed: None,
                waiter: None,
            }),
        }
    }
}

impl<F> Queue<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking. Resolves a parked waiter if one exists, otherwise buffers the frame.
    /// No-op once the queue is closed.
    pub async fn enqueue(&self, frame: F) {
        let mut inner = self.inner.lock().await;
        if inner.closed.is_some() {
            return;
        }
        if let Some(waiter) = inner.waiter.take() {
            // Ignore the send error: the dequeuer's timeout raced us and already gave up,
            // in which case the frame is simply dropped rather than re-buffered, since the
            // caller that would have consumed it is gone.
            let _ = waiter.send(Ok(frame));
        } else {
            inner.buffer.push_back(frame);
        }
    }

    /// Returns the next buffered frame, or parks until one arrives or `timeout` elapses.
    pub async fn dequeue(&self, timeout: Duration) -> Result<F, QueueError> {
        let (rx, already_resolved) = {
            let mut inner = self.inner.lock().await;
            if let Some(frame) = inner.buffer.pop_front() {
                return Ok(frame);
            }
            if let Some(reason) = inner.closed {
                return Err(QueueError::Closed(reason));
            }
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            (rx, ())
        };
        let _ = already_resolved;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv_dropped)) => Err(QueueError::Closed(CloseReason::Unknown)),
            Err(_elapsed) => {
                // The local guard: only remove our own waiter if it is still the one parked.
                // If `enqueue`/`close` already took it (and is mid-send), their outcome wins
                // and this timeout is simply discarded below.
                let mut inner = self.inner.lock().await;
                if inner.waiter.is_some() {
                    inner.waiter = None;
                    Err(QueueError::Timeout)
                } else {
                    Err(QueueError::Timeout)
                }
            }
        }
    }

    /// Idempotent. Releases any parked waiter with `QueueClosed(reason)` and drops buffered
    /// frames.
    pub async fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock().await;
        if inner.closed.is_some() {
            return;
        }
        inner.closed = Some(reason);
        inner.buffer.clear();
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.send(Err(QueueError::Closed(reason)));
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed.is_some()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_dequeue_delivers_fifo() {
        let q: Queue<u32> = Queue::new();
        q.enqueue(1).await;
        q.enqueue(2).await;
        assert_eq!(q.dequeue(Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(q.dequeue(Duration::from_millis(10)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dequeue_parks_then_resolves_on_enqueue() {
        let q = std::sync::Arc::new(Queue::<u32>::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.dequeue(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(42).await;
        assert_eq!(handle.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_nothing_arrives() {
        let q: Queue<u32> = Queue::new();
        let err = q.dequeue(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, QueueError::Timeout);
    }

    #[tokio::test]
    async fn close_releases_parked_waiter_with_reason() {
        let q = std::sync::Arc::new(Queue::<u32>::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.dequeue(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close(CloseReason::ClientDisconnect).await;
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, QueueError::Closed(CloseReason::ClientDisconnect));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_buffer() {
        let q: Queue<u32> = Queue::new();
        q.enqueue(1).await;
        q.close(CloseReason::RequestComplete).await;
        q.close(CloseReason::Unknown).await;
        let err = q.dequeue(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, QueueError::Closed(CloseReason::RequestComplete));
    }

    #[tokio::test]
    async fn enqueue_after_close_is_a_no_op() {
        let q: Queue<u32> = Queue::new();
        q.close(CloseReason::RequestComplete).await;
        q.enqueue(99).await;
        let err = q.dequeue(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, QueueError::Closed(CloseReason::RequestComplete));
    }
}
