//! Request envelopes and the FIFO the worker consumes.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{oneshot, Notify};

use crate::error::GatewayError;
use crate::models::chat::ChatCompletionRequest;
use crate::session::ClientLiveness;
use crate::util::CompletionEvent;

/// Byte stream backing a streaming (SSE) response.
pub type SseBody = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// What a request ultimately resolves to.
pub enum RequestOutcome {
    /// Terminal JSON payload (non-streaming, already fully assembled).
    Json(serde_json::Value),
    /// Lazy SSE sequence; polled by the HTTP layer after the future resolves.
    Stream(SseBody),
}

pub type RequestResult = Result<RequestOutcome, GatewayError>;

/// Single-shot result future. The sender side lives here; resolving twice is
/// impossible because the sender is taken out of the slot.
pub struct ResultSlot {
    tx: Mutex<Option<oneshot::Sender<RequestResult>>>,
    resolved: CompletionEvent,
}

impl ResultSlot {
    fn new() -> (Self, oneshot::Receiver<RequestResult>) {
        let (tx, rx) = oneshot::channel();
        (
            ResultSlot {
                tx: Mutex::new(Some(tx)),
                resolved: CompletionEvent::new(),
            },
            rx,
        )
    }

    /// Resolve the future. Returns false when it was already resolved; the
    /// value is dropped in that case.
    pub fn resolve(&self, result: RequestResult) -> bool {
        let sender = self.tx.lock().expect("result slot lock").take();
        match sender {
            Some(tx) => {
                // The receiver may already be gone (client dropped the
                // request); the resolution still counts.
                let _ = tx.send(result);
                self.resolved.set();
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_set()
    }

    /// Wait until some party resolves the future.
    pub async fn resolved(&self) {
        self.resolved.wait().await;
    }
}

/// One queued user request and its resolution machinery.
pub struct Envelope {
    pub req_id: String,
    pub enqueued_at: Instant,
    pub request: ChatCompletionRequest,
    pub liveness: ClientLiveness,
    cancelled: AtomicBool,
    pub result: ResultSlot,
}

impl Envelope {
    pub fn new(
        req_id: String,
        request: ChatCompletionRequest,
        liveness: ClientLiveness,
    ) -> (Arc<Envelope>, oneshot::Receiver<RequestResult>) {
        let (result, rx) = ResultSlot::new();
        (
            Arc::new(Envelope {
                req_id,
                enqueued_at: Instant::now(),
                request,
                liveness,
                cancelled: AtomicBool::new(false),
                result,
            }),
            rx,
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.request.stream
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn wait_time(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// FIFO of envelopes. A plain deque under a mutex so the worker can scan the
/// head in place (dead-client sweep, queue endpoint) without disturbing
/// ordering.
#[derive(Default)]
pub struct RequestQueue {
    inner: Mutex<VecDeque<Arc<Envelope>>>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: Arc<Envelope>) {
        self.inner
            .lock()
            .expect("queue lock")
            .push_back(envelope);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<Arc<Envelope>> {
        self.inner.lock().expect("queue lock").pop_front()
    }

    /// Dequeue with a bounded wait; `None` on timeout so the worker loop can
    /// run its periodic sweep.
    pub async fn recv_timeout(&self, wait: Duration) -> Option<Arc<Envelope>> {
        if let Some(envelope) = self.try_pop() {
            return Some(envelope);
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_pop()
    }

    /// Clone the head of the queue (up to `limit`) for inspection. Envelopes
    /// stay queued.
    pub fn peek_head(&self, limit: usize) -> Vec<Arc<Envelope>> {
        let guard = self.inner.lock().expect("queue lock");
        guard.iter().take(limit).cloned().collect()
    }

    /// Everything currently queued, FIFO order.
    pub fn snapshot(&self) -> Vec<Arc<Envelope>> {
        let guard = self.inner.lock().expect("queue lock");
        guard.iter().cloned().collect()
    }

    /// Mark a queued request cancelled in place. False when the id is not in
    /// the queue (already dequeued or never existed).
    pub fn cancel(&self, req_id: &str) -> bool {
        let guard = self.inner.lock().expect("queue lock");
        for envelope in guard.iter() {
            if envelope.req_id == req_id {
                envelope.mark_cancelled();
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Message;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some("m1".into()),
            messages: vec![Message::text("user", "hi")],
            stream: false,
            temperature: None,
            max_output_tokens: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            mcp_endpoint: None,
            attachments: None,
            files: None,
            seed: None,
            response_format: None,
            reasoning_effort: None,
        }
    }

    #[tokio::test]
    async fn result_slot_resolves_exactly_once() {
        let (envelope, rx) = Envelope::new("r1".into(), request(), ClientLiveness::new());
        assert!(envelope
            .result
            .resolve(Ok(RequestOutcome::Json(serde_json::json!({"ok": true})))));
        assert!(!envelope
            .result
            .resolve(Err(crate::error::server_error("r1", "late"))));
        assert!(envelope.result.is_resolved());
        let value = rx.await.expect("receiver gets first resolution");
        assert!(matches!(value, Ok(RequestOutcome::Json(_))));
    }

    #[tokio::test]
    async fn queue_preserves_fifo_and_cancel_in_place() {
        let queue = RequestQueue::new();
        let (a, _rx_a) = Envelope::new("a".into(), request(), ClientLiveness::new());
        let (b, _rx_b) = Envelope::new("b".into(), request(), ClientLiveness::new());
        queue.push(a);
        queue.push(b);

        assert!(queue.cancel("b"));
        assert!(!queue.cancel("zzz"));

        let first = queue.recv_timeout(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.req_id, "a");
        assert!(!first.is_cancelled());
        let second = queue.recv_timeout(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.req_id, "b");
        assert!(second.is_cancelled());
        assert!(queue.recv_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let queue = RequestQueue::new();
        let (a, _rx) = Envelope::new("a".into(), request(), ClientLiveness::new());
        queue.push(a);
        assert_eq!(queue.peek_head(10).len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
