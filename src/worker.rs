//! The queue worker: a single consumer that serializes every request
//! against the one UI session.
//!
//! Loop shape: sweep the queue head for dead clients, dequeue with a
//! bounded wait, then process one envelope end to end: cancellation check,
//! liveness checks, inter-stream cooldown, the processing lock, the
//! pipeline, the completion wait, post-stream quiesce and cleanup. Cleanup
//! and lock release run on every path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::disconnect::spawn_streaming_probe;
use crate::error::{client_cancelled, client_disconnected, processing_timeout};
use crate::pipeline::{self, PipelineOutcome};
use crate::prompt::UploadSandbox;
use crate::queue::Envelope;
use crate::util::AppState;

/// How many head-of-queue items the dead-client sweep inspects per turn.
const QUEUE_SCAN_LIMIT: usize = 10;

/// Bounded dequeue wait; on expiry the loop runs another sweep.
const DEQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Back-to-back streaming requests trip a provider frontend race unless
/// spaced out. Both values are empirical and may need tuning per provider
/// version.
const STREAM_COOLDOWN: Duration = Duration::from_secs(1);
const STREAM_COOLDOWN_FLOOR: Duration = Duration::from_millis(500);

/// Slack on top of the configured completion timeout for the worker-side
/// wait, so the emitter's own budget always fires first.
const COMPLETION_WAIT_SLACK: Duration = Duration::from_secs(60);

pub struct QueueWorker {
    state: Arc<AppState>,
    was_last_streaming: bool,
    last_completion: Option<Instant>,
}

impl QueueWorker {
    pub fn new(state: Arc<AppState>) -> Self {
        QueueWorker {
            state,
            was_last_streaming: false,
            last_completion: None,
        }
    }

    /// Main worker entry point; runs until the task is aborted.
    pub async fn run(mut self) {
        info!("--- queue worker started ---");
        self.state.set_worker_alive(true);
        loop {
            self.sweep_dead_clients();
            if let Some(envelope) = self.state.queue.recv_timeout(DEQUEUE_WAIT).await {
                self.process(envelope).await;
            }
        }
    }

    /// Step 1: probe liveness of up to N queued items in place; dead
    /// clients are short-circuited without disturbing live ordering.
    fn sweep_dead_clients(&self) {
        for envelope in self.state.queue.peek_head(QUEUE_SCAN_LIMIT) {
            if envelope.is_cancelled() {
                continue;
            }
            if envelope.liveness.is_disconnected() {
                info!(
                    "[{}] (queue sweep) client disconnected while queued; marking cancelled",
                    envelope.req_id
                );
                envelope.mark_cancelled();
                envelope.result.resolve(Err(client_disconnected(
                    &envelope.req_id,
                    "Client disconnected while queued.",
                )));
            }
        }
    }

    async fn process(&mut self, envelope: Arc<Envelope>) {
        let req_id = envelope.req_id.clone();
        let is_streaming = envelope.is_streaming();

        // a. Explicit cancellation short-circuits before any UI contact.
        if envelope.is_cancelled() {
            info!("[{req_id}] (worker) request cancelled, skipping");
            envelope.result.resolve(Err(client_cancelled(
                &req_id,
                "Request cancelled by user",
            )));
            return;
        }

        debug!(
            "[{req_id}] (worker) dequeued ({})",
            if is_streaming { "streaming" } else { "non-streaming" }
        );

        // b. Preflight liveness.
        if envelope.liveness.is_disconnected() {
            info!("[{req_id}] (worker) client disconnected before processing");
            envelope.result.resolve(Err(client_disconnected(
                &req_id,
                "Client disconnected before processing",
            )));
            return;
        }

        // c. Inter-stream cooldown.
        self.apply_stream_cooldown(&req_id, is_streaming).await;

        // d. Liveness again after the sleep.
        if envelope.liveness.is_disconnected() {
            info!("[{req_id}] (worker) client disconnected while waiting");
            envelope.result.resolve(Err(client_disconnected(
                &req_id,
                "Client disconnected while waiting",
            )));
            return;
        }

        debug!("[{req_id}] (worker) waiting for processing lock");
        let lock_guard = self.state.processing_lock.lock().await;
        debug!("[{req_id}] (worker) acquired processing lock");

        // e. Final liveness check inside the lock.
        if envelope.liveness.is_disconnected() {
            info!("[{req_id}] (worker) client disconnected inside lock");
            envelope.result.resolve(Err(client_disconnected(
                &req_id,
                "Client disconnected",
            )));
        } else if envelope.result.is_resolved() {
            info!("[{req_id}] (worker) future already resolved; skipping");
        } else {
            // f/g/h. Pipeline, completion wait, post-stream quiesce.
            self.execute(&envelope).await;
        }

        // i. Cleanup always runs, whatever happened above.
        self.cleanup(&req_id).await;

        drop(lock_guard);
        debug!("[{req_id}] (worker) released processing lock");

        self.was_last_streaming = is_streaming;
        self.last_completion = Some(Instant::now());
    }

    async fn apply_stream_cooldown(&self, req_id: &str, is_streaming: bool) {
        if !(self.was_last_streaming && is_streaming) {
            return;
        }
        let Some(last) = self.last_completion else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < STREAM_COOLDOWN {
            let delay = STREAM_COOLDOWN_FLOOR.max(STREAM_COOLDOWN - elapsed);
            info!(
                "[{req_id}] (worker) sequential streaming requests; delaying {:.2}s",
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn execute(&self, envelope: &Arc<Envelope>) {
        let req_id = envelope.req_id.as_str();
        let wait_budget = self.state.config.completion_timeout() + COMPLETION_WAIT_SLACK;

        match pipeline::process_request(&self.state, envelope).await {
            PipelineOutcome::Streaming(handoff) => {
                debug!("[{req_id}] (worker) streaming in flight; waiting for completion");
                let probe = spawn_streaming_probe(
                    envelope.liveness.clone(),
                    handoff.completion.clone(),
                    req_id,
                );
                let waited =
                    tokio::time::timeout(wait_budget, handoff.completion.wait()).await;
                probe.cancel();

                if waited.is_err() {
                    warn!("[{req_id}] (worker) completion wait timed out");
                    envelope.result.resolve(Err(processing_timeout(
                        req_id,
                        "Processing timed out waiting for completion.",
                    )));
                    return;
                }

                let disconnected_early =
                    envelope.liveness.is_disconnected() || handoff.watch.is_disconnected();
                debug!(
                    "[{req_id}] (worker) stream complete (early disconnect: {disconnected_early})"
                );
                if !disconnected_early {
                    // h. Best-effort UI quiesce after the stream.
                    if let Err(err) = self.state.session.ensure_generation_stopped().await {
                        warn!("[{req_id}] post-stream button handling failed: {err}");
                        crate::snapshot::capture_named(
                            &self.state,
                            req_id,
                            "post-stream quiesce",
                            &err.to_string(),
                        )
                        .await;
                    }
                }
            }
            PipelineOutcome::Completed => {
                // Non-streaming work resolved inside the pipeline; the wait
                // is normally instantaneous. The result slot, not this
                // worker task, owns the outcome, so a client disconnect
                // cannot cancel the scrape that already happened.
                let waited =
                    tokio::time::timeout(wait_budget, envelope.result.resolved()).await;
                if waited.is_err() {
                    error!("[{req_id}] (worker) pipeline exited without resolving the future");
                    envelope.result.resolve(Err(processing_timeout(
                        req_id,
                        "Processing timed out waiting for completion.",
                    )));
                }
            }
        }
    }

    /// Step i: drain the stream bus, drop the upload sandbox, reset the UI.
    async fn cleanup(&self, req_id: &str) {
        if self.state.config.stream_proxy_enabled() {
            let dropped = self.state.bus.drain().await;
            if dropped > 0 {
                debug!("[{req_id}] (worker) drained {dropped} leftover frames");
            }
        }

        UploadSandbox::remove(&self.state.config.upload_dir, req_id);

        if self.state.session.is_ready() {
            debug!("[{req_id}] (worker) clearing chat history");
            if let Err(err) = self.state.session.clear_chat().await {
                warn!("[{req_id}] (worker) chat clear failed: {err}");
            }
        }
    }
}

/// Spawnable worker entry point.
pub async fn run_queue_worker(state: Arc<AppState>) {
    QueueWorker::new(state).run().await;
}
