//! Disconnect detection and propagation.
//!
//! For every accepted request a background probe polls the client's liveness
//! handle. When the client goes away the probe sets the shared disconnect
//! event, resolves the result future with a 499 if nobody beat it to it, and
//! (for streaming requests) releases the worker's completion wait. Every
//! pipeline stage calls [`DisconnectWatch::check`] so blocked work unwinds
//! at the next checkpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{client_disconnected, GatewayError};
use crate::queue::Envelope;
use crate::session::ClientLiveness;
use crate::util::CompletionEvent;

/// Probe cadence. Short enough that abandoned work is torn down promptly,
/// long enough to stay invisible in profiles.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(300);

/// Shared view of "has this client gone away"; checkpoints read it.
pub struct DisconnectWatch {
    req_id: String,
    event: CompletionEvent,
}

impl DisconnectWatch {
    pub fn new(req_id: &str) -> Arc<Self> {
        Arc::new(DisconnectWatch {
            req_id: req_id.to_string(),
            event: CompletionEvent::new(),
        })
    }

    pub fn trip(&self) {
        self.event.set();
    }

    pub fn is_disconnected(&self) -> bool {
        self.event.is_set()
    }

    /// Checkpoint: returns normally while the client is alive, raises the
    /// disconnect sentinel otherwise. Stages are written so unwinding at any
    /// checkpoint leaves the UI session recoverable.
    pub fn check(&self, stage: &str) -> Result<(), GatewayError> {
        if self.event.is_set() {
            Err(client_disconnected(
                &self.req_id,
                format!("Client disconnected ({stage})"),
            ))
        } else {
            Ok(())
        }
    }
}

/// Handle to a running probe; aborting is how the pipeline cancels it, and
/// the probe swallows that silently. Dropping the handle aborts too, so an
/// early pipeline exit can never leak a probe.
pub struct ProbeHandle {
    task: JoinHandle<()>,
}

impl ProbeHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Per-request probe: on disconnect it trips the watch and resolves the
/// envelope's future with a 499.
pub fn spawn_request_probe(envelope: &Arc<Envelope>) -> (Arc<DisconnectWatch>, ProbeHandle) {
    let watch = DisconnectWatch::new(&envelope.req_id);
    let probe_watch = Arc::clone(&watch);
    let envelope = Arc::clone(envelope);
    let task = tokio::spawn(async move {
        loop {
            if probe_watch.is_disconnected() {
                break;
            }
            if envelope.liveness.is_disconnected() {
                info!("[{}] client disconnect detected by probe", envelope.req_id);
                probe_watch.trip();
                envelope.result.resolve(Err(client_disconnected(
                    &envelope.req_id,
                    "Client disconnected during processing.",
                )));
                break;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    });
    (watch, ProbeHandle { task })
}

/// Streaming-aware probe used during the worker's completion wait: on
/// disconnect it sets the completion event so the SSE side stops being
/// waited on.
pub fn spawn_streaming_probe(
    liveness: ClientLiveness,
    completion: CompletionEvent,
    req_id: &str,
) -> ProbeHandle {
    let req_id = req_id.to_string();
    let task = tokio::spawn(async move {
        loop {
            if completion.is_set() {
                break;
            }
            if liveness.is_disconnected() {
                info!("[{req_id}] client disconnected mid-stream, releasing completion wait");
                completion.set();
                break;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    });
    ProbeHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ChatCompletionRequest, Message};

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some("m1".into()),
            messages: vec![Message::text("user", "hi")],
            stream,
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
    async fn probe_resolves_future_with_disconnect() {
        let liveness = ClientLiveness::new();
        let (envelope, rx) = Envelope::new("r1".into(), request(false), liveness.clone());
        let (watch, _probe) = spawn_request_probe(&envelope);

        liveness.mark_disconnected();
        let result = rx.await.expect("future resolved");
        assert!(matches!(
            result,
            Err(GatewayError::ClientDisconnected { .. })
        ));
        assert!(watch.is_disconnected());
        assert!(watch.check("any stage").is_err());
    }

    #[tokio::test]
    async fn probe_cancellation_is_silent() {
        let liveness = ClientLiveness::new();
        let (envelope, _rx) = Envelope::new("r2".into(), request(false), liveness);
        let (watch, probe) = spawn_request_probe(&envelope);
        probe.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watch.is_disconnected());
        assert!(!envelope.result.is_resolved());
    }

    #[tokio::test]
    async fn streaming_probe_sets_completion() {
        let liveness = ClientLiveness::new();
        let completion = CompletionEvent::new();
        let _probe = spawn_streaming_probe(liveness.clone(), completion.clone(), "r3");
        liveness.mark_disconnected();
        tokio::time::timeout(Duration::from_secs(2), completion.wait())
            .await
            .expect("completion set after disconnect");
    }
}
