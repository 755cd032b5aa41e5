//! The per-request pipeline: validate → analyze model → optional switch →
//! parameter reconciliation → prompt preparation → submit → harvest.
//!
//! Every stage is bracketed by a disconnect checkpoint, every failure is
//! classified into a `GatewayError` and set on the result future, and the
//! future is never left unresolved on exit. Streaming requests hand a
//! [`StreamHandoff`] back to the worker; the worker holds the only
//! reference, there are no back-pointers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::disconnect::{spawn_request_probe, DisconnectWatch};
use crate::emitter::{self, EmitterParams};
use crate::error::{
    bad_request, client_disconnected, model_switch_failed, server_error, service_unavailable,
    upstream_error, GatewayError,
};
use crate::prompt::{
    collect_attachments, prepare_combined_prompt, validate_chat_request, UploadSandbox,
};
use crate::queue::{Envelope, RequestOutcome};
use crate::session::SessionError;
use crate::snapshot;
use crate::util::{estimate_tokens, AppState, CompletionEvent};

/// What the pipeline returns to the worker for a request whose response is
/// still being generated when the pipeline exits.
pub struct StreamHandoff {
    /// Set by the SSE generator (or a disconnect probe) when the stream is
    /// finished with.
    pub completion: CompletionEvent,
    /// The request's disconnect watch, for the worker's post-stream steps.
    pub watch: Arc<DisconnectWatch>,
}

pub enum PipelineOutcome {
    /// The future is resolved; nothing is in flight.
    Completed,
    /// A streaming response is in flight; the worker must wait on the
    /// handoff before releasing the processing lock.
    Streaming(StreamHandoff),
}

/// Run one request through the pipeline. Always resolves the future, one
/// way or another.
pub async fn process_request(state: &Arc<AppState>, envelope: &Arc<Envelope>) -> PipelineOutcome {
    let req_id = envelope.req_id.clone();

    if envelope.liveness.is_disconnected() {
        info!("[{req_id}] client disconnected before core processing; exiting early");
        envelope.result.resolve(Err(client_disconnected(
            &req_id,
            "Client disconnected before processing started",
        )));
        return PipelineOutcome::Completed;
    }

    if state.config.stream_proxy_enabled() {
        let dropped = state.bus.drain().await;
        if dropped > 0 {
            debug!("[{req_id}] dropped {dropped} residual frames before request");
        }
    }

    let (watch, probe) = spawn_request_probe(envelope);
    let mut stage = String::from("initialize");
    let result = run_stages(state, envelope, &watch, &mut stage).await;
    drop(probe); // cancelled silently; the worker runs its own monitors

    match result {
        Ok(Some(handoff)) => PipelineOutcome::Streaming(handoff),
        Ok(None) => PipelineOutcome::Completed,
        Err(err) => {
            if err.is_disconnect() {
                info!("[{req_id}] caught client disconnect during '{stage}'");
            } else {
                warn!("[{req_id}] pipeline failed during '{stage}': {err}");
                snapshot::maybe_capture(state, &req_id, &stage, &err).await;
            }
            envelope.result.resolve(Err(err));
            PipelineOutcome::Completed
        }
    }
}

async fn run_stages(
    state: &Arc<AppState>,
    envelope: &Arc<Envelope>,
    watch: &Arc<DisconnectWatch>,
    stage: &mut String,
) -> Result<Option<StreamHandoff>, GatewayError> {
    let req_id = envelope.req_id.as_str();
    let request = &envelope.request;
    let session = state.session.as_ref();

    *stage = "preflight".into();
    if !session.is_ready() {
        return Err(service_unavailable(req_id, "UI session lost or not ready."));
    }
    watch.check("Initial Page Check")?;
    if let Err(err) = session.ensure_temporary_chat().await {
        warn!("[{req_id}] temporary-chat assertion failed: {err}");
    }

    *stage = "analyze model".into();
    let model_before = state.current_model_id();
    let requested = request.model.clone().unwrap_or_default();
    // The configured default id doubles as a "whatever is loaded" sentinel.
    let needs_switch = !requested.is_empty()
        && requested != model_before
        && requested != state.config.default_model;
    if needs_switch && !state.catalog.read().expect("catalog lock").contains(&requested) {
        return Err(bad_request(req_id, format!("Unknown model id '{requested}'")));
    }

    if needs_switch {
        *stage = "switch model".into();
        watch.check("Before Model Switch")?;
        let _switch_guard = state.model_switching_lock.lock().await;
        match session.switch_model(&requested).await {
            Ok(()) => {
                state.set_current_model(&requested);
                info!("[{req_id}] switched model {model_before} -> {requested}");
            }
            Err(err) => {
                state.set_current_model(&model_before);
                return Err(model_switch_failed(
                    req_id,
                    format!(
                        "Failed to switch to model '{requested}': {err}. \
                         Please ensure the model is available."
                    ),
                ));
            }
        }
    }
    let model_in_use = state.current_model_id();

    *stage = "reconcile parameter cache".into();
    state.params.ensure_model(&model_in_use).await;

    *stage = "prepare prompt".into();
    watch.check("Before Prompt Prep")?;
    validate_chat_request(&request.messages, req_id)?;
    let prompt = prepare_combined_prompt(request, req_id);
    if prompt.is_empty() {
        return Err(bad_request(req_id, "prompt rendered empty"));
    }
    let sandbox = UploadSandbox::create(&state.config.upload_dir, req_id)
        .map_err(|e| server_error(req_id, format!("upload sandbox creation failed: {e}")))?;
    let attachments = collect_attachments(request, &sandbox, req_id);
    watch.check("After Prompt Prep")?;

    *stage = "adjust parameters".into();
    crate::params::reconcile_ui_parameters(
        req_id,
        request,
        session,
        &state.params,
        &state.config,
        watch,
    )
    .await?;

    watch.check("Final check before submitting prompt")?;
    *stage = "submit prompt".into();
    session
        .submit_prompt(&prompt, &attachments)
        .await
        .map_err(|err| map_session_error(req_id, err))?;

    *stage = "harvest response".into();
    let prompt_tokens = estimate_tokens(&prompt);
    let timeout = state.config.completion_timeout();

    if state.config.stream_proxy_enabled() {
        if request.stream {
            let completion = CompletionEvent::new();
            let params = EmitterParams {
                req_id: req_id.to_string(),
                model: model_in_use.clone(),
                prompt_tokens,
                completion: completion.clone(),
                liveness: envelope.liveness.clone(),
            };
            let body = emitter::sse_from_bus(Arc::clone(&state.bus), params, timeout);
            if !envelope.result.resolve(Ok(RequestOutcome::Stream(body))) {
                // Future already resolved (disconnect probe won); the body
                // will never be polled, so release the worker ourselves.
                completion.set();
            }
            Ok(Some(StreamHandoff {
                completion,
                watch: Arc::clone(watch),
            }))
        } else {
            let value = emitter::collect_from_bus(
                &state.bus,
                req_id,
                &model_in_use,
                &prompt,
                watch,
                timeout,
            )
            .await?;
            envelope.result.resolve(Ok(RequestOutcome::Json(value)));
            Ok(None)
        }
    } else if request.stream {
        let completion = CompletionEvent::new();
        let params = EmitterParams {
            req_id: req_id.to_string(),
            model: model_in_use.clone(),
            prompt_tokens,
            completion: completion.clone(),
            liveness: envelope.liveness.clone(),
        };
        let body = emitter::sse_from_scrape(Arc::clone(&state.session), params, timeout);
        if !envelope.result.resolve(Ok(RequestOutcome::Stream(body))) {
            completion.set();
        }
        Ok(Some(StreamHandoff {
            completion,
            watch: Arc::clone(watch),
        }))
    } else {
        let value = emitter::collect_from_scrape(
            session,
            req_id,
            &model_in_use,
            &prompt,
            watch,
            timeout,
        )
        .await?;
        envelope.result.resolve(Ok(RequestOutcome::Json(value)));
        Ok(None)
    }
}

fn map_session_error(req_id: &str, err: SessionError) -> GatewayError {
    match err {
        SessionError::Closed => service_unavailable(req_id, "UI session closed"),
        other => upstream_error(req_id, format!("UI interaction failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::chat::{ChatCompletionRequest, Message};
    use crate::session::{ClientLiveness, InMemorySession, UiSession};

    fn test_state() -> (Arc<AppState>, Arc<InMemorySession>) {
        let mut config = Config::for_tests();
        config.stream_port = 0;
        config.completion_timeout_ms = 2_000;
        config.upload_dir =
            std::env::temp_dir().join(format!("uirelay-pipeline-{}", uuid::Uuid::new_v4()));
        let session = Arc::new(InMemorySession::new(&config.default_model));
        let state = AppState::new(config, session.clone());
        (state, session)
    }

    fn request_for_model(model: Option<&str>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.map(|s| s.to_string()),
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
    async fn switch_failure_restores_model_and_maps_to_422() {
        let (state, session) = test_state();
        let before = state.current_model_id();
        state
            .catalog
            .write()
            .unwrap()
            .replace(vec![before.clone(), "other-model".into()]);
        session.fail_next_switch();

        let (envelope, rx) = Envelope::new(
            "sw1".into(),
            request_for_model(Some("other-model")),
            ClientLiveness::new(),
        );
        let outcome = process_request(&state, &envelope).await;
        assert!(matches!(outcome, PipelineOutcome::Completed));

        let result = rx.await.unwrap();
        assert!(matches!(
            result,
            Err(GatewayError::ModelSwitchFailed { .. })
        ));
        assert_eq!(state.current_model_id(), before);
    }

    #[tokio::test]
    async fn successful_switch_updates_current_model() {
        let (state, session) = test_state();
        let before = state.current_model_id();
        state
            .catalog
            .write()
            .unwrap()
            .replace(vec![before.clone(), "other-model".into()]);
        session.push_reply("switched ok");

        let (envelope, rx) = Envelope::new(
            "sw2".into(),
            request_for_model(Some("other-model")),
            ClientLiveness::new(),
        );
        let _ = process_request(&state, &envelope).await;
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(state.current_model_id(), "other-model");
        assert_eq!(session.current_model().await, "other-model");
    }

    #[tokio::test]
    async fn not_ready_session_yields_503() {
        let (state, session) = test_state();
        session.set_ready(false);

        let (envelope, rx) = Envelope::new(
            "nr1".into(),
            request_for_model(None),
            ClientLiveness::new(),
        );
        let _ = process_request(&state, &envelope).await;
        let result = rx.await.unwrap();
        assert!(matches!(
            result,
            Err(GatewayError::ServiceUnavailable { .. })
        ));
        assert!(session.submitted_prompts().is_empty());
    }
}
