//! Produces the user-facing byte stream: OpenAI-shaped SSE chunks in
//! streaming mode, a single JSON payload otherwise. Frames come from the
//! stream bus (proxy mode) or from the DOM scraper (fallback).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::disconnect::DisconnectWatch;
use crate::error::{classify_upstream, upstream_error, GatewayError};
use crate::models::chat::Usage;
use crate::queue::SseBody;
use crate::session::{ClientLiveness, UiSession};
use crate::stream::bus::{StreamBus, StreamFrame, ToolInvocation};
use crate::util::{calculate_usage, random_call_id, unix_now, CompletionEvent};

/// Everything the generators need to label their output.
#[derive(Clone)]
pub struct EmitterParams {
    pub req_id: String,
    pub model: String,
    /// Heuristic count over the submitted prompt, for the usage chunk.
    pub prompt_tokens: u64,
    pub completion: CompletionEvent,
    pub liveness: ClientLiveness,
}

/// Completion latch tied to the generator's lifetime: however the stream
/// ends (drained to `[DONE]`, error, or the client dropping the response
/// body), the worker's completion wait is released. An abandoned body also
/// marks the client disconnected.
struct StreamDropGuard {
    completion: CompletionEvent,
    liveness: ClientLiveness,
    finished: bool,
}

impl StreamDropGuard {
    fn new(completion: CompletionEvent, liveness: ClientLiveness) -> Self {
        StreamDropGuard {
            completion,
            liveness,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.completion.set();
    }
}

impl Drop for StreamDropGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.liveness.mark_disconnected();
            self.completion.set();
        }
    }
}

fn sse_data(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn chunk(req_id: &str, model: &str, created: u64, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": format!("chatcmpl-{req_id}"),
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

fn usage_chunk(req_id: &str, model: &str, created: u64, usage: &Usage) -> Value {
    json!({
        "id": format!("chatcmpl-{req_id}"),
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [],
        "usage": usage,
    })
}

fn sse_error_envelope(err: &GatewayError) -> Value {
    json!({
        "error": {
            "message": err.to_string(),
            "code": err.status().as_u16(),
        }
    })
}

/// Delta entries for `choices[0].delta.tool_calls`, one per accumulated
/// call, each with a locally-minted id.
fn tool_call_deltas(functions: &[ToolInvocation]) -> Vec<Value> {
    functions
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "index": index,
                "id": random_call_id(),
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.params.to_string(),
                },
            })
        })
        .collect()
}

/// Assemble the terminal JSON body shared by both non-streaming paths.
pub fn build_chat_response(
    req_id: &str,
    model: &str,
    body: &str,
    reason: &str,
    functions: &[ToolInvocation],
    usage: &Usage,
) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": body,
    });
    let mut finish_reason = "stop";
    if !functions.is_empty() {
        message["content"] = Value::Null;
        message["tool_calls"] = Value::Array(tool_call_deltas(functions));
        finish_reason = "tool_calls";
    }
    if !reason.is_empty() {
        message["reasoning_content"] = Value::String(reason.to_string());
    }
    json!({
        "id": format!("chatcmpl-{req_id}"),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": usage,
        "system_fingerprint": "uirelay",
    })
}

/// Streaming path over the stream bus. Emits role, deltas (content and
/// reasoning), tool calls, the finish chunk, a usage chunk, `[DONE]`. Error
/// frames end the stream with an error envelope and no `[DONE]`.
pub fn sse_from_bus(bus: Arc<StreamBus>, params: EmitterParams, budget: Duration) -> SseBody {
    let guard = StreamDropGuard::new(params.completion.clone(), params.liveness.clone());
    let stream = async_stream::stream! {
        let mut guard = guard;
        let created = unix_now();
        let req_id = params.req_id.as_str();
        let model = params.model.as_str();

        yield Ok::<Bytes, std::io::Error>(sse_data(&chunk(
            req_id, model, created,
            json!({"role": "assistant", "content": ""}),
            None,
        )));

        let deadline = tokio::time::Instant::now() + budget;
        let mut body_len = 0usize;
        let mut reason_len = 0usize;
        let mut outcome: StreamFrame = StreamFrame::internal_timeout();

        loop {
            if params.liveness.is_disconnected() {
                debug!("[{req_id}] client gone, stopping SSE generator");
                guard.finish();
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break; // budget exhausted, internal timeout
            }
            let frame = match bus.recv_timeout(remaining).await {
                Err(_) | Ok(None) => break, // idle past budget, or bus closed
                Ok(Some(frame)) => frame,
            };

            if frame.error.is_some() {
                outcome = frame;
                break;
            }
            if let Some(delta) = frame.reason.get(reason_len..) {
                if !delta.is_empty() && !frame.is_internal_timeout() {
                    reason_len = frame.reason.len();
                    yield Ok(sse_data(&chunk(
                        req_id, model, created,
                        json!({"reasoning_content": delta}),
                        None,
                    )));
                }
            }
            if let Some(delta) = frame.body.get(body_len..) {
                if !delta.is_empty() {
                    body_len = frame.body.len();
                    yield Ok(sse_data(&chunk(
                        req_id, model, created,
                        json!({"content": delta}),
                        None,
                    )));
                }
            }
            if frame.done {
                outcome = frame;
                break;
            }
        }

        if let Some(frame_error) = outcome.error.as_ref() {
            let err = classify_upstream(req_id, frame_error.status, &frame_error.message);
            warn!("[{req_id}] stream ended with upstream error: {err}");
            yield Ok(sse_data(&sse_error_envelope(&err)));
            guard.finish();
            return;
        }
        if outcome.is_internal_timeout() {
            let err = upstream_error(req_id, "Stream processing error (Internal Timeout)");
            yield Ok(sse_data(&sse_error_envelope(&err)));
            guard.finish();
            return;
        }

        let finish_reason = if outcome.function.is_empty() {
            "stop"
        } else {
            yield Ok(sse_data(&chunk(
                req_id, model, created,
                json!({"tool_calls": tool_call_deltas(&outcome.function)}),
                None,
            )));
            "tool_calls"
        };
        yield Ok(sse_data(&chunk(req_id, model, created, json!({}), Some(finish_reason))));

        let completion_tokens =
            calculate_usage("", &outcome.body, &outcome.reason).completion_tokens;
        let usage = Usage {
            prompt_tokens: params.prompt_tokens,
            completion_tokens,
            total_tokens: params.prompt_tokens + completion_tokens,
        };
        yield Ok(sse_data(&usage_chunk(req_id, model, created, &usage)));
        yield Ok(sse_done());
        guard.finish();
    };
    Box::pin(stream)
}

/// Streaming path for DOM-scrape mode: one content delta carrying the whole
/// scraped response, then the terminal chunks.
pub fn sse_from_scrape(
    session: Arc<dyn UiSession>,
    params: EmitterParams,
    wait_timeout: Duration,
) -> SseBody {
    let guard = StreamDropGuard::new(params.completion.clone(), params.liveness.clone());
    let stream = async_stream::stream! {
        let mut guard = guard;
        let created = unix_now();
        let req_id = params.req_id.as_str();
        let model = params.model.as_str();

        yield Ok::<Bytes, std::io::Error>(sse_data(&chunk(
            req_id, model, created,
            json!({"role": "assistant", "content": ""}),
            None,
        )));

        let scraped = match session.wait_response_done(wait_timeout).await {
            Ok(()) => session.scrape_response().await,
            Err(err) => Err(err),
        };
        let text = match scraped {
            Ok(text) => text,
            Err(err) => {
                let err = upstream_error(req_id, format!("UI response scrape failed: {err}"));
                yield Ok(sse_data(&sse_error_envelope(&err)));
                guard.finish();
                return;
            }
        };

        if params.liveness.is_disconnected() {
            guard.finish();
            return;
        }

        if !text.is_empty() {
            yield Ok(sse_data(&chunk(
                req_id, model, created,
                json!({"content": text}),
                None,
            )));
        }
        yield Ok(sse_data(&chunk(req_id, model, created, json!({}), Some("stop"))));

        let completion_tokens = calculate_usage("", &text, "").completion_tokens;
        let usage = Usage {
            prompt_tokens: params.prompt_tokens,
            completion_tokens,
            total_tokens: params.prompt_tokens + completion_tokens,
        };
        yield Ok(sse_data(&usage_chunk(req_id, model, created, &usage)));
        yield Ok(sse_done());
        guard.finish();
    };
    Box::pin(stream)
}

/// Non-streaming proxy path: drain the bus to `done` and assemble the JSON
/// payload.
pub async fn collect_from_bus(
    bus: &StreamBus,
    req_id: &str,
    model: &str,
    prompt: &str,
    watch: &DisconnectWatch,
    budget: Duration,
) -> Result<Value, GatewayError> {
    let deadline = tokio::time::Instant::now() + budget;
    let final_frame: StreamFrame;

    loop {
        watch.check("Non-streaming bus drain")?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(upstream_error(
                req_id,
                "Stream processing error (Internal Timeout)",
            ));
        }
        let frame = match bus.recv_timeout(remaining).await {
            Err(_) | Ok(None) => {
                return Err(upstream_error(
                    req_id,
                    "Stream processing error (Internal Timeout)",
                ));
            }
            Ok(Some(frame)) => frame,
        };
        if let Some(frame_error) = frame.error.as_ref() {
            return Err(classify_upstream(
                req_id,
                frame_error.status,
                &frame_error.message,
            ));
        }
        if frame.done {
            final_frame = frame;
            break;
        }
    }

    if final_frame.is_internal_timeout() {
        return Err(upstream_error(
            req_id,
            "Stream processing error (Internal Timeout)",
        ));
    }
    if final_frame.body.is_empty() && final_frame.function.is_empty() {
        return Err(upstream_error(
            req_id,
            "Stream completed but no content was provided",
        ));
    }

    let usage = calculate_usage(prompt, &final_frame.body, &final_frame.reason);
    Ok(build_chat_response(
        req_id,
        model,
        &final_frame.body,
        &final_frame.reason,
        &final_frame.function,
        &usage,
    ))
}

/// Non-streaming DOM-scrape path.
pub async fn collect_from_scrape(
    session: &dyn UiSession,
    req_id: &str,
    model: &str,
    prompt: &str,
    watch: &DisconnectWatch,
    wait_timeout: Duration,
) -> Result<Value, GatewayError> {
    watch.check("Scrape wait")?;
    session
        .wait_response_done(wait_timeout)
        .await
        .map_err(|err| upstream_error(req_id, format!("UI never reached done state: {err}")))?;
    watch.check("Scrape extract")?;
    let text = session
        .scrape_response()
        .await
        .map_err(|err| upstream_error(req_id, format!("UI response scrape failed: {err}")))?;

    let usage = calculate_usage(prompt, &text, "");
    Ok(build_chat_response(req_id, model, &text, "", &[], &usage))
}
