//! HTTP surface: the chat-completions endpoint plus the small management
//! API (models, capabilities, cancel, queue, health).
//!
//! The chat handler only builds an envelope, enqueues it and awaits the
//! result future; the worker owns everything else. A drop guard on the
//! handler future is what turns an actix-side disconnect into a liveness
//! signal the worker can observe.

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder, ResponseError};
use serde_json::json;
use tracing::info;

use crate::error::GatewayError;
use crate::models::chat::ChatCompletionRequest;
use crate::queue::{Envelope, RequestOutcome};
use crate::session::{ClientLiveness, LivenessGuard};
use crate::util::{error_response, random_req_id, AppState};

/// POST /v1/chat/completions
pub async fn chat_completions(
    state: web::Data<AppState>,
    body: web::Json<ChatCompletionRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let req_id = random_req_id();
    info!(
        "[{req_id}] accepted chat completion (model={:?}, stream={})",
        request.model, request.stream
    );

    let liveness = ClientLiveness::new();
    let mut guard = LivenessGuard::arm(liveness.clone());
    let (envelope, rx) = Envelope::new(req_id.clone(), request, liveness);
    state.queue.push(envelope);

    // If the client disconnects, actix drops this future mid-await and the
    // armed guard flips the liveness handle for the worker's probes.
    let result = rx.await;
    guard.disarm();

    match result {
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("[{req_id}] result channel closed unexpectedly"),
        ),
        Ok(Ok(RequestOutcome::Json(value))) => HttpResponse::Ok().json(value),
        Ok(Ok(RequestOutcome::Stream(body))) => HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .streaming(body),
        Ok(Err(err)) => {
            if err.is_disconnect() {
                // The requester is gone; this response goes nowhere. Log and
                // answer anyway so actix can finish the exchange.
                info!("[{req_id}] request ended by disconnect/cancel: {err}");
            }
            err.error_response()
        }
    }
}

/// GET /v1/models
pub async fn list_models(state: web::Data<AppState>) -> impl Responder {
    let excludes = state.config.model_exclude_list();
    let entries = state
        .catalog
        .read()
        .expect("catalog lock")
        .entries_excluding(&excludes);
    HttpResponse::Ok().json(json!({
        "object": "list",
        "data": entries,
    }))
}

/// GET /api/model-capabilities
pub async fn model_capabilities_all() -> impl Responder {
    HttpResponse::Ok().json(crate::capabilities::all_categories())
}

/// GET /api/model-capabilities/{model_id}
pub async fn model_capabilities_one(path: web::Path<String>) -> impl Responder {
    let model_id = path.into_inner();
    let mut caps = crate::capabilities::capabilities_for(&model_id);
    if let Some(obj) = caps.as_object_mut() {
        obj.insert("modelId".to_string(), json!(model_id));
    }
    HttpResponse::Ok().json(caps)
}

/// POST /v1/cancel/{req_id}
pub async fn cancel_request(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let req_id = path.into_inner();
    if state.queue.cancel(&req_id) {
        info!("[{req_id}] cancellation requested via endpoint");
        HttpResponse::Ok().json(json!({
            "success": true,
            "message": format!("Request {req_id} marked as cancelled."),
        }))
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("Request {req_id} not found in queue."),
        )
    }
}

/// GET /v1/queue
pub async fn queue_status(state: web::Data<AppState>) -> impl Responder {
    let items: Vec<_> = state
        .queue
        .snapshot()
        .iter()
        .map(|envelope| {
            json!({
                "req_id": envelope.req_id,
                "wait_time_seconds": envelope.wait_time().as_secs_f64(),
                "stream": envelope.is_streaming(),
                "cancelled": envelope.is_cancelled(),
            })
        })
        .collect();
    let is_locked = state.processing_lock.try_lock().is_err();
    HttpResponse::Ok().json(json!({
        "queue_length": items.len(),
        "is_processing_locked": is_locked,
        "items": items,
    }))
}

/// GET /health. 200 only once startup finished and the worker is alive.
pub async fn health(state: web::Data<AppState>) -> impl Responder {
    if state.is_initialized() && state.is_worker_alive() {
        HttpResponse::Ok().json(json!({
            "status": "ok",
            "queue_length": state.queue.len(),
        }))
    } else {
        let mut reasons = Vec::new();
        if !state.is_initialized() {
            reasons.push("initialization incomplete");
        }
        if !state.is_worker_alive() {
            reasons.push("worker not running");
        }
        HttpResponse::ServiceUnavailable().json(json!({
            "status": "unavailable",
            "reasons": reasons,
        }))
    }
}

/// JSON extractor failures become the OpenAI error body with a 400.
pub fn json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &actix_web::HttpRequest,
) -> actix_web::Error {
    let message = err.to_string();
    GatewayError::BadRequest {
        req_id: "schema".to_string(),
        message,
    }
    .into()
}

/// Mount every route; shared between the binary and the tests.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .route("/v1/chat/completions", web::post().to(chat_completions))
        .route("/v1/models", web::get().to(list_models))
        .route(
            "/api/model-capabilities",
            web::get().to(model_capabilities_all),
        )
        .route(
            "/api/model-capabilities/{model_id}",
            web::get().to(model_capabilities_one),
        )
        .route("/v1/cancel/{req_id}", web::post().to(cancel_request))
        .route("/v1/queue", web::get().to(queue_status))
        .route("/health", web::get().to(health));
}
