//! Handler-level tests over the mounted routes: health, models,
//! capabilities, queue, cancel, auth and the chat endpoint's validation
//! boundaries.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware::from_fn, test, web, App};
use serde_json::{json, Value};
use uirelay::auth::bearer_guard;
use uirelay::config::Config;
use uirelay::models::chat::{ChatCompletionRequest, Message};
use uirelay::queue::Envelope;
use uirelay::server::config_routes;
use uirelay::session::{ClientLiveness, InMemorySession};
use uirelay::util::AppState;
use uirelay::worker::run_queue_worker;

fn build_state(configure: impl FnOnce(&mut Config)) -> Arc<AppState> {
    let mut config = Config::for_tests();
    config.stream_port = 0;
    config.completion_timeout_ms = 5_000;
    config.upload_dir =
        std::env::temp_dir().join(format!("uirelay-http-{}", uuid::Uuid::new_v4()));
    // Defeat any tokens leaking in from the environment.
    config.api_tokens = String::new();
    config.auth_token_file = None;
    configure(&mut config);
    let session = Arc::new(InMemorySession::new(&config.default_model));
    AppState::new(config, session)
}

macro_rules! test_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::from(Arc::clone($state)))
                .wrap(from_fn(bearer_guard))
                .configure(config_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn health_reflects_initialization_and_worker() {
    let state = build_state(|_| {});
    let app = test_app!(&state);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status().as_u16(), 503);

    state.mark_initialized();
    state.set_worker_alive(true);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
}

#[actix_web::test]
async fn models_lists_catalog_minus_exclusions() {
    let state = build_state(|cfg| {
        cfg.model_excludes = "hidden-model".into();
    });
    state
        .catalog
        .write()
        .unwrap()
        .replace(vec!["m1".into(), "hidden-model".into(), "m2".into()]);
    let app = test_app!(&state);

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/v1/models").to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert!(body["data"][0]["object"] == "model");
}

#[actix_web::test]
async fn capability_endpoints() {
    let state = build_state(|_| {});
    let app = test_app!(&state);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/model-capabilities")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["categories"]["gemini25Pro"]["budgetRange"].is_array());

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/model-capabilities/gemini-2.5-pro")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["thinkingType"], "budget");
    assert_eq!(body["modelId"], "gemini-2.5-pro");
}

#[actix_web::test]
async fn cancel_unknown_request_is_404() {
    let state = build_state(|_| {});
    let app = test_app!(&state);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/cancel/nope")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 404);
}

#[actix_web::test]
async fn queue_endpoint_reports_items_and_cancel_marks_them() {
    let state = build_state(|_| {});
    let app = test_app!(&state);

    let (envelope, _rx) = Envelope::new(
        "queued-1".into(),
        ChatCompletionRequest {
            model: None,
            messages: vec![Message::text("user", "hi")],
            stream: true,
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
        },
        ClientLiveness::new(),
    );
    state.queue.push(envelope);

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/v1/queue").to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["queue_length"], 1);
    assert_eq!(body["is_processing_locked"], false);
    assert_eq!(body["items"][0]["req_id"], "queued-1");
    assert_eq!(body["items"][0]["stream"], true);
    assert_eq!(body["items"][0]["cancelled"], false);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/cancel/queued-1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/v1/queue").to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["items"][0]["cancelled"], true);
}

#[actix_web::test]
async fn bearer_auth_guards_v1_paths() {
    let state = build_state(|cfg| {
        cfg.api_tokens = "sekret".into();
    });
    let app = test_app!(&state);

    // /v1 without a token: rejected.
    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/v1/queue").to_request()).await;
    assert_eq!(resp.status().as_u16(), 401);

    // Wrong token: rejected.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/v1/queue")
            .insert_header(("authorization", "Bearer wrong"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 401);

    // Correct token: accepted.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/v1/queue")
            .insert_header(("authorization", "Bearer sekret"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);

    // Non-/v1 paths stay open.
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_ne!(resp.status().as_u16(), 401);
}

#[actix_web::test]
async fn empty_and_system_only_messages_are_bad_requests() {
    let state = build_state(|_| {});
    tokio::spawn(run_queue_worker(Arc::clone(&state)));
    let app = test_app!(&state);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(json!({"messages": [], "stream": false}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 400);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(json!({
                "messages": [{"role": "system", "content": "only rules"}],
                "stream": false
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 400);
}

#[actix_web::test]
async fn chat_completion_end_to_end_scrape_mode() {
    let session = Arc::new(InMemorySession::new("gemini-2.5-pro"));
    let mut config = Config::for_tests();
    config.stream_port = 0;
    config.completion_timeout_ms = 5_000;
    config.api_tokens = String::new();
    config.auth_token_file = None;
    config.upload_dir =
        std::env::temp_dir().join(format!("uirelay-http-{}", uuid::Uuid::new_v4()));
    let state = AppState::new(config, session.clone());
    session.push_reply("pong");
    tokio::spawn(run_queue_worker(Arc::clone(&state)));
    let app = test_app!(&state);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(json!({
                "model": "gemini-2.5-pro",
                "stream": false,
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);
}

#[actix_web::test]
async fn chat_completion_streaming_scrape_mode() {
    let session = Arc::new(InMemorySession::new("gemini-2.5-pro"));
    let mut config = Config::for_tests();
    config.stream_port = 0;
    config.completion_timeout_ms = 5_000;
    config.api_tokens = String::new();
    config.auth_token_file = None;
    config.upload_dir =
        std::env::temp_dir().join(format!("uirelay-http-{}", uuid::Uuid::new_v4()));
    let state = AppState::new(config, session.clone());
    session.push_reply("streamed answer");
    tokio::spawn(run_queue_worker(Arc::clone(&state)));
    let app = test_app!(&state);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(json!({
                "stream": true,
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = test::read_body(resp).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("streamed answer"));
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.contains("\"usage\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    // Give the worker a beat to run cleanup before the runtime tears down.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
