use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use crate::catalog::ModelCatalog;
use crate::config::Config;
use crate::models::chat::Usage;
use crate::params::ParamsCache;
use crate::queue::RequestQueue;
use crate::session::UiSession;
use crate::stream::bus::StreamBus;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Env file resolution order: an explicit path from ENV_FILE / DOTENV_PATH,
/// then the conventional `.env` in the working directory. Missing files are
/// fine; existing process env always wins.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(status).json(body)
}

/// Build a CORS configuration from environment variables.
///
/// CORS_ALLOWED_ORIGINS: "*" or comma-separated origins. Defaults are
/// permissive; the gateway normally sits behind a trusted frontend.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => {
            cors = cors.allow_any_origin();
        }
    }
    cors
}

/// Short opaque request id.
pub fn random_req_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Locally-minted tool-call id in the `call_…` shape clients expect.
pub fn random_call_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("call_{suffix}")
}

/// Unix timestamp for `created` fields.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Heuristic token count: four characters per token, rounded up. Accuracy is
/// explicitly not a goal; the numbers only have to be monotone and cheap.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Usage numbers for a finished response.
pub fn calculate_usage(prompt: &str, body: &str, reason: &str) -> Usage {
    let prompt_tokens = estimate_tokens(prompt);
    let completion_tokens = estimate_tokens(body) + estimate_tokens(reason);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

/// One-way latch shared between the emitter, the worker and the disconnect
/// probes. `wait` observes a set that happened before the call.
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionEvent {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CompletionEvent { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Shared application state: every singleton of the request lifecycle,
/// built once at startup and threaded into handlers and tasks.
pub struct AppState {
    pub config: Config,
    pub session: Arc<dyn UiSession>,
    pub queue: RequestQueue,
    /// The single-inflight gate. Held for the whole active span of one
    /// request.
    pub processing_lock: tokio::sync::Mutex<()>,
    /// Serializes model switches (they reload the session page).
    pub model_switching_lock: tokio::sync::Mutex<()>,
    pub params: ParamsCache,
    pub bus: Arc<StreamBus>,
    pub catalog: RwLock<ModelCatalog>,
    current_model: RwLock<String>,
    initialized: AtomicBool,
    worker_alive: AtomicBool,
    pub auth: crate::auth::AuthTokens,
    /// Outbound client for the optional catalogue refresh.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, session: Arc<dyn UiSession>) -> Arc<Self> {
        let default_model = config.default_model.clone();
        let catalog = ModelCatalog::with_default(&default_model);
        let auth = crate::auth::AuthTokens::from_config(&config);
        Arc::new(AppState {
            config,
            session,
            queue: RequestQueue::new(),
            processing_lock: tokio::sync::Mutex::new(()),
            model_switching_lock: tokio::sync::Mutex::new(()),
            params: ParamsCache::new(),
            bus: Arc::new(StreamBus::new(StreamBus::DEFAULT_CAPACITY)),
            catalog: RwLock::new(catalog),
            current_model: RwLock::new(default_model),
            initialized: AtomicBool::new(false),
            worker_alive: AtomicBool::new(false),
            auth,
            http: reqwest::Client::builder()
                .user_agent(format!("uirelay/{}", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        })
    }

    pub fn current_model_id(&self) -> String {
        self.current_model.read().expect("model id lock").clone()
    }

    pub fn set_current_model(&self, id: &str) {
        *self.current_model.write().expect("model id lock") = id.to_string();
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_worker_alive(&self, alive: bool) {
        self.worker_alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn usage_totals_add_up() {
        let usage = calculate_usage("12345678", "abcd", "xy");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn call_ids_have_expected_shape() {
        let id = random_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 16);
    }

    #[tokio::test]
    async fn completion_event_is_one_way() {
        let event = CompletionEvent::new();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        // Set-before-wait must not block.
        event.wait().await;
    }
}
