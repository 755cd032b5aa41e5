//! Runtime configuration. Every flag is also settable through the
//! environment variable of the same name, so containerized deployments can
//! skip the CLI entirely.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LaunchMode {
    /// Interactive browser with devtools; auth state optional.
    Debug,
    /// Headless browser session.
    Headless,
    /// Headless inside a virtual display.
    #[value(alias = "virtual_headless")]
    VirtualHeadless,
    /// API server only, no browser; requests run against the loopback session.
    #[value(alias = "direct_debug_no_browser")]
    DirectDebugNoBrowser,
}

impl LaunchMode {
    pub fn requires_auth_state(self) -> bool {
        !matches!(self, LaunchMode::Debug | LaunchMode::DirectDebugNoBrowser)
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "uirelay", about = "OpenAI-compatible gateway over a provider web UI")]
pub struct Config {
    /// HTTP listen address.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:2048")]
    pub bind_addr: String,

    #[arg(long, env = "LAUNCH_MODE", value_enum, default_value = "headless")]
    pub launch_mode: LaunchMode,

    /// Browser auth-state file; required for non-debug launch modes.
    #[arg(long, env = "AUTH_STATE_PATH")]
    pub auth_state_path: Option<PathBuf>,

    /// Stream-proxy listen port. 0 disables interception and forces
    /// DOM-scrape harvesting.
    #[arg(long, env = "STREAM_PORT", default_value_t = 3120)]
    pub stream_port: u16,

    /// Optional HTTP proxy the MITM pump chains its upstream connections
    /// through, e.g. "http://127.0.0.1:7890".
    #[arg(long, env = "UPSTREAM_PROXY_URL")]
    pub upstream_proxy_url: Option<String>,

    /// Per-request completion timeout in milliseconds.
    #[arg(long, env = "RESPONSE_COMPLETION_TIMEOUT_MS", default_value_t = 300_000)]
    pub completion_timeout_ms: u64,

    /// Comma-separated hostnames to intercept; a leading "*." matches any
    /// subdomain (but not the bare domain).
    #[arg(
        long,
        env = "INTERCEPT_DOMAINS",
        default_value = "alkalimakersuite-pa.clients6.google.com,*.clients6.google.com"
    )]
    pub intercept_domains: String,

    /// Certificate store directory (CA material plus per-domain leaves).
    #[arg(long, env = "CERT_DIR", default_value = "certs")]
    pub cert_dir: PathBuf,

    /// Root directory for per-request upload sandboxes.
    #[arg(long, env = "UPLOAD_DIR", default_value = "upload_files")]
    pub upload_dir: PathBuf,

    /// Comma-separated inbound bearer tokens. Empty disables auth.
    #[arg(long, env = "API_TOKENS", default_value = "")]
    pub api_tokens: String,

    /// File with one bearer token per line, merged with API_TOKENS.
    #[arg(long, env = "AUTH_TOKEN_FILE")]
    pub auth_token_file: Option<PathBuf>,

    /// Comma-separated /v1 paths exempt from auth.
    #[arg(long, env = "AUTH_EXCLUDE_PATHS", default_value = "")]
    pub auth_exclude_paths: String,

    /// Model ids hidden from /v1/models.
    #[arg(long, env = "MODEL_EXCLUDES", default_value = "")]
    pub model_excludes: String,

    /// Fallback model id when the catalogue is unavailable.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "gemini-2.5-pro")]
    pub default_model: String,

    /// Enable the UI "URL context" toggle for requests that ask for it.
    #[arg(long, env = "ENABLE_URL_CONTEXT", default_value_t = false)]
    pub enable_url_context: bool,

    /// Enable the UI search-grounding toggle.
    #[arg(long, env = "ENABLE_SEARCH", default_value_t = false)]
    pub enable_search: bool,

    /// Log every parsed stream frame (very chatty).
    #[arg(long, env = "DEBUG_LOGS", default_value_t = false)]
    pub debug_logs: bool,
}

impl Config {
    /// Parse from process args + env.
    pub fn from_env() -> Self {
        Config::parse()
    }

    /// Config with defaults only, for tests and embedding.
    pub fn for_tests() -> Self {
        Config::parse_from(["uirelay"])
    }

    pub fn stream_proxy_enabled(&self) -> bool {
        self.stream_port != 0
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn intercept_domain_list(&self) -> Vec<String> {
        split_csv(&self.intercept_domains)
    }

    pub fn model_exclude_list(&self) -> Vec<String> {
        split_csv(&self.model_excludes)
    }

    pub fn auth_exclude_list(&self) -> Vec<String> {
        split_csv(&self.auth_exclude_paths)
    }

    /// Inbound bearer tokens from API_TOKENS plus the token file, if any.
    pub fn inbound_tokens(&self) -> Vec<String> {
        let mut tokens = split_csv(&self.api_tokens);
        if let Some(path) = &self.auth_token_file {
            if let Ok(text) = std::fs::read_to_string(path) {
                for line in text.lines() {
                    let t = line.trim();
                    if !t.is_empty() && !t.starts_with('#') {
                        tokens.push(t.to_string());
                    }
                }
            }
        }
        tokens
    }

    /// Startup validation; failures here are fatal (non-zero exit).
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.launch_mode.requires_auth_state() {
            match &self.auth_state_path {
                Some(p) if p.is_file() => {}
                Some(p) => anyhow::bail!("auth-state file not found: {}", p.display()),
                None => anyhow::bail!(
                    "AUTH_STATE_PATH is required for launch mode {:?}",
                    self.launch_mode
                ),
            }
        }
        Ok(())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
