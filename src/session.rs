//! Seams to the two external parties the core talks to: the browser-driven
//! UI session and the originating HTTP client.
//!
//! The browser-automation binding itself lives outside this crate; the core
//! only ever sees the [`UiSession`] trait. [`InMemorySession`] is the
//! loopback implementation used by the direct-debug launch mode and by the
//! test suite.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("ui interaction failed: {0}")]
    Interaction(String),
    #[error("ui wait timed out: {0}")]
    Timeout(String),
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn interaction(msg: impl Into<String>) -> Self {
        SessionError::Interaction(msg.into())
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        SessionError::Timeout(msg.into())
    }
}

/// The browser-automation seam. One implementation drives one live UI
/// session; the gateway never assumes it tolerates concurrent use: the
/// worker's processing lock is the only caller at any time.
///
/// Setters return the value the UI displays after the interaction so the
/// caller can verify the write took effect.
#[async_trait]
pub trait UiSession: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn current_model(&self) -> String;

    /// Switch the UI to another model; implementations persist the choice
    /// and reload the session page.
    async fn switch_model(&self, model_id: &str) -> Result<(), SessionError>;

    async fn set_temperature(&self, value: f64) -> Result<f64, SessionError>;
    async fn set_max_output_tokens(&self, value: u64) -> Result<u64, SessionError>;
    async fn set_stop_sequences(
        &self,
        values: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, SessionError>;
    async fn set_top_p(&self, value: f64) -> Result<f64, SessionError>;
    /// `None` disables the thinking budget where the model supports it.
    async fn set_thinking_budget(&self, tokens: Option<u64>) -> Result<(), SessionError>;
    async fn set_feature_toggles(
        &self,
        url_context: bool,
        search: bool,
    ) -> Result<(), SessionError>;

    /// Fill the prompt textarea, attach files, click submit. Implementations
    /// fall back to Enter / Ctrl+Enter when the click path fails.
    async fn submit_prompt(&self, prompt: &str, attachments: &[PathBuf])
        -> Result<(), SessionError>;

    /// Wait until the UI reports generation finished (submit button idle,
    /// edit affordance present, textarea empty again).
    async fn wait_response_done(&self, timeout: Duration) -> Result<(), SessionError>;

    /// Read the finished response text out of the DOM.
    async fn scrape_response(&self) -> Result<String, SessionError>;

    /// Best-effort: make sure the stop/generate button is idle.
    async fn ensure_generation_stopped(&self) -> Result<(), SessionError>;

    /// Clear the visible chat history. Redundant under temporary-chat, but
    /// cleanup runs it anyway.
    async fn clear_chat(&self) -> Result<(), SessionError>;

    /// Assert the session is in temporary-chat mode.
    async fn ensure_temporary_chat(&self) -> Result<(), SessionError>;

    /// Dump whatever diagnostic artifacts the session can produce
    /// (screenshot, DOM, console/network logs) into `dir`.
    async fn capture_diagnostics(&self, dir: &Path) -> Result<(), SessionError>;
}

// ---------------------------------------------------------------------------
// Client liveness
// ---------------------------------------------------------------------------

/// Liveness handle for the originating HTTP connection. actix gives no
/// polling probe, so the HTTP handler arms a [`LivenessGuard`]; when the
/// framework drops the handler future on disconnect, the guard flips this
/// handle. Probes only ever read it.
#[derive(Clone, Debug, Default)]
pub struct ClientLiveness {
    gone: Arc<AtomicBool>,
}

impl ClientLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_disconnected(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }
}

/// Drop guard armed for the lifetime of the HTTP handler (or of the SSE
/// body). Dropping it without `disarm()` marks the client disconnected.
pub struct LivenessGuard {
    liveness: ClientLiveness,
    armed: bool,
}

impl LivenessGuard {
    pub fn arm(liveness: ClientLiveness) -> Self {
        LivenessGuard {
            liveness,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        if self.armed {
            self.liveness.mark_disconnected();
        }
    }
}

// ---------------------------------------------------------------------------
// Loopback session
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InMemoryState {
    model: String,
    temperature: Option<f64>,
    max_output_tokens: Option<u64>,
    stop_sequences: BTreeSet<String>,
    top_p: Option<f64>,
    submitted: Vec<String>,
    canned_replies: Vec<String>,
    fail_switch: bool,
    temperature_drift: Option<f64>,
}

/// In-process stand-in for a browser session. Echoes the submitted prompt
/// back as the response unless canned replies are queued. Also the test
/// double: interactions are recorded and individual operations can be made
/// to misbehave.
#[derive(Clone)]
pub struct InMemorySession {
    ready: Arc<AtomicBool>,
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new("gemini-2.5-pro")
    }
}

impl InMemorySession {
    pub fn new(model: &str) -> Self {
        InMemorySession {
            ready: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(InMemoryState {
                model: model.to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Queue a reply returned by the next `scrape_response` call.
    pub fn push_reply(&self, text: &str) {
        self.state
            .lock()
            .expect("session state")
            .canned_replies
            .push(text.to_string());
    }

    /// Make the next model switch fail.
    pub fn fail_next_switch(&self) {
        self.state.lock().expect("session state").fail_switch = true;
    }

    /// Make temperature read-back differ from what was written, to exercise
    /// the cache-invalidation path.
    pub fn drift_temperature(&self, reported: f64) {
        self.state.lock().expect("session state").temperature_drift = Some(reported);
    }

    pub fn submitted_prompts(&self) -> Vec<String> {
        self.state.lock().expect("session state").submitted.clone()
    }

    /// Parameter values as the fake UI currently displays them.
    pub fn applied_parameters(&self) -> (Option<f64>, Option<u64>, BTreeSet<String>, Option<f64>) {
        let st = self.state.lock().expect("session state");
        (
            st.temperature,
            st.max_output_tokens,
            st.stop_sequences.clone(),
            st.top_p,
        )
    }
}

#[async_trait]
impl UiSession for InMemorySession {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn current_model(&self) -> String {
        self.state.lock().expect("session state").model.clone()
    }

    async fn switch_model(&self, model_id: &str) -> Result<(), SessionError> {
        let mut st = self.state.lock().expect("session state");
        if st.fail_switch {
            st.fail_switch = false;
            return Err(SessionError::interaction("model selector rejected choice"));
        }
        st.model = model_id.to_string();
        Ok(())
    }

    async fn set_temperature(&self, value: f64) -> Result<f64, SessionError> {
        let mut st = self.state.lock().expect("session state");
        st.temperature = Some(value);
        Ok(st.temperature_drift.take().unwrap_or(value))
    }

    async fn set_max_output_tokens(&self, value: u64) -> Result<u64, SessionError> {
        let mut st = self.state.lock().expect("session state");
        st.max_output_tokens = Some(value);
        Ok(value)
    }

    async fn set_stop_sequences(
        &self,
        values: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, SessionError> {
        let mut st = self.state.lock().expect("session state");
        st.stop_sequences = values.clone();
        Ok(values.clone())
    }

    async fn set_top_p(&self, value: f64) -> Result<f64, SessionError> {
        let mut st = self.state.lock().expect("session state");
        st.top_p = Some(value);
        Ok(value)
    }

    async fn set_thinking_budget(&self, _tokens: Option<u64>) -> Result<(), SessionError> {
        Ok(())
    }

    async fn set_feature_toggles(
        &self,
        _url_context: bool,
        _search: bool,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    async fn submit_prompt(
        &self,
        prompt: &str,
        _attachments: &[PathBuf],
    ) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::Closed);
        }
        self.state
            .lock()
            .expect("session state")
            .submitted
            .push(prompt.to_string());
        Ok(())
    }

    async fn wait_response_done(&self, _timeout: Duration) -> Result<(), SessionError> {
        Ok(())
    }

    async fn scrape_response(&self) -> Result<String, SessionError> {
        let mut st = self.state.lock().expect("session state");
        if !st.canned_replies.is_empty() {
            return Ok(st.canned_replies.remove(0));
        }
        Ok(st.submitted.last().cloned().unwrap_or_default())
    }

    async fn ensure_generation_stopped(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn clear_chat(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn ensure_temporary_chat(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn capture_diagnostics(&self, dir: &Path) -> Result<(), SessionError> {
        std::fs::write(dir.join("session.txt"), b"loopback session, no browser")
            .map_err(|e| SessionError::interaction(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_guard_marks_on_drop() {
        let liveness = ClientLiveness::new();
        {
            let _guard = LivenessGuard::arm(liveness.clone());
        }
        assert!(liveness.is_disconnected());
    }

    #[test]
    fn disarmed_guard_leaves_liveness_alone() {
        let liveness = ClientLiveness::new();
        {
            let mut guard = LivenessGuard::arm(liveness.clone());
            guard.disarm();
        }
        assert!(!liveness.is_disconnected());
    }

    #[tokio::test]
    async fn loopback_echoes_last_prompt() {
        let session = InMemorySession::default();
        session.submit_prompt("ping", &[]).await.unwrap();
        assert_eq!(session.scrape_response().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn canned_replies_win_over_echo() {
        let session = InMemorySession::default();
        session.push_reply("pong");
        session.submit_prompt("ping", &[]).await.unwrap();
        assert_eq!(session.scrape_response().await.unwrap(), "pong");
    }
}
