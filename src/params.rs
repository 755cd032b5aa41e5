//! Process-wide cache of the UI's displayed generation parameters, plus the
//! reconciliation pass that brings the UI in line with a request.
//!
//! Invariant: the cache never claims a value the UI does not display. Every
//! write goes through set-then-read-back verification and a mismatch evicts
//! the entry.

use std::collections::BTreeSet;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::Config;
use crate::disconnect::DisconnectWatch;
use crate::error::GatewayError;
use crate::models::chat::ChatCompletionRequest;
use crate::session::UiSession;

pub const TEMPERATURE_EPSILON: f64 = 1e-3;
pub const TOP_P_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedParams {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u64>,
    pub stop_sequences: Option<BTreeSet<String>>,
    pub top_p: Option<f64>,
    /// Model the cached values were observed under. A different current
    /// model means every entry is stale.
    pub last_known_model_id: Option<String>,
}

pub struct ParamsCache {
    inner: Mutex<CachedParams>,
}

impl Default for ParamsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamsCache {
    pub fn new() -> Self {
        ParamsCache {
            inner: Mutex::new(CachedParams::default()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, CachedParams> {
        self.inner.lock().await
    }

    pub async fn snapshot(&self) -> CachedParams {
        self.inner.lock().await.clone()
    }

    /// Invalidate everything if the cache was populated under a different
    /// model. Called after model analysis and after an actual switch.
    pub async fn ensure_model(&self, model_id: &str) {
        let mut guard = self.inner.lock().await;
        let stale = guard
            .last_known_model_id
            .as_deref()
            .map(|known| known != model_id)
            .unwrap_or(true);
        if stale {
            debug!("parameter cache stale (model changed to {model_id}); invalidating");
            *guard = CachedParams {
                last_known_model_id: Some(model_id.to_string()),
                ..Default::default()
            };
        }
    }

    pub async fn invalidate(&self) {
        let mut guard = self.inner.lock().await;
        *guard = CachedParams::default();
    }
}

/// Bring every requested parameter in line with the UI, skipping entries the
/// cache already confirms. Individual parameter failures drop the cache
/// entry and continue; only a disconnect aborts the pass.
pub async fn reconcile_ui_parameters(
    req_id: &str,
    request: &ChatCompletionRequest,
    session: &dyn UiSession,
    cache: &ParamsCache,
    config: &Config,
    watch: &DisconnectWatch,
) -> Result<(), GatewayError> {
    if let Some(requested) = request.temperature {
        watch.check("Adjust temperature")?;
        let requested = requested.clamp(0.0, 2.0);
        let mut guard = cache.lock().await;
        let cached_hit = guard
            .temperature
            .map(|cached| (cached - requested).abs() < TEMPERATURE_EPSILON)
            .unwrap_or(false);
        if cached_hit {
            debug!("[{req_id}] temperature {requested} matches cache; skipping UI");
        } else {
            match session.set_temperature(requested).await {
                Ok(displayed) if (displayed - requested).abs() < TEMPERATURE_EPSILON => {
                    guard.temperature = Some(displayed);
                }
                Ok(displayed) => {
                    warn!(
                        "[{req_id}] temperature verify mismatch: wanted {requested}, UI shows {displayed}"
                    );
                    guard.temperature = None;
                }
                Err(err) => {
                    warn!("[{req_id}] temperature adjustment failed: {err}");
                    guard.temperature = None;
                }
            }
        }
    }

    if let Some(requested) = request.max_output_tokens {
        watch.check("Adjust max output tokens")?;
        let mut guard = cache.lock().await;
        if guard.max_output_tokens == Some(requested) {
            debug!("[{req_id}] max_output_tokens {requested} matches cache; skipping UI");
        } else {
            match session.set_max_output_tokens(requested).await {
                Ok(displayed) if displayed == requested => {
                    guard.max_output_tokens = Some(displayed);
                }
                Ok(displayed) => {
                    warn!(
                        "[{req_id}] max_output_tokens verify mismatch: wanted {requested}, UI shows {displayed}"
                    );
                    guard.max_output_tokens = None;
                }
                Err(err) => {
                    warn!("[{req_id}] max_output_tokens adjustment failed: {err}");
                    guard.max_output_tokens = None;
                }
            }
        }
    }

    let requested_stops: BTreeSet<String> = request.stop_list().into_iter().collect();
    if !requested_stops.is_empty() {
        watch.check("Adjust stop sequences")?;
        let mut guard = cache.lock().await;
        if guard.stop_sequences.as_ref() == Some(&requested_stops) {
            debug!("[{req_id}] stop sequences match cache; skipping UI");
        } else {
            match session.set_stop_sequences(&requested_stops).await {
                Ok(displayed) if displayed == requested_stops => {
                    guard.stop_sequences = Some(displayed);
                }
                Ok(_) => {
                    warn!("[{req_id}] stop sequence verify mismatch");
                    guard.stop_sequences = None;
                }
                Err(err) => {
                    warn!("[{req_id}] stop sequence adjustment failed: {err}");
                    guard.stop_sequences = None;
                }
            }
        }
    }

    if let Some(requested) = request.top_p {
        watch.check("Adjust top_p")?;
        let requested = requested.clamp(0.0, 1.0);
        let mut guard = cache.lock().await;
        let cached_hit = guard
            .top_p
            .map(|cached| (cached - requested).abs() < TOP_P_EPSILON)
            .unwrap_or(false);
        if cached_hit {
            debug!("[{req_id}] top_p {requested} matches cache; skipping UI");
        } else {
            match session.set_top_p(requested).await {
                Ok(displayed) if (displayed - requested).abs() < TOP_P_EPSILON => {
                    guard.top_p = Some(displayed);
                }
                Ok(displayed) => {
                    warn!("[{req_id}] top_p verify mismatch: wanted {requested}, UI shows {displayed}");
                    guard.top_p = None;
                }
                Err(err) => {
                    warn!("[{req_id}] top_p adjustment failed: {err}");
                    guard.top_p = None;
                }
            }
        }
    }

    // Thinking budget and feature toggles are uncached: the UI resets them
    // per conversation, so writing through every time is the safe choice.
    if let Some(effort) = request.reasoning_effort.as_deref() {
        watch.check("Adjust thinking budget")?;
        let budget = thinking_budget_for_effort(effort);
        if let Err(err) = session.set_thinking_budget(budget).await {
            warn!("[{req_id}] thinking budget adjustment failed: {err}");
        }
    }

    watch.check("Adjust feature toggles")?;
    if let Err(err) = session
        .set_feature_toggles(config.enable_url_context, config.enable_search)
        .await
    {
        warn!("[{req_id}] feature toggle adjustment failed: {err}");
    }

    Ok(())
}

/// Effort names map to rough budget sizes; unknown values disable the
/// budget control.
fn thinking_budget_for_effort(effort: &str) -> Option<u64> {
    match effort.to_ascii_lowercase().as_str() {
        "minimal" => Some(512),
        "low" => Some(2048),
        "medium" => Some(8192),
        "high" => Some(24576),
        _ => None,
    }
}
