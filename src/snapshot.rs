//! Debug snapshots: when the pipeline fails with a server-side error, dump
//! whatever diagnostics the session can produce plus request metadata into
//! a timestamped directory. Capture is best-effort and never masks the
//! original error.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::GatewayError;
use crate::util::{unix_now, AppState};

const SNAPSHOT_ROOT: &str = "debug_snapshots";

fn error_kind(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::BadRequest { .. } => "bad_request",
        GatewayError::Unauthorized { .. } => "unauthorized",
        GatewayError::ModelSwitchFailed { .. } => "model_switch_failed",
        GatewayError::ClientDisconnected { .. } => "client_disconnected",
        GatewayError::UserCancelled { .. } => "user_cancelled",
        GatewayError::ServiceUnavailable { .. } => "service_unavailable",
        GatewayError::ProcessingTimeout { .. } => "processing_timeout",
        GatewayError::UpstreamError { .. } => "upstream_error",
        GatewayError::QuotaExceeded { .. } => "quota_exceeded",
        GatewayError::ServerError { .. } => "server_error",
    }
}

/// Capture for the error kinds that warrant one (500, 502, 422).
pub async fn maybe_capture(state: &Arc<AppState>, req_id: &str, stage: &str, err: &GatewayError) {
    let wanted = matches!(
        err,
        GatewayError::ServerError { .. }
            | GatewayError::UpstreamError { .. }
            | GatewayError::ModelSwitchFailed { .. }
    );
    if !wanted {
        return;
    }
    capture(state, req_id, stage, error_kind(err), &err.to_string()).await;
}

/// Unconditional named capture, for callers outside the pipeline's error
/// path (e.g. the post-stream quiesce).
pub async fn capture_named(state: &Arc<AppState>, req_id: &str, stage: &str, message: &str) {
    capture(state, req_id, stage, "ui_state", message).await;
}

async fn capture(state: &Arc<AppState>, req_id: &str, stage: &str, kind: &str, message: &str) {
    let dir = snapshot_dir(req_id, kind);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        warn!("[{req_id}] snapshot directory creation failed: {err}");
        return;
    }

    let meta = serde_json::json!({
        "req_id": req_id,
        "stage": stage,
        "error_kind": kind,
        "message": message,
        "captured_at": unix_now(),
        "model": state.current_model_id(),
    });
    if let Err(err) = std::fs::write(
        dir.join("meta.json"),
        serde_json::to_vec_pretty(&meta).unwrap_or_default(),
    ) {
        warn!("[{req_id}] snapshot metadata write failed: {err}");
    }

    // Screenshot, DOM, console/network logs: whatever the session can give.
    if let Err(err) = state.session.capture_diagnostics(&dir).await {
        warn!("[{req_id}] session diagnostics capture failed: {err}");
    }
    info!("[{req_id}] debug snapshot written to {}", dir.display());
}

fn snapshot_dir(req_id: &str, kind: &str) -> PathBuf {
    PathBuf::from(SNAPSHOT_ROOT).join(format!("{}_{kind}_{req_id}", unix_now()))
}
