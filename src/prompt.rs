//! Request validation, combined-prompt rendering and attachment handling.
//!
//! The provider UI takes one textarea of text, so the whole conversation
//! (system preamble, turns, tool catalogue, prior tool results) is rendered
//! into a single prompt string. Attachments are collected only from the most
//! recent user message (plus explicit top-level lists): `data:` URLs are
//! materialized into a per-request sandbox, `file://` URLs and existing
//! absolute paths pass through.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::error::{bad_request, GatewayError};
use crate::models::chat::{ChatCompletionRequest, Message, MessageContent};

/// Schema-level validation: B1/B2 boundaries.
pub fn validate_chat_request(messages: &[Message], req_id: &str) -> Result<(), GatewayError> {
    if messages.is_empty() {
        return Err(bad_request(req_id, "messages must not be empty"));
    }
    if messages.iter().all(|m| m.role == "system") {
        return Err(bad_request(
            req_id,
            "at least one non-system message is required",
        ));
    }
    Ok(())
}

/// Render the conversation into the single prompt submitted to the UI.
///
/// Only the first system message becomes the preamble; later ones are
/// dropped. Assistant tool calls and `tool` results are inlined as labelled
/// blocks so the model sees the full exchange.
pub fn prepare_combined_prompt(request: &ChatCompletionRequest, req_id: &str) -> String {
    let mut sections: Vec<String> = Vec::new();
    let mut system_used = false;

    for message in &request.messages {
        match message.role.as_str() {
            "system" => {
                if system_used {
                    debug!("[{req_id}] dropping extra system message");
                    continue;
                }
                system_used = true;
                let text = message.content_text();
                if !text.is_empty() {
                    sections.push(text);
                }
            }
            "tool" => {
                let id = message.tool_call_id.as_deref().unwrap_or("unknown");
                let text = message.content_text();
                sections.push(format!("Tool result (tool_call_id={id}):\n{text}"));
            }
            role => {
                let mut parts: Vec<String> = Vec::new();
                let text = message.content_text();
                if !text.is_empty() {
                    parts.push(text);
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        let args = pretty_args(&call.function.arguments);
                        parts.push(format!(
                            "Function call requested: {}\nArguments:\n{}",
                            call.function.name, args
                        ));
                    }
                }
                if !parts.is_empty() {
                    let label = message.name.as_deref().unwrap_or(role);
                    sections.push(format!("{label}: {}", parts.join("\n")));
                }
            }
        }
    }

    let mut prompt = sections.join("\n\n");

    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            let catalogue =
                serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
            prompt.push_str("\n\nAvailable tools:\n");
            prompt.push_str(&catalogue);
            prompt.push_str(
                "\nWhen a tool is needed, respond with a function call instead of prose.",
            );
            if let Some(name) = preferred_tool_name(request.tool_choice.as_ref()) {
                prompt.push_str(&format!("\nPrefer the function: {name}"));
            }
        }
    }

    prompt.trim().to_string()
}

fn pretty_args(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

/// `tool_choice` may be the function name itself or the OpenAI object form.
fn preferred_tool_name(choice: Option<&serde_json::Value>) -> Option<String> {
    match choice? {
        serde_json::Value::String(s) if s != "auto" && s != "none" && !s.is_empty() => {
            Some(s.clone())
        }
        serde_json::Value::Object(obj) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Per-request scratch directory for materialized `data:` URLs. Removed by
/// the worker's cleanup step.
pub struct UploadSandbox {
    dir: PathBuf,
}

impl UploadSandbox {
    pub fn create(root: &Path, req_id: &str) -> std::io::Result<Self> {
        let dir = root.join(req_id);
        std::fs::create_dir_all(&dir)?;
        Ok(UploadSandbox { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode a `data:` URL into a file inside the sandbox.
    pub fn materialize_data_url(&self, url: &str) -> Option<PathBuf> {
        let rest = url.strip_prefix("data:")?;
        let (meta, payload) = rest.split_once(',')?;
        let bytes = if meta.ends_with(";base64") {
            BASE64.decode(payload.trim()).ok()?
        } else {
            percent_decode(payload).into_bytes()
        };
        let ext = meta
            .split(';')
            .next()
            .and_then(|mime| mime.split('/').nth(1))
            .filter(|s| !s.is_empty() && s.len() <= 8)
            .unwrap_or("bin");
        let name = format!("{}.{ext}", uuid::Uuid::new_v4().simple());
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).ok()?;
        Some(path)
    }

    /// Remove the sandbox directory by request id. Used by cleanup, which
    /// runs even when the request never got as far as creating one.
    pub fn remove(root: &Path, req_id: &str) {
        let dir = root.join(req_id);
        if dir.is_dir() {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}

/// Collect attachments for submission. Source policy: the most recent user
/// message's attachment fields and content parts, plus the request's
/// top-level lists; accepted schemes are `data:`, `file://` and existing
/// absolute paths.
pub fn collect_attachments(
    request: &ChatCompletionRequest,
    sandbox: &UploadSandbox,
    req_id: &str,
) -> Vec<PathBuf> {
    let mut refs: Vec<String> = Vec::new();

    if let Some(latest_user) = request.messages.iter().rev().find(|m| m.role == "user") {
        for list in [
            &latest_user.attachments,
            &latest_user.images,
            &latest_user.files,
            &latest_user.media,
        ]
        .into_iter()
        .flatten()
        {
            for item in list {
                if let Some(url) = item.as_str() {
                    refs.push(url.to_string());
                }
            }
        }
        if let Some(MessageContent::Parts(parts)) = &latest_user.content {
            for part in parts {
                if let Some(image) = &part.image_url {
                    refs.push(image.url.clone());
                }
            }
        }
    }

    for list in [&request.attachments, &request.files].into_iter().flatten() {
        for item in list {
            if let Some(url) = item.as_str() {
                refs.push(url.to_string());
            }
        }
    }

    let mut out = Vec::new();
    for raw in refs {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if raw.starts_with("data:") {
            match sandbox.materialize_data_url(raw) {
                Some(path) => out.push(path),
                None => warn!("[{req_id}] could not materialize data: URL attachment"),
            }
        } else if let Some(path) = raw.strip_prefix("file://") {
            let decoded = percent_decode(path);
            let path = PathBuf::from(decoded);
            if path.exists() {
                out.push(path);
            }
        } else {
            let path = Path::new(raw);
            if path.is_absolute() && path.exists() {
                out.push(path.to_path_buf());
            }
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
