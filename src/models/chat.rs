//! Request/response data model for the OpenAI Chat Completions surface.
//!
//! Only the fields the gateway acts on are modelled; unknown fields are
//! ignored on input and never emitted on output.

use serde::{Deserialize, Serialize};

/// Inbound body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    /// `max_tokens` is the legacy alias still sent by most clients.
    #[serde(alias = "max_tokens")]
    pub max_output_tokens: Option<u64>,
    pub top_p: Option<f64>,
    pub stop: Option<StopSequences>,
    pub tools: Option<Vec<serde_json::Value>>,
    pub tool_choice: Option<serde_json::Value>,
    /// Per-request MCP endpoint for runtime tool registration.
    pub mcp_endpoint: Option<String>,
    /// Top-level attachment lists, merged with per-message ones.
    pub attachments: Option<Vec<AttachmentRef>>,
    pub files: Option<Vec<AttachmentRef>>,
    pub seed: Option<i64>,
    pub response_format: Option<serde_json::Value>,
    /// Mapped onto the UI thinking-budget control where supported.
    pub reasoning_effort: Option<String>,
}

impl ChatCompletionRequest {
    /// Requested stop sequences as a flat list, whatever the wire shape was.
    pub fn stop_list(&self) -> Vec<String> {
        match &self.stop {
            None => Vec::new(),
            Some(StopSequences::One(s)) => vec![s.clone()],
            Some(StopSequences::Many(v)) => v.clone(),
        }
    }
}

/// `stop` accepts either a single string or a list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: Option<MessageContent>,
    pub name: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    // Attachment fields accepted on any message; only the most recent user
    // message's entries are actually collected.
    pub attachments: Option<Vec<AttachmentRef>>,
    pub images: Option<Vec<AttachmentRef>>,
    pub files: Option<Vec<AttachmentRef>>,
    pub media: Option<Vec<AttachmentRef>>,
}

impl Message {
    pub fn text(role: &str, content: &str) -> Self {
        Message {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            attachments: None,
            images: None,
            files: None,
            media: None,
        }
    }

    /// Flatten the content to plain text; multimodal parts contribute their
    /// `text` fields joined by newlines.
    pub fn content_text(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => {
                let mut pieces = Vec::new();
                for part in parts {
                    if let Some(text) = &part.text {
                        if !text.is_empty() {
                            pieces.push(text.clone());
                        }
                    }
                }
                pieces.join("\n")
            }
        }
    }
}

/// Message content: plain string or multimodal part list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
    pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Attachment reference: a bare URL/path string or `{url}`/`{path}` object.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttachmentRef {
    Url(String),
    Object {
        url: Option<String>,
        path: Option<String>,
    },
}

impl AttachmentRef {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttachmentRef::Url(s) => Some(s.as_str()),
            AttachmentRef::Object { url, path } => {
                url.as_deref().or(path.as_deref()).filter(|s| !s.is_empty())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, as on the OpenAI wire.
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_max_tokens_alias() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m1",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 128
        }))
        .expect("request parses");
        assert_eq!(req.max_output_tokens, Some(128));
        assert!(!req.stream);
    }

    #[test]
    fn stop_accepts_string_or_list() {
        let one: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [], "stop": "END"
        }))
        .unwrap();
        assert_eq!(one.stop_list(), vec!["END".to_string()]);

        let many: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [], "stop": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(many.stop_list(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn multimodal_content_flattens_text_parts() {
        let msg: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
                {"type": "text", "text": "here"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.content_text(), "look\nhere");
    }

    #[test]
    fn attachment_ref_shapes() {
        let bare: AttachmentRef = serde_json::from_value(json!("file:///tmp/a.png")).unwrap();
        assert_eq!(bare.as_str(), Some("file:///tmp/a.png"));
        let obj: AttachmentRef =
            serde_json::from_value(json!({"url": "data:text/plain;base64,aGk="})).unwrap();
        assert_eq!(obj.as_str(), Some("data:text/plain;base64,aGk="));
    }
}
