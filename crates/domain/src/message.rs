use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Internal tool call format (provider-agnostic).
/// Both the native function-call path and the XML dialect parser
/// produce this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Status events written into the thread for the client stream.
    Status,
    /// Marker carrying image attachments resolved out-of-band.
    ImageContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A message in a thread. Append-only; the only edit path is the
/// `compressed_content` metadata field pointing at a shorter replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// False for status/image-context records that never reach the LLM.
    #[serde(default = "default_true")]
    pub is_llm_message: bool,
}

fn default_true() -> bool {
    true
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn new(thread_id: impl Into<String>, role: Role, content: MessageContent) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            role,
            content,
            metadata: None,
            created_at: Utc::now(),
            is_llm_message: !matches!(role, Role::Status | Role::ImageContext),
        }
    }

    pub fn system(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Assistant message carrying text plus tool-use parts, mirroring what
    /// the model emitted in one turn.
    pub fn assistant_with_tool_calls(
        thread_id: impl Into<String>,
        text: &str,
        tool_calls: &[ToolCall],
    ) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        for tc in tool_calls {
            parts.push(ContentPart::ToolUse {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                input: tc.arguments.clone(),
            });
        }
        let mut msg = Self::new(thread_id, Role::Assistant, MessageContent::Parts(parts));
        if !tool_calls.is_empty() {
            msg.metadata = Some(serde_json::json!({
                "tool_calls": tool_calls,
            }));
        }
        msg
    }

    pub fn tool_result(
        thread_id: impl Into<String>,
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            thread_id,
            Role::Tool,
            MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }]),
        )
    }

    /// Tool-call ids referenced by this message's `tool_use` parts.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => Vec::new(),
        }
    }
}

impl MessageContent {
    /// Extract and join all text content, returning an owned String.
    /// Non-text parts (ToolUse, ToolResult) are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_tool_calls_builds_parts_and_metadata() {
        let calls = vec![ToolCall {
            call_id: "tc_1".into(),
            tool_name: "search".into(),
            arguments: serde_json::json!({"query": "x"}),
        }];
        let msg = Message::assistant_with_tool_calls("t1", "thinking", &calls);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.tool_call_ids(), vec!["tc_1"]);
        assert!(msg.metadata.is_some());
        match &msg.content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected Parts content"),
        }
    }

    #[test]
    fn status_messages_are_not_llm_messages() {
        let msg = Message::new("t1", Role::Status, MessageContent::Text("{}".into()));
        assert!(!msg.is_llm_message);
        let msg = Message::user("t1", "hello");
        assert!(msg.is_llm_message);
    }

    #[test]
    fn extract_all_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "one".into() },
            ContentPart::ToolUse {
                id: "c".into(),
                name: "exec".into(),
                input: serde_json::json!({}),
            },
            ContentPart::Text { text: "two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "one\ntwo");
    }

    #[test]
    fn roles_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&Role::ImageContext).unwrap(),
            "\"image_context\""
        );
        assert_eq!(serde_json::to_string(&Role::Status).unwrap(), "\"status\"");
    }
}
