//! Message types for conversations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Lifecycle of a message. Everything except `Streaming` is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Cancelled,
    Failed,
}

impl MessageStatus {
    #[inline]
    pub fn is_frozen(&self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,

    /// Tool call ID (for tool responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls made by assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,

    /// Set on the synthetic message produced by history compression.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,

    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(conversation_id: &str, role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content,
            tool_call_id: None,
            tool_calls: None,
            summary: false,
            status: MessageStatus::Complete,
            created_at: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::System, content.into())
    }

    /// Create a user message
    pub fn user(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content.into())
    }

    /// Create a finished assistant message
    pub fn assistant(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, content.into())
    }

    /// Create an empty assistant message that is still receiving deltas
    pub fn streaming(conversation_id: &str) -> Self {
        let mut msg = Self::new(conversation_id, Role::Assistant, String::new());
        msg.status = MessageStatus::Streaming;
        msg
    }

    /// Create the synthetic summary that replaces compressed history
    pub fn summary(conversation_id: &str, content: impl Into<String>) -> Self {
        let mut msg = Self::new(conversation_id, Role::Assistant, content.into());
        msg.summary = true;
        msg
    }

    /// Create a tool result message
    pub fn tool_result(conversation_id: &str, call_id: impl Into<String>, result: impl Into<String>) -> Self {
        let mut msg = Self::new(conversation_id, Role::Tool, result.into());
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    /// Append a streamed delta. Frozen messages ignore further deltas.
    pub fn append_delta(&mut self, delta: &str) -> bool {
        if self.status.is_frozen() {
            return false;
        }
        self.content.push_str(delta);
        true
    }

    /// Freeze the message with a terminal status.
    pub fn freeze(&mut self, status: MessageStatus) {
        if !self.status.is_frozen() {
            self.status = status;
        }
    }

    /// Record the tool calls this turn asked for. Content and status are
    /// left untouched, so a frozen turn can still track its calls.
    pub fn set_tool_calls(&mut self, calls: Vec<ToolCallRequest>) {
        self.tool_calls = Some(calls);
    }

    /// Whether this message is the pinned system prompt or memory block.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.role == Role::System
    }

    /// Whether this message carries a request with the given call id.
    pub fn has_tool_call(&self, call_id: &str) -> bool {
        self.tool_calls
            .as_ref()
            .is_some_and(|calls| calls.iter().any(|c| c.id == call_id))
    }
}

/// Execution status of a tool call request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Executing,
    Succeeded,
    Failed,
}

/// A tool call request parsed from model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub server_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub status: ToolCallStatus,
}

impl ToolCallRequest {
    pub fn new(server_id: impl Into<String>, tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            server_id: server_id.into(),
            tool_name: tool_name.into(),
            parameters,
            status: ToolCallStatus::Pending,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
