//! Transport abstraction layer.
//!
//! This module provides:
//! - [`Transport`] trait: opens a token stream for a resolved [`Mode`]
//! - [`InferenceRequest`]: the OpenAI-style chat body sent to every endpoint
//! - [`HttpTransport`]: the `reqwest` implementation
//!
//! # Adding a New Transport
//!
//! 1. Create a new file (e.g., `websocket.rs`)
//! 2. Implement `Transport`
//! 3. Hand it to [`SessionOrchestrator`](super::SessionOrchestrator)

pub mod http;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;

use crate::Result;

use super::connection::Mode;
use super::message::{Message, MessageStatus};

pub use http::HttpTransport;

/// Raw bytes as they come off the wire, in arbitrary chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A message in wire format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role.as_str(),
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

/// Chat request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
}

impl InferenceRequest {
    /// Build a streaming request. Messages still streaming are left out.
    pub fn new(model: Option<String>, messages: &[Message]) -> Self {
        Self {
            model,
            messages: messages
                .iter()
                .filter(|m| m.status != MessageStatus::Streaming)
                .map(WireMessage::from)
                .collect(),
            stream: true,
        }
    }

    pub fn non_streaming(mut self) -> Self {
        self.stream = false;
        self
    }
}

/// Transport trait - opens connections for a resolved mode.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a streaming completion.
    async fn open(&self, mode: &Mode, request: &InferenceRequest) -> Result<ByteStream>;

    /// Run a non-streaming completion and return the text.
    async fn complete(&self, mode: &Mode, request: &InferenceRequest) -> Result<String>;

    /// Whether the backend fallback can be used right now.
    fn backend_reachable(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_skips_streaming_messages() {
        let messages = vec![
            Message::system("c", "be brief"),
            Message::user("c", "hi"),
            Message::streaming("c"),
        ];
        let request = InferenceRequest::new(Some("m".into()), &messages);
        assert_eq!(request.messages.len(), 2);
        assert!(request.stream);

        let json = serde_json::to_value(&request.non_streaming()).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert!(json["messages"][1].get("tool_call_id").is_none());
    }

    #[test]
    fn test_tool_messages_carry_call_id() {
        let msg = Message::tool_result("c", "call_9", "done");
        let wire = WireMessage::from(&msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_9"));
    }
}
