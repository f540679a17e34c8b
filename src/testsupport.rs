//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::Error;
use crate::session::compress::Summarizer;
use crate::session::transport::{ByteStream, InferenceRequest, Transport};
use crate::session::tokens::Tokenizer;
use crate::session::{Message, Mode};
use crate::tools::Tool;
use crate::Result;

/// One SSE event carrying a content delta.
pub fn content_chunk(text: &str, finish_reason: Option<&str>) -> String {
    let payload = json!({
        "choices": [{"delta": {"content": text}, "finish_reason": finish_reason}]
    });
    format!("data: {payload}\n\n")
}

/// A whole SSE body: one delta per piece, then `[DONE]`.
pub fn sse_body(pieces: &[&str]) -> String {
    let mut body: String = pieces.iter().map(|p| content_chunk(p, None)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

/// Poll `condition` until it holds; panics after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn required_param_schema(field: &str) -> Value {
    let mut properties = serde_json::Map::new();
    properties.insert(field.to_string(), json!({"type": "string"}));
    json!({
        "type": "object",
        "properties": properties,
        "required": [field]
    })
}

/// One token per whitespace-separated word.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Tool with a canned outcome.
pub struct ScriptedTool {
    name: String,
    outcome: std::result::Result<String, String>,
    schema: Value,
}

impl ScriptedTool {
    pub fn ok(name: &str, result: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Ok(result.to_string()),
            schema: json!({"type": "object"}),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
            ..Self::ok(name, "")
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    fn parameters(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        self.outcome.clone().map_err(Error::ToolExecution)
    }
}

/// Tool that takes a long time; `started` flips once it runs.
pub struct SlowTool {
    name: String,
    delay: Duration,
    started: Arc<AtomicBool>,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> (Self, Arc<AtomicBool>) {
        let started = Arc::new(AtomicBool::new(false));
        let tool = Self {
            name: name.to_string(),
            delay,
            started: started.clone(),
        };
        (tool, started)
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "sleeps before answering"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _params: Value) -> Result<String> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok("finally".to_string())
    }
}

/// Summarizer that records what it was asked to summarize.
#[derive(Default)]
pub struct CountingSummarizer {
    calls: AtomicUsize,
    last_input_len: AtomicUsize,
    fail: bool,
}

impl CountingSummarizer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input_len(&self) -> usize {
        self.last_input_len.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_input_len.store(messages.len(), Ordering::SeqCst);
        if self.fail {
            return Err(Error::Transport("summarizer offline".to_string()));
        }
        Ok(format!("{} messages about things", messages.len()))
    }
}

/// Transport that plays back one scripted body per `open`.
pub struct ScriptedTransport {
    turns: Mutex<VecDeque<Vec<String>>>,
    requests: Mutex<Vec<InferenceRequest>>,
    summaries: Mutex<Vec<InferenceRequest>>,
    summary: Option<String>,
    backend_reachable: bool,
}

impl ScriptedTransport {
    /// Each turn is a list of raw chunks.
    pub fn new(turns: Vec<Vec<String>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
            summary: Some("summary".to_string()),
            backend_reachable: true,
        }
    }

    /// Each turn is a single content delta.
    pub fn from_texts(texts: &[String]) -> Self {
        Self::new(texts.iter().map(|t| vec![sse_body(&[t.as_str()])]).collect())
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    pub fn failing_summary(mut self) -> Self {
        self.summary = None;
        self
    }

    pub fn unreachable_backend(mut self) -> Self {
        self.backend_reachable = false;
        self
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn summaries(&self) -> Vec<InferenceRequest> {
        self.summaries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _mode: &Mode, request: &InferenceRequest) -> Result<ByteStream> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let turn = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| Error::Transport("no scripted turn left".to_string()))?;

        let chunks: Vec<Result<Vec<u8>>> = turn.into_iter().map(|c| Ok(c.into_bytes())).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn complete(&self, _mode: &Mode, request: &InferenceRequest) -> Result<String> {
        self.summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.summary
            .clone()
            .ok_or_else(|| Error::Transport("completion refused".to_string()))
    }

    fn backend_reachable(&self) -> bool {
        self.backend_reachable
    }
}

/// Transport whose single stream is fed by the test through a channel.
pub struct ChannelTransport {
    receiver: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
}

impl ChannelTransport {
    pub fn channel() -> (Self, UnboundedSender<Vec<u8>>) {
        let (tx, rx) = unbounded_channel();
        let transport = Self {
            receiver: Mutex::new(Some(rx)),
        };
        (transport, tx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&self, _mode: &Mode, _request: &InferenceRequest) -> Result<ByteStream> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Transport("channel already opened".to_string()))?;

        let bytes = stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        });
        Ok(Box::pin(bytes))
    }

    async fn complete(&self, _mode: &Mode, _request: &InferenceRequest) -> Result<String> {
        Err(Error::Transport("not supported".to_string()))
    }

    fn backend_reachable(&self) -> bool {
        false
    }
}
