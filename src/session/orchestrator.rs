//! Session orchestrator, the engine's public face.
//!
//! One orchestrator serves every conversation; state is keyed by
//! conversation id. Each send:
//!
//! 1. snapshots the connection settings and resolves a [`Mode`]
//! 2. compresses history when the budget is over threshold
//! 3. streams the model turn into an assistant message
//! 4. runs the tool loop, re-entering step 1 with tool results appended
//!
//! Locks are never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::memory::{InMemoryStore, MemoryStore};
use crate::store::{ConversationStore, InMemoryConversationStore};
use crate::tools::ToolExecutor;
use crate::Result;

use super::compress::{
    transcript, CompressionPlan, CompressionStrategy, ContextCompressor, Summarizer,
};
use super::connection::{resolve_mode, ConnectionSettings, Mode};
use super::interpreter::{Interpretation, ToolCallInterpreter};
use super::message::{Message, MessageStatus, ToolCallRequest};
use super::stream::{decode_stream, StreamEvent};
use super::tokens::{
    defaults, tail_to_budget, ContextBudget, HeuristicTokenizer, TokenBudgetTracker, Tokenizer,
};
use super::transport::{InferenceRequest, Transport};

/// Compressed history aims for this share of the trigger threshold.
const COMPRESSION_TARGET_RATIO: f64 = 0.75;

/// Cap on the transcript sent for summarization; the newest part is kept.
const SUMMARY_INPUT_TOKENS: usize = 6000;

const SUMMARY_PROMPT: &str = "Summarize the conversation below so it can replace the original \
messages. Keep facts, decisions, open questions and tool results that later turns may rely on. \
Reply with the summary only.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Be concise and accurate.";

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: Option<String>,
    pub system_prompt: String,
    pub max_iterations: usize,
    pub context_limit_tokens: usize,
    /// Fraction of the limit that triggers compression.
    pub compression_threshold: f64,
    pub compression_strategy: CompressionStrategy,
    pub preserve_last_n: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: 10,
            context_limit_tokens: defaults::CONTEXT_LIMIT,
            compression_threshold: defaults::COMPRESSION_THRESHOLD,
            compression_strategy: CompressionStrategy::default(),
            preserve_last_n: 6,
        }
    }
}

/// How a send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Completed,
    Cancelled,
    StreamFailed(String),
    MaxIterationsExceeded,
}

/// Result of [`SessionOrchestrator::send`].
#[derive(Debug, Clone)]
pub struct SendReport {
    pub mode: Mode,
    /// Model turns taken.
    pub iterations: usize,
    pub status: SendStatus,
    /// The last assistant message.
    pub message: Message,
}

/// Progress notifications for a UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ModeResolved { conversation_id: String, mode: Mode },
    Delta { conversation_id: String, text: String },
    Compressed { conversation_id: String, strategy: CompressionStrategy, removed: usize },
    ToolCall { conversation_id: String, request: ToolCallRequest },
    ToolResult { conversation_id: String, message: Message },
    TurnFinished { conversation_id: String, status: SendStatus },
}

enum TurnEnd {
    /// The turn, already frozen as complete and persisted.
    Complete(Message),
    Cancelled,
    Failed(String),
}

struct Conversation {
    messages: Vec<Message>,
    abort: Option<CancellationToken>,
    mode: Option<Mode>,
    budget: TokenBudgetTracker,
    system_text: String,
    memory_text: String,
}

/// Asks the inference backend for a summary with a non-streaming request.
struct BackendSummarizer<'a> {
    transport: &'a dyn Transport,
    mode: &'a Mode,
    model: Option<String>,
}

#[async_trait]
impl Summarizer for BackendSummarizer<'_> {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let conversation_id = messages.first().map_or("", |m| m.conversation_id.as_str());
        let text = transcript(messages);
        let prompt = [
            Message::system(conversation_id, SUMMARY_PROMPT),
            Message::user(conversation_id, tail_to_budget(&text, SUMMARY_INPUT_TOKENS)),
        ];
        let request = InferenceRequest::new(self.model.clone(), &prompt).non_streaming();
        self.transport.complete(self.mode, &request).await
    }
}

pub struct SessionOrchestrator {
    settings: Arc<RwLock<ConnectionSettings>>,
    transport: Arc<dyn Transport>,
    tools: Arc<dyn ToolExecutor>,
    tokenizer: Arc<dyn Tokenizer>,
    memory: Arc<dyn MemoryStore>,
    store: Arc<dyn ConversationStore>,
    config: SessionConfig,
    conversations: Mutex<HashMap<String, Conversation>>,
    active: Mutex<Option<String>>,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl SessionOrchestrator {
    pub fn new(
        settings: Arc<RwLock<ConnectionSettings>>,
        transport: Arc<dyn Transport>,
        tools: Arc<dyn ToolExecutor>,
        config: SessionConfig,
    ) -> Self {
        Self {
            settings,
            transport,
            tools,
            tokenizer: Arc::new(HeuristicTokenizer),
            memory: Arc::new(InMemoryStore::new()),
            store: Arc::new(InMemoryConversationStore::new()),
            config,
            conversations: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            events: None,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shared settings; edits apply to the next send only.
    pub fn settings(&self) -> Arc<RwLock<ConnectionSettings>> {
        self.settings.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn persist(&self, message: &Message) {
        if let Err(e) = self.store.append_message(message) {
            warn!("Failed to persist message {}: {}", message.id, e);
        }
    }

    fn load_history(&self, conversation_id: &str) -> Vec<Message> {
        let messages = self.store.load_history(conversation_id).unwrap_or_else(|e| {
            warn!("Failed to load history for {}: {}", conversation_id, e);
            Vec::new()
        });
        debug!("Loaded {} messages for {}", messages.len(), conversation_id);
        messages
    }

    fn new_conversation(&self, messages: Vec<Message>) -> Conversation {
        let mut budget = TokenBudgetTracker::new(self.tokenizer.clone(), self.config.context_limit_tokens);
        budget.set_history(&messages);
        Conversation {
            messages,
            abort: None,
            mode: None,
            budget,
            system_text: String::new(),
            memory_text: String::new(),
        }
    }

    /// Run `f` on a conversation, loading its history first if needed.
    /// The store is read without holding the conversations lock.
    fn with_conversation<R>(&self, conversation_id: &str, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let known = self.conversations().contains_key(conversation_id);
        let loaded = (!known).then(|| self.load_history(conversation_id));

        let mut conversations = self.conversations();
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| self.new_conversation(loaded.unwrap_or_default()));
        f(conversation)
    }

    /// Load a conversation's history if it is not in memory yet.
    pub fn open_conversation(&self, conversation_id: &str) -> usize {
        self.with_conversation(conversation_id, |c| c.messages.len())
    }

    /// Make `conversation_id` active, cancelling the previous one's stream.
    pub fn switch_to(&self, conversation_id: &str) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(conversation_id.to_string());

        if let Some(previous) = previous.filter(|p| p != conversation_id) {
            self.cancel(&previous);
        }
        self.open_conversation(conversation_id);
    }

    pub fn active(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Abort the in-flight send of a conversation. Partial content is kept
    /// and frozen as `cancelled`. Returns false if nothing was in flight.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let mut conversations = self.conversations();
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return false;
        };
        let Some(token) = conversation.abort.as_ref() else {
            return false;
        };

        token.cancel();
        for message in conversation
            .messages
            .iter_mut()
            .filter(|m| m.status == MessageStatus::Streaming)
        {
            message.freeze(MessageStatus::Cancelled);
        }
        info!("Cancelled in-flight send for {}", conversation_id);
        true
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn budget(&self, conversation_id: &str) -> Option<ContextBudget> {
        self.conversations().get(conversation_id).map(|c| c.budget.budget())
    }

    pub fn mode(&self, conversation_id: &str) -> Option<Mode> {
        self.conversations().get(conversation_id).and_then(|c| c.mode.clone())
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.conversations()
            .get(conversation_id)
            .is_some_and(|c| c.abort.is_some())
    }

    /// Send a user message and drive the conversation until the model
    /// stops asking for tools.
    pub async fn send(&self, conversation_id: &str, content: &str) -> Result<SendReport> {
        let cancel = self.begin_send(conversation_id)?;
        let result = self.run_send(conversation_id, content, &cancel).await;
        self.with_conversation(conversation_id, |c| c.abort = None);

        match &result {
            Ok(report) => self.emit(SessionEvent::TurnFinished {
                conversation_id: conversation_id.to_string(),
                status: report.status.clone(),
            }),
            Err(e) if e.is_fatal_for_send() => error!("Send on {} aborted: {}", conversation_id, e),
            Err(e) => warn!("Send on {} failed: {}", conversation_id, e),
        }
        result
    }

    fn begin_send(&self, conversation_id: &str) -> Result<CancellationToken> {
        self.with_conversation(conversation_id, |c| {
            if c.abort.is_some() {
                return Err(Error::StreamInFlight(conversation_id.to_string()));
            }
            let token = CancellationToken::new();
            c.abort = Some(token.clone());
            Ok(token)
        })
    }

    async fn run_send(&self, conversation_id: &str, content: &str, cancel: &CancellationToken) -> Result<SendReport> {
        // Nothing is recorded when no endpoint can take the send.
        let mut mode = self.resolve(conversation_id)?;
        self.append(conversation_id, Message::user(conversation_id, content));

        let mut interpreter = ToolCallInterpreter::new(self.config.max_iterations);
        loop {
            let iteration = interpreter.begin_turn()?;
            if iteration > 1 {
                mode = self.resolve(conversation_id)?;
            }

            self.refresh_context(conversation_id);
            self.maybe_compress(conversation_id, &mode).await?;
            let request = self.build_request(conversation_id);

            let (message_id, end) = self.stream_turn(conversation_id, &mode, &request, cancel).await?;
            let report = |status: SendStatus, message: Message| SendReport {
                mode: mode.clone(),
                iterations: iteration,
                status,
                message,
            };

            let turn = match end {
                TurnEnd::Complete(turn) => turn,
                TurnEnd::Cancelled => {
                    let message = self.finalize(conversation_id, &message_id, MessageStatus::Cancelled)?;
                    return Ok(report(SendStatus::Cancelled, message));
                }
                TurnEnd::Failed(reason) => {
                    let message = self.finalize(conversation_id, &message_id, MessageStatus::Failed)?;
                    return Ok(report(SendStatus::StreamFailed(reason), message));
                }
            };

            match interpreter.interpret(&turn.content)? {
                Interpretation::Resolved => return Ok(report(SendStatus::Completed, turn)),
                Interpretation::Exhausted(calls) => {
                    warn!(
                        "Conversation {} hit the tool iteration limit ({}); {} call(s) not run",
                        conversation_id,
                        iteration,
                        calls.len()
                    );
                    let message = self.record_tool_calls(conversation_id, &message_id, &calls)?;
                    return Ok(report(SendStatus::MaxIterationsExceeded, message));
                }
                Interpretation::Execute(mut calls) => {
                    self.record_tool_calls(conversation_id, &message_id, &calls)?;
                    for call in &calls {
                        self.emit(SessionEvent::ToolCall {
                            conversation_id: conversation_id.to_string(),
                            request: call.clone(),
                        });
                    }

                    let executed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        results = interpreter.execute(conversation_id, &mut calls, self.tools.as_ref()) => Some(results),
                    };
                    let message = self.record_tool_calls(conversation_id, &message_id, &calls)?;
                    let Some(results) = executed else {
                        info!("Tool execution for {} cancelled", conversation_id);
                        return Ok(report(SendStatus::Cancelled, message));
                    };
                    let results = results?;
                    if cancel.is_cancelled() {
                        return Ok(report(SendStatus::Cancelled, message));
                    }

                    for result in results {
                        self.emit(SessionEvent::ToolResult {
                            conversation_id: conversation_id.to_string(),
                            message: result.clone(),
                        });
                        self.append(conversation_id, result);
                    }
                    interpreter.continue_loop()?;
                }
            }
        }
    }

    /// Resolve the mode from a snapshot of the settings.
    fn resolve(&self, conversation_id: &str) -> Result<Mode> {
        let snapshot = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mode = resolve_mode(
            &snapshot.connections,
            snapshot.offline_mode,
            self.transport.backend_reachable(),
        );

        self.with_conversation(conversation_id, |c| c.mode = Some(mode.clone()));
        self.emit(SessionEvent::ModeResolved {
            conversation_id: conversation_id.to_string(),
            mode: mode.clone(),
        });

        if mode == Mode::Unavailable {
            return Err(Error::ConnectionUnavailable);
        }
        info!("Conversation {} using {}", conversation_id, mode.label());
        Ok(mode)
    }

    fn append(&self, conversation_id: &str, message: Message) {
        self.with_conversation(conversation_id, |c| {
            c.budget.push_message(&message);
            c.messages.push(message.clone());
        });
        if message.status.is_frozen() {
            self.persist(&message);
        }
    }

    /// System prompt plus the tool catalogue and call grammar.
    fn system_text(&self) -> String {
        let definitions = self.tools.definitions();
        let mut text = self.config.system_prompt.clone();
        if definitions.is_empty() {
            return text;
        }

        text.push_str(
            "\n\n# Tools\n\nTo call a tool, reply with\n\
             <tool_call name=\"TOOL\" server=\"SERVER\">{JSON parameters}</tool_call>\n\
             and wait for the result before answering.\n\n",
        );
        for d in definitions {
            text.push_str(&format!(
                "- {}/{}: {}\n  parameters: {}\n",
                d.server_id, d.name, d.description, d.parameters
            ));
        }
        text
    }

    fn refresh_context(&self, conversation_id: &str) {
        let memory = self.memory.get_context().unwrap_or_else(|e| {
            warn!("Memory unavailable: {}", e);
            String::new()
        });
        let system = self.system_text();

        self.with_conversation(conversation_id, |c| {
            c.budget.set_system_prompt(&system);
            c.budget.set_memory(&memory);
            c.system_text = system;
            c.memory_text = memory;
            c.budget.log();
        });
    }

    async fn maybe_compress(&self, conversation_id: &str, mode: &Mode) -> Result<()> {
        let threshold = self.config.compression_threshold;
        let pending = self.with_conversation(conversation_id, |c| {
            if !c.budget.over_threshold(threshold) {
                return None;
            }
            info!(
                "Context for {} at {:.0}%, compressing",
                conversation_id,
                c.budget.used_fraction() * 100.0
            );
            Some((
                c.messages.clone(),
                c.budget.history_allowance(threshold * COMPRESSION_TARGET_RATIO),
            ))
        });
        let Some((history, allowance)) = pending else {
            return Ok(());
        };

        let plan = CompressionPlan::new(self.config.compression_strategy, self.config.preserve_last_n.max(1));
        let compressor = ContextCompressor::new(self.tokenizer.clone());
        let summarizer = BackendSummarizer {
            transport: self.transport.as_ref(),
            mode,
            model: self.config.model.clone(),
        };

        let compressed = match compressor.compress(&history, &plan, allowance, &summarizer).await {
            Ok(compressed) => compressed,
            Err(e @ Error::CompressionInvariant(_)) => return Err(e),
            Err(e) if plan.strategy != CompressionStrategy::Truncate => {
                warn!("Summary failed ({}), falling back to truncation", e);
                let fallback = CompressionPlan::new(CompressionStrategy::Truncate, plan.preserve_last_n);
                compressor.compress(&history, &fallback, allowance, &summarizer).await?
            }
            Err(e) => return Err(e),
        };

        if !compressed.changed() {
            return Ok(());
        }

        self.with_conversation(conversation_id, |c| {
            c.messages = compressed.messages;
            c.budget.set_history(&c.messages);
        });
        self.emit(SessionEvent::Compressed {
            conversation_id: conversation_id.to_string(),
            strategy: compressed.plan.strategy,
            removed: compressed.removed,
        });
        Ok(())
    }

    fn build_request(&self, conversation_id: &str) -> InferenceRequest {
        self.with_conversation(conversation_id, |c| {
            let mut system = c.system_text.clone();
            if !c.memory_text.is_empty() {
                system.push_str("\n\n# Memory\n\n");
                system.push_str(&c.memory_text);
            }

            let mut messages = Vec::with_capacity(c.messages.len() + 1);
            messages.push(Message::system(conversation_id, system));
            messages.extend(
                c.messages
                    .iter()
                    .filter(|m| m.status != MessageStatus::Failed)
                    .cloned(),
            );
            InferenceRequest::new(self.config.model.clone(), &messages)
        })
    }

    /// Stream one model turn into a new assistant message.
    async fn stream_turn(
        &self,
        conversation_id: &str,
        mode: &Mode,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, TurnEnd)> {
        let message = Message::streaming(conversation_id);
        let message_id = message.id.clone();
        self.append(conversation_id, message);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.transport.open(mode, request) => Some(opened),
        };
        let bytes = match opened {
            None => return Ok((message_id, TurnEnd::Cancelled)),
            Some(Err(e)) => {
                error!("Failed to open stream for {}: {}", conversation_id, e);
                self.finalize(conversation_id, &message_id, MessageStatus::Failed)?;
                return Err(e);
            }
            Some(Ok(bytes)) => bytes,
        };

        let mut events = Box::pin(decode_stream(bytes, cancel.clone()));
        let mut fragments = String::new();
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if !self.apply_event(conversation_id, &message_id, &event, cancel) {
                        break;
                    }
                    if let Some(fragment) = event.tool_call_fragment {
                        fragments.push_str(&fragment);
                    }
                    if let Some(reason) = event.finish_reason {
                        debug!("Turn finished: {}", reason);
                    }
                }
                Err(Error::Decode(reason)) => {
                    warn!("Stream for {} failed to decode: {}", conversation_id, reason);
                    return Ok((message_id, TurnEnd::Failed(reason)));
                }
                Err(e) => {
                    error!("Stream for {} broke: {}", conversation_id, e);
                    self.finalize(conversation_id, &message_id, MessageStatus::Failed)?;
                    return Err(e);
                }
            }
        }
        drop(events);

        if cancel.is_cancelled() {
            return Ok((message_id, TurnEnd::Cancelled));
        }
        match self.seal_content(conversation_id, &message_id, &fragments) {
            Some(turn) => {
                self.persist(&turn);
                Ok((message_id, TurnEnd::Complete(turn)))
            }
            None => Ok((message_id, TurnEnd::Cancelled)),
        }
    }

    /// Apply one event to the in-flight message. False once the message
    /// stopped accepting deltas.
    fn apply_event(
        &self,
        conversation_id: &str,
        message_id: &str,
        event: &StreamEvent,
        cancel: &CancellationToken,
    ) -> bool {
        let applied = self.with_conversation(conversation_id, |c| {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(delta) = event.delta_content.as_deref().filter(|d| !d.is_empty()) else {
                return true;
            };
            let Some(message) = c.messages.iter_mut().rev().find(|m| m.id == message_id) else {
                return false;
            };
            if !message.append_delta(delta) {
                return false;
            }
            c.budget.update_message(message);
            true
        });

        if applied {
            if let Some(delta) = event.delta_content.as_ref().filter(|d| !d.is_empty()) {
                self.emit(SessionEvent::Delta {
                    conversation_id: conversation_id.to_string(),
                    text: delta.clone(),
                });
            }
        }
        applied
    }

    /// Fold streamed tool-call fragments into the content and freeze the
    /// turn as complete. `None` if a cancel froze it first.
    fn seal_content(&self, conversation_id: &str, message_id: &str, fragments: &str) -> Option<Message> {
        self.with_conversation(conversation_id, |c| {
            let message = c.messages.iter_mut().rev().find(|m| m.id == message_id)?;
            if message.status.is_frozen() {
                return None;
            }
            if !fragments.is_empty() {
                if !message.content.is_empty() {
                    message.append_delta("\n");
                }
                message.append_delta(fragments);
                c.budget.update_message(message);
            }
            message.freeze(MessageStatus::Complete);
            debug!("Message {} finalized as {:?}", message.id, message.status);
            Some(message.clone())
        })
    }

    /// Attach the turn's tool calls with their current statuses and
    /// persist. The turn's content and status are not touched.
    fn record_tool_calls(
        &self,
        conversation_id: &str,
        message_id: &str,
        calls: &[ToolCallRequest],
    ) -> Result<Message> {
        let message = self.with_conversation(conversation_id, |c| {
            let message = c.messages.iter_mut().rev().find(|m| m.id == message_id)?;
            message.set_tool_calls(calls.to_vec());
            Some(message.clone())
        });

        let message = message.ok_or_else(|| {
            Error::InvalidState(format!("message {message_id} vanished from {conversation_id}"))
        })?;
        self.persist(&message);
        Ok(message)
    }

    /// Freeze a message (a no-op if a cancel already froze it) and persist it.
    /// A failed message is recounted, so the budget drops it.
    fn finalize(&self, conversation_id: &str, message_id: &str, status: MessageStatus) -> Result<Message> {
        let message = self.with_conversation(conversation_id, |c| {
            let message = c.messages.iter_mut().rev().find(|m| m.id == message_id)?;
            message.freeze(status);
            c.budget.update_message(message);
            Some(message.clone())
        });

        let message = message.ok_or_else(|| {
            Error::InvalidState(format!("message {message_id} vanished from {conversation_id}"))
        })?;
        debug!("Message {} finalized as {:?}", message.id, message.status);
        self.persist(&message);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::ConnectionDescriptor;
    use crate::session::message::{Role, ToolCallStatus};
    use crate::session::tokens::estimate_tokens;
    use crate::testsupport::{
        content_chunk, required_param_schema, sse_body, wait_until, ChannelTransport, ScriptedTool,
        ScriptedTransport, SlowTool, WordTokenizer,
    };
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::Duration;
    use crate::session::tokens::BudgetBreakdown;
    use crate::tools::ToolRunner;

    fn direct_settings() -> Arc<RwLock<ConnectionSettings>> {
        Arc::new(RwLock::new(ConnectionSettings {
            connections: vec![ConnectionDescriptor::new("primary", "http://model.local/v1")],
            offline_mode: false,
        }))
    }

    fn echo_tools() -> Arc<ToolRunner> {
        let mut runner = ToolRunner::new();
        runner.register("srv", ScriptedTool::ok("echo", "echoed").with_schema(required_param_schema("text")));
        runner.register("srv", ScriptedTool::failing("boom", "exploded"));
        Arc::new(runner)
    }

    fn orchestrator(transport: Arc<dyn Transport>, config: SessionConfig) -> SessionOrchestrator {
        SessionOrchestrator::new(direct_settings(), transport, echo_tools(), config)
    }

    const CALL: &str = r#"<tool_call name="echo" server="srv">{"text":"again"}</tool_call>"#;

    #[tokio::test]
    async fn test_count_to_three() {
        let transport = Arc::new(ScriptedTransport::new(vec![vec![
            content_chunk("1", None),
            content_chunk("2", None),
            content_chunk("3", Some("stop")),
            "data: [DONE]\n\n".to_string(),
        ]]));
        let config = SessionConfig {
            max_iterations: 3,
            ..SessionConfig::default()
        };
        let orch = SessionOrchestrator::new(direct_settings(), transport.clone(), Arc::new(ToolRunner::new()), config);

        let report = orch.send("c1", "Count to 3").await.unwrap();
        assert_eq!(report.status, SendStatus::Completed);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.message.content, "123");
        assert_eq!(report.message.status, MessageStatus::Complete);
        assert!(report.message.tool_calls.is_none());
        assert!(matches!(report.mode, Mode::Direct(ref c) if c.id == "primary"));

        let budget = orch.budget("c1").unwrap();
        let expected = estimate_tokens(DEFAULT_SYSTEM_PROMPT) + estimate_tokens("Count to 3") + estimate_tokens("123");
        assert_eq!(budget.used_tokens, expected);
        assert_eq!(budget.breakdown.history, estimate_tokens("Count to 3") + estimate_tokens("123"));
        assert!(!orch.is_streaming("c1"));
    }

    #[tokio::test]
    async fn test_custom_tokenizer_drives_budget() {
        let transport = Arc::new(ScriptedTransport::from_texts(&["two words".to_string()]));
        let config = SessionConfig {
            system_prompt: "be brief".to_string(),
            ..SessionConfig::default()
        };
        let orch = SessionOrchestrator::new(direct_settings(), transport, Arc::new(ToolRunner::new()), config)
            .with_tokenizer(Arc::new(WordTokenizer));

        orch.send("c", "one two three").await.unwrap();
        let budget = orch.budget("c").unwrap();
        assert_eq!(
            budget.breakdown,
            BudgetBreakdown {
                system_prompt: 2,
                memory: 0,
                history: 5
            }
        );
        assert_eq!(budget.used_tokens, 7);
    }

    #[tokio::test]
    async fn test_tool_loop_terminates_at_min_of_k_and_max() {
        let max = 3;
        for k in 1..=5usize {
            let mut turns: Vec<String> = (1..k).map(|_| CALL.to_string()).collect();
            turns.push("done".to_string());
            let transport = Arc::new(ScriptedTransport::from_texts(&turns));
            let config = SessionConfig {
                max_iterations: max,
                ..SessionConfig::default()
            };
            let orch = orchestrator(transport.clone(), config);

            let report = orch.send("c", "go").await.unwrap();
            let expected_turns = k.min(max);
            assert_eq!(report.iterations, expected_turns, "k={k}");
            assert_eq!(transport.requests().len(), expected_turns, "k={k}");

            if k <= max {
                assert_eq!(report.status, SendStatus::Completed, "k={k}");
            } else {
                assert_eq!(report.status, SendStatus::MaxIterationsExceeded, "k={k}");
            }

            let tool_messages = orch.messages("c").iter().filter(|m| m.role == Role::Tool).count();
            assert_eq!(tool_messages, expected_turns - 1, "k={k}");

            // every request after the first ends with the previous turn's tool result
            for request in transport.requests().iter().skip(1) {
                let last = request.messages.last().unwrap();
                assert_eq!(last.role, "tool");
                assert_eq!(last.content, "echoed");
            }
        }
    }

    #[tokio::test]
    async fn test_tool_results_reference_calls() {
        let transport = Arc::new(ScriptedTransport::from_texts(&[CALL.to_string(), "ok".to_string()]));
        let orch = orchestrator(transport, SessionConfig::default());
        orch.send("c", "go").await.unwrap();

        let messages = orch.messages("c");
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

        let call_turn = &messages[1];
        let calls = call_turn.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].status, ToolCallStatus::Succeeded);
        assert!(call_turn.has_tool_call(messages[2].tool_call_id.as_deref().unwrap()));
        assert!(messages.iter().all(|m| m.status.is_frozen()));
    }

    #[tokio::test]
    async fn test_validation_and_execution_errors_continue_loop() {
        let turn = concat!(
            r#"<tool_call name="echo" server="srv">{"nope":1}</tool_call>"#,
            r#"<tool_call name="boom" server="srv"></tool_call>"#
        );
        let transport = Arc::new(ScriptedTransport::from_texts(&[turn.to_string(), "recovered".to_string()]));
        let orch = orchestrator(transport.clone(), SessionConfig::default());

        let report = orch.send("c", "go").await.unwrap();
        assert_eq!(report.status, SendStatus::Completed);
        assert_eq!(report.message.content, "recovered");

        let tool_messages: Vec<Message> = orch.messages("c").into_iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_messages.len(), 2);
        assert!(tool_messages[0].content.contains("Tool validation error"));
        assert!(tool_messages[1].content.contains("exploded"));

        // both results reached the model
        let second = &transport.requests()[1];
        assert_eq!(second.messages.iter().filter(|m| m.role == "tool").count(), 2);
    }

    #[tokio::test]
    async fn test_tool_call_fragments_are_interpreted() {
        let fragment = serde_json::json!({
            "choices": [{"delta": {"tool_call_fragment": "{\"tool_calls\":[{\"name\":\"echo\",\"server\":\"srv\",\"parameters\":{\"text\":\"x\"}}]}"}}]
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            vec![format!("data: {fragment}\n\n"), "data: [DONE]\n\n".to_string()],
            vec![sse_body(&["fine"])],
        ]));
        let orch = orchestrator(transport, SessionConfig::default());

        let report = orch.send("c", "go").await.unwrap();
        assert_eq!(report.iterations, 2);
        assert_eq!(orch.messages("c").iter().filter(|m| m.role == Role::Tool).count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_aborts_before_io() {
        let transport = Arc::new(ScriptedTransport::from_texts(&["never".to_string()]).unreachable_backend());
        let settings = Arc::new(RwLock::new(ConnectionSettings::default()));
        let orch = SessionOrchestrator::new(settings, transport.clone(), echo_tools(), SessionConfig::default());

        let err = orch.send("c", "hello").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable));
        assert!(transport.requests().is_empty());
        assert!(orch.messages("c").is_empty());
        assert_eq!(orch.mode("c"), Some(Mode::Unavailable));
        assert!(!orch.is_streaming("c"));
    }

    #[tokio::test]
    async fn test_backend_and_offline_modes() {
        let transport = Arc::new(ScriptedTransport::from_texts(&["a".to_string(), "b".to_string()]));
        let settings = Arc::new(RwLock::new(ConnectionSettings::default()));
        let orch = SessionOrchestrator::new(settings.clone(), transport, echo_tools(), SessionConfig::default());

        assert_eq!(orch.send("c", "1").await.unwrap().mode, Mode::Backend);
        settings.write().unwrap().offline_mode = true;
        assert_eq!(orch.send("c", "2").await.unwrap().mode, Mode::Offline);
    }

    #[tokio::test]
    async fn test_settings_edit_does_not_touch_in_flight_send() {
        let (transport, tx) = ChannelTransport::channel();
        let orch = Arc::new(orchestrator(Arc::new(transport), SessionConfig::default()));

        let sender = orch.clone();
        let handle = tokio::spawn(async move { sender.send("c", "hi").await });
        wait_until(|| orch.is_streaming("c") && orch.messages("c").len() == 2).await;

        orch.settings().write().unwrap().connections = vec![ConnectionDescriptor::new("other", "http://other")];
        tx.send(sse_body(&["done"]).into_bytes()).unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert!(matches!(report.mode, Mode::Direct(ref c) if c.id == "primary"));
        assert_eq!(report.message.content, "done");
    }

    #[tokio::test]
    async fn test_switching_cancels_previous_stream() {
        let (transport, tx) = ChannelTransport::channel();
        let orch = Arc::new(orchestrator(Arc::new(transport), SessionConfig::default()));
        orch.switch_to("a");

        let sender = orch.clone();
        let handle = tokio::spawn(async move { sender.send("a", "tell me a story").await });

        tx.send(content_chunk("Once", None).into_bytes()).unwrap();
        wait_until(|| orch.messages("a").last().is_some_and(|m| m.content == "Once")).await;

        // a second send on the same conversation is rejected while streaming
        assert!(matches!(orch.send("a", "again").await, Err(Error::StreamInFlight(_))));

        orch.switch_to("b");
        assert_eq!(orch.active().as_deref(), Some("b"));

        // chunks arriving after the cancel are never applied
        let _ = tx.send(content_chunk(" upon", None).into_bytes());
        let _ = tx.send(b"data: [DONE]\n\n".to_vec());

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, SendStatus::Cancelled);

        let partial = orch.messages("a").last().cloned().unwrap();
        assert_eq!(partial.content, "Once");
        assert_eq!(partial.status, MessageStatus::Cancelled);
        assert!(!orch.is_streaming("a"));
    }

    #[tokio::test]
    async fn test_decode_error_keeps_partial_and_conversation_usable() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            vec![content_chunk("part", None), "data: {\"choices\": [oops\n\n".to_string()],
            vec![sse_body(&["whole"])],
        ]));
        let orch = orchestrator(transport, SessionConfig::default());

        let report = orch.send("c", "first").await.unwrap();
        assert!(matches!(report.status, SendStatus::StreamFailed(_)));
        assert_eq!(report.message.content, "part");
        assert_eq!(report.message.status, MessageStatus::Failed);

        let report = orch.send("c", "second").await.unwrap();
        assert_eq!(report.status, SendStatus::Completed);
        assert_eq!(report.message.content, "whole");
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_budget_matching_request() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            vec![content_chunk("partial reply", None), "data: {\"choices\": [oops\n\n".to_string()],
            vec![sse_body(&["whole"])],
        ]));
        let orch = orchestrator(transport.clone(), SessionConfig::default());

        orch.send("c", "first").await.unwrap();
        assert_eq!(orch.budget("c").unwrap().breakdown.history, estimate_tokens("first"));

        orch.send("c", "second").await.unwrap();
        let second = &transport.requests()[1];
        let sent: usize = second.messages.iter().skip(1).map(|m| estimate_tokens(&m.content)).sum();
        assert_eq!(
            orch.budget("c").unwrap().breakdown.history,
            sent + estimate_tokens("whole")
        );
    }

    #[tokio::test]
    async fn test_cancel_during_tool_execution_keeps_turn_complete() {
        let call = r#"<tool_call name="slow" server="srv"></tool_call>"#;
        let transport = Arc::new(ScriptedTransport::from_texts(&[call.to_string(), "never".to_string()]));
        let (tool, started) = SlowTool::new("slow", Duration::from_secs(30));
        let mut runner = ToolRunner::new();
        runner.register("srv", tool);
        let store = Arc::new(InMemoryConversationStore::new());
        let orch = Arc::new(
            SessionOrchestrator::new(direct_settings(), transport.clone(), Arc::new(runner), SessionConfig::default())
                .with_store(store.clone()),
        );

        let sender = orch.clone();
        let handle = tokio::spawn(async move { sender.send("c", "go").await });
        wait_until(|| started.load(Ordering::SeqCst)).await;

        // the streamed turn is already frozen while its tool runs
        let turn = orch.messages("c")[1].clone();
        assert_eq!(turn.status, MessageStatus::Complete);
        assert!(orch.is_streaming("c"));
        assert!(orch.cancel("c"));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status, SendStatus::Cancelled);
        assert_eq!(report.message.id, turn.id);

        let messages = orch.messages("c");
        assert_eq!(messages[1].status, MessageStatus::Complete);
        assert_eq!(messages[1].content, call);
        let calls = messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].status, ToolCallStatus::Executing);
        assert!(messages.iter().all(|m| m.role != Role::Tool));
        assert_eq!(transport.requests().len(), 1);

        let stored = store.load_history("c").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].status, MessageStatus::Complete);
        assert!(!orch.is_streaming("c"));
    }

    /// Store whose history load for one id blocks until released.
    struct GatedStore {
        gated: &'static str,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ConversationStore for GatedStore {
        fn append_message(&self, _message: &Message) -> Result<()> {
            Ok(())
        }

        fn load_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
            if conversation_id == self.gated {
                let _ = self.entered.lock().unwrap().send(());
                let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_history_loads_outside_the_lock() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(GatedStore {
            gated: "slow",
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let orch = Arc::new(
            orchestrator(Arc::new(ScriptedTransport::new(vec![])), SessionConfig::default()).with_store(store),
        );

        let loader = {
            let orch = orch.clone();
            std::thread::spawn(move || orch.open_conversation("slow"))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // another conversation opens while the slow load is still blocked
        let (done_tx, done_rx) = mpsc::channel();
        let other = {
            let orch = orch.clone();
            std::thread::spawn(move || {
                orch.open_conversation("other");
                let _ = done_tx.send(());
            })
        };
        let unblocked = done_rx.recv_timeout(Duration::from_secs(2)).is_ok();

        release_tx.send(()).unwrap();
        assert_eq!(loader.join().unwrap(), 0);
        other.join().unwrap();
        assert!(unblocked);
    }

    #[tokio::test]
    async fn test_open_failure_aborts_send() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let orch = orchestrator(transport, SessionConfig::default());

        let err = orch.send("c", "hello").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        let messages = orch.messages("c");
        assert_eq!(messages.last().unwrap().status, MessageStatus::Failed);
        assert!(!orch.is_streaming("c"));
    }

    #[tokio::test]
    async fn test_compression_before_request() {
        let transport = Arc::new(
            ScriptedTransport::from_texts(&["short answer".to_string()]).with_summary("they talked"),
        );
        let config = SessionConfig {
            system_prompt: "sys".to_string(),
            context_limit_tokens: 100,
            compression_threshold: 0.5,
            compression_strategy: CompressionStrategy::Summarize,
            preserve_last_n: 2,
            ..SessionConfig::default()
        };
        let store = Arc::new(InMemoryConversationStore::new());
        for i in 0..10 {
            store.append_message(&Message::user("c", format!("old message number {i:02} padding"))).unwrap();
        }
        let orch = SessionOrchestrator::new(direct_settings(), transport.clone(), Arc::new(ToolRunner::new()), config)
            .with_store(store);

        let report = orch.send("c", "newest").await.unwrap();
        assert_eq!(report.status, SendStatus::Completed);
        assert_eq!(transport.summaries().len(), 1);
        assert!(!transport.summaries()[0].stream);

        let messages = orch.messages("c");
        assert!(messages[0].summary);
        assert!(messages[0].content.contains("they talked"));
        assert_eq!(messages[2].content, "newest");

        let request = &transport.requests()[0];
        // system + summary + last old message + newest
        assert_eq!(request.messages.len(), 4);
        assert!(orch.budget("c").unwrap().used_fraction() < 0.5);
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back_to_truncation() {
        let transport = Arc::new(ScriptedTransport::from_texts(&["ok".to_string()]).failing_summary());
        let config = SessionConfig {
            context_limit_tokens: 40,
            compression_strategy: CompressionStrategy::Hybrid,
            preserve_last_n: 1,
            ..SessionConfig::default()
        };
        let store = Arc::new(InMemoryConversationStore::new());
        for i in 0..10 {
            store.append_message(&Message::user("c", format!("filler text {i}"))).unwrap();
        }
        let orch = orchestrator(transport, config).with_store(store);

        orch.send("c", "latest").await.unwrap();
        let messages = orch.messages("c");
        assert!(messages.iter().all(|m| !m.summary));
        assert!(messages.len() < 12);
    }

    #[tokio::test]
    async fn test_memory_block_is_budgeted_and_sent() {
        let transport = Arc::new(ScriptedTransport::from_texts(&["hi".to_string()]));
        let memory = Arc::new(InMemoryStore::with_content("User's name is Ada"));
        let orch = orchestrator(transport.clone(), SessionConfig::default()).with_memory(memory);

        orch.send("c", "hello").await.unwrap();
        let budget = orch.budget("c").unwrap();
        assert_eq!(budget.breakdown.memory, estimate_tokens("User's name is Ada"));
        assert_eq!(budget.breakdown.total(), budget.used_tokens);

        let system = &transport.requests()[0].messages[0];
        assert_eq!(system.role, "system");
        assert!(system.content.contains("User's name is Ada"));
        assert!(system.content.contains("<tool_call"));
    }

    #[tokio::test]
    async fn test_frozen_messages_are_persisted_and_reloaded() {
        let store = Arc::new(InMemoryConversationStore::new());
        let transport = Arc::new(ScriptedTransport::from_texts(&[CALL.to_string(), "fin".to_string()]));
        let orch = orchestrator(transport, SessionConfig::default()).with_store(store.clone());
        orch.send("c", "go").await.unwrap();

        let stored = store.load_history("c").unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().all(|m| m.status.is_frozen()));

        let fresh = orchestrator(Arc::new(ScriptedTransport::new(vec![])), SessionConfig::default())
            .with_store(store);
        assert_eq!(fresh.open_conversation("c"), 4);
    }

    #[tokio::test]
    async fn test_events_follow_stream_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport::new(vec![vec![sse_body(&["a", "b", "c"])]]));
        let orch = orchestrator(transport, SessionConfig::default()).with_events(tx);
        orch.send("c", "go").await.unwrap();
        drop(orch);

        let mut deltas = String::new();
        let mut finished = None;
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Delta { text, .. } => deltas.push_str(&text),
                SessionEvent::TurnFinished { status, .. } => finished = Some(status),
                _ => {}
            }
        }
        assert_eq!(deltas, "abc");
        assert_eq!(finished, Some(SendStatus::Completed));
    }
}
