//! Token counting and context budget tracking.
//!
//! Token counts come from a [`Tokenizer`]; the default heuristic assumes
//! ~4 characters per token (GPT-style average).

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::message::{Message, MessageStatus};

/// Characters per token estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Default budget limits (in tokens).
pub mod defaults {
    /// Total context budget (model dependent).
    pub const CONTEXT_LIMIT: usize = 32000;
    /// Fraction of the limit that triggers compression.
    pub const COMPRESSION_THRESHOLD: f64 = 0.8;
}

/// Counts tokens for arbitrary text.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Character-count heuristic tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Estimate token count for a string.
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Keep the end of `text` within a token budget.
pub fn tail_to_budget(text: &str, max_tokens: usize) -> &str {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if text.len() <= max_chars {
        text
    } else {
        // Find a safe UTF-8 boundary
        let mut start = text.len() - max_chars;
        while start < text.len() && !text.is_char_boundary(start) {
            start += 1;
        }
        &text[start..]
    }
}

/// Tokens a message occupies in the context window.
/// Failed messages are never sent, so they occupy nothing.
pub fn message_tokens(tokenizer: &dyn Tokenizer, message: &Message) -> usize {
    if message.status == MessageStatus::Failed {
        return 0;
    }
    tokenizer.count_tokens(&message.content)
}

/// Per-component token usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetBreakdown {
    pub system_prompt: usize,
    pub memory: usize,
    pub history: usize,
}

impl BudgetBreakdown {
    #[inline]
    pub fn total(&self) -> usize {
        self.system_prompt + self.memory + self.history
    }
}

/// Snapshot of context usage against the model limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextBudget {
    pub limit_tokens: usize,
    pub used_tokens: usize,
    pub breakdown: BudgetBreakdown,
}

impl ContextBudget {
    fn new(limit_tokens: usize, breakdown: BudgetBreakdown) -> Self {
        Self {
            limit_tokens,
            used_tokens: breakdown.total(),
            breakdown,
        }
    }

    /// `used / limit`. A zero limit counts as full once anything is used.
    pub fn used_fraction(&self) -> f64 {
        if self.limit_tokens == 0 {
            return if self.used_tokens == 0 { 0.0 } else { 1.0 };
        }
        self.used_tokens as f64 / self.limit_tokens as f64
    }

    /// Whether usage is at or beyond `pct` (a fraction, e.g. `0.8`).
    pub fn over_threshold(&self, pct: f64) -> bool {
        self.used_fraction() >= pct
    }

    /// Format as a compact summary string.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} ({:.0}%) sys:{} mem:{} hist:{}",
            self.used_tokens,
            self.limit_tokens,
            self.used_fraction() * 100.0,
            self.breakdown.system_prompt,
            self.breakdown.memory,
            self.breakdown.history
        )
    }
}

/// Live breakdown of context usage for one conversation.
pub struct TokenBudgetTracker {
    tokenizer: Arc<dyn Tokenizer>,
    limit_tokens: usize,
    system_prompt: usize,
    memory: usize,
    /// (message id, tokens), in history order.
    history: Vec<(String, usize)>,
}

impl TokenBudgetTracker {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, limit_tokens: usize) -> Self {
        Self {
            tokenizer,
            limit_tokens,
            system_prompt: 0,
            memory: 0,
            history: Vec::new(),
        }
    }

    pub fn set_system_prompt(&mut self, text: &str) {
        self.system_prompt = self.tokenizer.count_tokens(text);
    }

    pub fn set_memory(&mut self, text: &str) {
        self.memory = self.tokenizer.count_tokens(text);
    }

    /// Recount the whole history.
    pub fn set_history(&mut self, messages: &[Message]) {
        self.history = messages
            .iter()
            .map(|m| (m.id.clone(), message_tokens(self.tokenizer.as_ref(), m)))
            .collect();
        self.log();
    }

    pub fn push_message(&mut self, message: &Message) {
        let tokens = message_tokens(self.tokenizer.as_ref(), message);
        self.history.push((message.id.clone(), tokens));
    }

    /// Recount one message after its content changed (e.g. a streamed
    /// delta). Unknown messages are appended.
    pub fn update_message(&mut self, message: &Message) {
        let tokens = message_tokens(self.tokenizer.as_ref(), message);
        match self.history.iter_mut().rev().find(|(id, _)| *id == message.id) {
            Some(entry) => entry.1 = tokens,
            None => self.history.push((message.id.clone(), tokens)),
        }
    }

    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(
            self.limit_tokens,
            BudgetBreakdown {
                system_prompt: self.system_prompt,
                memory: self.memory,
                history: self.history.iter().map(|(_, t)| t).sum(),
            },
        )
    }

    #[inline]
    pub fn used_fraction(&self) -> f64 {
        self.budget().used_fraction()
    }

    #[inline]
    pub fn over_threshold(&self, pct: f64) -> bool {
        self.budget().over_threshold(pct)
    }

    /// Tokens left for history once the pinned blocks are accounted for.
    pub fn history_allowance(&self, pct: f64) -> usize {
        let cap = (self.limit_tokens as f64 * pct).floor() as usize;
        cap.saturating_sub(self.system_prompt + self.memory)
    }

    /// Log usage at debug level.
    pub fn log(&self) {
        debug!("Context budget: {}", self.budget().summary());
    }
}
