//! History compression.
//!
//! Rewrites a conversation history so it fits a token allowance. System
//! messages (the pinned system prompt and memory blocks) and the most recent
//! `preserve_last_n` messages are never removed. Summaries produced by an
//! earlier pass are folded into the next summary rather than summarized on
//! their own, so compressing an already compressed history is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::Error;
use crate::Result;

use super::message::{Message, MessageStatus, Role};
use super::tokens::{message_tokens, Tokenizer};

/// How older history is reduced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStrategy {
    /// Drop the oldest messages until under budget.
    Truncate,
    /// Replace everything before the preserved tail with one summary.
    Summarize,
    /// Truncate, but summarize what was dropped.
    #[default]
    Hybrid,
}

/// Parameters and result of one compression.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionPlan {
    pub strategy: CompressionStrategy,
    pub preserve_last_n: usize,
    pub summary_message: Option<Message>,
}

impl CompressionPlan {
    pub fn new(strategy: CompressionStrategy, preserve_last_n: usize) -> Self {
        Self {
            strategy,
            preserve_last_n,
            summary_message: None,
        }
    }
}

/// Produces summary text for a run of messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Output of [`ContextCompressor::compress`].
#[derive(Debug, Clone)]
pub struct Compressed {
    pub messages: Vec<Message>,
    pub plan: CompressionPlan,
    /// Messages taken out of the history (summarized or dropped).
    pub removed: usize,
}

impl Compressed {
    #[inline]
    pub fn changed(&self) -> bool {
        self.removed > 0
    }
}

/// Render messages as a plain transcript for summarization.
/// Failed messages were never sent and are left out.
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.status != MessageStatus::Failed)
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Pinned blocks and failed messages are never rewritten.
fn is_candidate(message: &Message) -> bool {
    !message.is_pinned() && message.status != MessageStatus::Failed
}

pub struct ContextCompressor {
    tokenizer: Arc<dyn Tokenizer>,
}

impl ContextCompressor {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    /// Compress `history` so that its regular (non-pinned, non-summary)
    /// messages fit in `history_budget` tokens.
    pub async fn compress(
        &self,
        history: &[Message],
        plan: &CompressionPlan,
        history_budget: usize,
        summarizer: &dyn Summarizer,
    ) -> Result<Compressed> {
        let candidates: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, m)| is_candidate(m))
            .map(|(i, _)| i)
            .collect();

        let tail_from = Self::tail_start(history, &candidates, plan.preserve_last_n);
        let older = &candidates[..tail_from];
        let tail_ids: Vec<&str> = candidates[tail_from..]
            .iter()
            .map(|&i| history[i].id.as_str())
            .collect();

        let dropped = match plan.strategy {
            CompressionStrategy::Summarize => older
                .iter()
                .copied()
                .filter(|&i| !history[i].summary)
                .collect(),
            CompressionStrategy::Truncate | CompressionStrategy::Hybrid => {
                self.select_for_truncation(history, &candidates, older, history_budget)
            }
        };

        if dropped.is_empty() {
            debug!("Compression: nothing to remove");
            return Ok(Compressed {
                messages: history.to_vec(),
                plan: plan.clone(),
                removed: 0,
            });
        }

        let (messages, summary_message, removed) = match plan.strategy {
            CompressionStrategy::Truncate => {
                let messages = history
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !dropped.contains(i))
                    .map(|(_, m)| m.clone())
                    .collect();
                (messages, None, dropped.len())
            }
            CompressionStrategy::Summarize | CompressionStrategy::Hybrid => {
                // Earlier summaries are folded into the new one.
                let folded: Vec<usize> = older
                    .iter()
                    .copied()
                    .filter(|i| history[*i].summary || dropped.contains(i))
                    .collect();
                let to_summarize: Vec<Message> = folded.iter().map(|&i| history[i].clone()).collect();
                let text = summarizer.summarize(&to_summarize).await?;

                let conversation_id = history[folded[0]].conversation_id.as_str();
                let summary = Message::summary(
                    conversation_id,
                    format!("[Summary of earlier conversation]\n{}", text.trim()),
                );

                let mut messages = Vec::with_capacity(history.len() - folded.len() + 1);
                for (i, m) in history.iter().enumerate() {
                    if i == folded[0] {
                        messages.push(summary.clone());
                    } else if !folded.contains(&i) {
                        messages.push(m.clone());
                    }
                }
                (messages, Some(summary), folded.len())
            }
        };

        Self::verify(history, &messages, &tail_ids)?;

        info!(
            "Compressed history with {:?}: removed {} of {} messages",
            plan.strategy,
            removed,
            history.len()
        );

        Ok(Compressed {
            messages,
            plan: CompressionPlan {
                summary_message,
                ..plan.clone()
            },
            removed,
        })
    }

    /// Index into `candidates` where the preserved tail begins. Tool results
    /// at the start of the tail pull in the turn that requested them.
    fn tail_start(history: &[Message], candidates: &[usize], preserve_last_n: usize) -> usize {
        let keep = preserve_last_n.min(candidates.len());
        let mut from = candidates.len() - keep;
        while from > 0 && from < candidates.len() && history[candidates[from]].role == Role::Tool {
            from -= 1;
        }
        from
    }

    /// Oldest-first selection of regular messages to remove until the
    /// regular history fits. A removed assistant turn takes its tool
    /// results with it.
    fn select_for_truncation(
        &self,
        history: &[Message],
        candidates: &[usize],
        older: &[usize],
        history_budget: usize,
    ) -> Vec<usize> {
        let tokens = |i: usize| message_tokens(self.tokenizer.as_ref(), &history[i]);
        let mut total: usize = candidates
            .iter()
            .copied()
            .filter(|&i| !history[i].summary)
            .map(&tokens)
            .sum();

        let regular: Vec<usize> = older.iter().copied().filter(|&i| !history[i].summary).collect();
        let mut dropped = Vec::new();
        let mut pos = 0;
        while pos < regular.len() && total > history_budget {
            let i = regular[pos];
            total -= tokens(i);
            dropped.push(i);
            pos += 1;

            while pos < regular.len() && history[regular[pos]].role == Role::Tool {
                total -= tokens(regular[pos]);
                dropped.push(regular[pos]);
                pos += 1;
            }
        }
        dropped
    }

    fn verify(before: &[Message], after: &[Message], tail_ids: &[&str]) -> Result<()> {
        let pinned = |msgs: &[Message]| -> Vec<String> {
            msgs.iter().filter(|m| m.is_pinned()).map(|m| m.id.clone()).collect()
        };

        if pinned(before) != pinned(after) {
            error!("Compression altered pinned system/memory messages");
            return Err(Error::CompressionInvariant(
                "system prompt or memory block was removed".to_string(),
            ));
        }

        let after_tail: Vec<&str> = after
            .iter()
            .filter(|m| is_candidate(m))
            .map(|m| m.id.as_str())
            .rev()
            .take(tail_ids.len())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if after_tail != tail_ids {
            error!("Compression altered the preserved tail");
            return Err(Error::CompressionInvariant(
                "preserved tail was modified".to_string(),
            ));
        }
        Ok(())
    }
}
