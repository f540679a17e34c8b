//! Conversation persistence, consumed as "append message" / "load history".

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::session::Message;
use crate::Result;

/// Where frozen messages go. Appending a message whose id is already
/// stored replaces the earlier record on load.
pub trait ConversationStore: Send + Sync {
    fn append_message(&self, message: &Message) -> Result<()>;
    fn load_history(&self, conversation_id: &str) -> Result<Vec<Message>>;
}

/// One JSON line per message in `<dir>/<conversation_id>.jsonl`.
pub struct JsonlConversationStore {
    dir: PathBuf,
}

impl JsonlConversationStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        let safe: String = conversation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

impl ConversationStore for JsonlConversationStore {
    fn append_message(&self, message: &Message) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&message.conversation_id))?;
        let line = serde_json::to_string(message)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn load_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut messages = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => upsert(&mut messages, message),
                Err(e) => warn!("Skipping corrupt line {} in {:?}: {}", n + 1, path, e),
            }
        }
        Ok(messages)
    }
}

/// Later records win, keeping the position of the first.
fn upsert(messages: &mut Vec<Message>, message: Message) {
    match messages.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

/// Store that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn append_message(&self, message: &Message) -> Result<()> {
        let mut conversations = self.conversations.lock().unwrap_or_else(PoisonError::into_inner);
        let history = conversations
            .entry(message.conversation_id.clone())
            .or_default();
        upsert(history, message.clone());
        Ok(())
    }

    fn load_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
