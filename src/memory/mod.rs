//! Memory module - the persistent notes block pinned into every context

use crate::Result;
use crate::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use chrono::Local;

/// Memory store trait - source of the memory block
pub trait MemoryStore: Send + Sync {
    /// Serialized memory context, empty when there is nothing to remember
    fn get_context(&self) -> Result<String>;

    /// Append a note to long-term memory
    fn remember(&self, note: &str) -> Result<()>;
}

/// File-based memory store (`<workspace>/MEMORY.md`)
pub struct FileMemoryStore {
    workspace: PathBuf,
}

impl FileMemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }

    fn memory_path(&self) -> PathBuf {
        self.workspace.join("MEMORY.md")
    }
}

impl MemoryStore for FileMemoryStore {
    fn get_context(&self) -> Result<String> {
        let path = self.memory_path();
        if !path.exists() {
            return Ok(String::new());
        }
        let content = std::fs::read_to_string(&path).map_err(Error::from)?;
        Ok(content.trim().to_string())
    }

    fn remember(&self, note: &str) -> Result<()> {
        let path = self.memory_path();

        // Create directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut current = if path.exists() {
            std::fs::read_to_string(&path)?
        } else {
            String::from("# Memory\n")
        };

        current.push_str(&format!("\n- [{}] {}", Local::now().format("%Y-%m-%d"), note.trim()));
        std::fs::write(&path, current)?;

        Ok(())
    }
}

/// In-memory store for tests and embedding
#[derive(Default)]
pub struct InMemoryStore {
    content: Mutex<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Mutex::new(content.into()),
        }
    }

    /// Replace the whole memory block
    pub fn set(&self, content: impl Into<String>) {
        *self.lock() = content.into();
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryStore for InMemoryStore {
    fn get_context(&self) -> Result<String> {
        Ok(self.lock().clone())
    }

    fn remember(&self, note: &str) -> Result<()> {
        let mut content = self.lock();
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(note);
        Ok(())
    }
}
