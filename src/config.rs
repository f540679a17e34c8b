//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::Result;
use crate::error::Error;
use crate::session::orchestrator::DEFAULT_SYSTEM_PROMPT;
use crate::session::tokens::defaults;
use crate::session::transport::http::DEFAULT_OFFLINE_URL;
use crate::session::{CompressionStrategy, ConnectionDescriptor, ConnectionSettings, SessionConfig};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory path (memory file and conversation logs)
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Direct connections, highest priority wins
    #[serde(default)]
    pub connections: Vec<ConnectionDescriptor>,

    /// Route sends to the local offline endpoint
    #[serde(default)]
    pub offline_mode: bool,

    /// Local OpenAI-compatible endpoint used in offline mode
    #[serde(default = "default_offline_url")]
    pub offline_url: String,

    /// Backend fallback, unset when there is none
    #[serde(default)]
    pub backend_url: Option<String>,

    /// Bearer token for the backend
    #[serde(default)]
    pub backend_api_key: Option<String>,

    /// Model to request, endpoint default when unset
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Maximum model turns per send
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_context_limit")]
    pub context_limit_tokens: usize,

    #[serde(default)]
    pub compression: CompressionConfig,
}

/// When and how history gets compressed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub strategy: CompressionStrategy,

    /// Fraction of the context limit that triggers compression
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Most recent messages never compressed away
    #[serde(default = "default_preserve_last_n")]
    pub preserve_last_n: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            strategy: CompressionStrategy::default(),
            threshold: default_threshold(),
            preserve_last_n: default_preserve_last_n(),
        }
    }
}

fn default_workspace() -> PathBuf {
    config_dir().join("workspace")
}

fn default_offline_url() -> String {
    DEFAULT_OFFLINE_URL.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_iterations() -> usize {
    10
}

fn default_context_limit() -> usize {
    defaults::CONTEXT_LIMIT
}

fn default_threshold() -> f64 {
    defaults::COMPRESSION_THRESHOLD
}

fn default_preserve_last_n() -> usize {
    6
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            connections: Vec::new(),
            offline_mode: false,
            offline_url: default_offline_url(),
            backend_url: None,
            backend_api_key: None,
            model: None,
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            context_limit_tokens: default_context_limit(),
            compression: CompressionConfig::default(),
        }
    }
}

impl Config {
    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".to_string()));
        }
        if self.context_limit_tokens == 0 {
            return Err(Error::Config("context_limit_tokens must be positive".to_string()));
        }
        if !(self.compression.threshold > 0.0 && self.compression.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "compression.threshold must be in (0, 1], got {}",
                self.compression.threshold
            )));
        }
        Ok(())
    }

    /// Engine-side view of the configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            max_iterations: self.max_iterations,
            context_limit_tokens: self.context_limit_tokens,
            compression_threshold: self.compression.threshold,
            compression_strategy: self.compression.strategy,
            preserve_last_n: self.compression.preserve_last_n,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connections: self.connections.clone(),
            offline_mode: self.offline_mode,
        }
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.workspace.join("conversations")
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".convo")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from file
pub fn load() -> Result<Config> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Config not found at {:?}. Run 'convo init' first.",
            path
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save(config: &Config) -> Result<()> {
    save_to(config, &config_path())
}

pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    // Create parent directory
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Write a default config and create the workspace. An existing config is
/// left alone unless `force` is set.
pub fn init(force: bool) -> Result<Config> {
    use crate::ui;

    let path = config_path();
    if path.exists() && !force {
        ui::print_warning(&format!("Config already exists at {:?}", path));
        return load_from(&path);
    }

    let config = Config::default();
    ui::print_thinking("Creating workspace");
    std::fs::create_dir_all(config.conversations_dir())?;

    ui::print_thinking("Saving configuration");
    save_to(&config, &path)?;

    ui::print_success(&format!("Wrote {:?}", path));
    ui::print_step("Add a connection under \"connections\" or set \"offline_mode\", then run 'convo chat'.");
    Ok(config)
}
