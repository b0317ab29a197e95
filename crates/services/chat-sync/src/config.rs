//! Engine configuration.
//!
//! Loading precedence (lowest to highest):
//! 1. Default values
//! 2. JSON file (`chat-sync.json`)
//! 3. Environment variables
//!
//! Loading never fails on questionable values; it reports advisory warnings
//! instead so callers can surface them.
//!
//! # Environment Variables
//! - `CHAT_SYNC_BASE_URL`: Override server base URL
//! - `CHAT_SYNC_SELF_UID`: Override the local user's uid
//! - `CHAT_SYNC_REQUEST_TIMEOUT_SECS`: Override HTTP timeout
//! - `CHAT_SYNC_STREAM_TIMEOUT_SECS`: Override AI stream safety timeout
//! - `CHAT_SYNC_UNREAD_DEBOUNCE_MS`: Override unread acknowledgment debounce

use crate::error::{ChatSyncError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default config filename.
pub const CONFIG_FILE: &str = "chat-sync.json";

/// SSE transport tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    /// Event queue capacity.
    pub capacity: usize,
    /// Initial reconnect backoff (ms).
    pub initial_backoff_ms: u64,
    /// Max reconnect backoff (ms).
    pub max_backoff_ms: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
        }
    }
}

/// Engine configuration.
///
/// All fields use `#[serde(default)]` so partial files work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Server base URL.
    pub base_url: String,
    /// The logged-in staff member's uid (e.g. `"<uuid>-staff"`).
    pub self_uid: String,
    /// HTTP request timeout (seconds).
    pub request_timeout_secs: u64,
    /// Safety net after which a silent AI stream is force-closed (seconds).
    pub stream_timeout_secs: u64,
    /// Delay before the unread acknowledgment is sent (ms).
    pub unread_ack_debounce_ms: u64,
    /// Page size for `load_initial`/`load_older`/`load_newer`.
    pub history_page_size: u32,
    /// Total size of a `load_context` window.
    pub context_page_size: u32,
    /// Recent messages requested per conversation during sync.
    pub recent_message_count: u32,
    /// Largest file accepted for upload (bytes).
    pub max_upload_bytes: u64,
    /// SSE transport tuning.
    pub sse: SseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            self_uid: String::new(),
            request_timeout_secs: 30,
            stream_timeout_secs: 60,
            unread_ack_debounce_ms: 300,
            history_page_size: 30,
            context_page_size: 40,
            recent_message_count: 20,
            max_upload_bytes: 20 * 1024 * 1024,
            sse: SseConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Stream safety timeout.
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// Unread acknowledgment debounce.
    pub fn unread_ack_debounce(&self) -> Duration {
        Duration::from_millis(self.unread_ack_debounce_ms)
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Apply `CHAT_SYNC_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHAT_SYNC_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("CHAT_SYNC_SELF_UID") {
            self.self_uid = v;
        }
        if let Some(v) = lookup("CHAT_SYNC_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = v;
        }
        if let Some(v) = lookup("CHAT_SYNC_STREAM_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.stream_timeout_secs = v;
        }
        if let Some(v) = lookup("CHAT_SYNC_UNREAD_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.unread_ack_debounce_ms = v;
        }
    }

    /// Advisory checks; an empty result means the config looks sane.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.self_uid.trim().is_empty() {
            warnings.push(ConfigWarning::new(
                "self_uid",
                "empty; self-echoes cannot be told apart from counterparty messages",
            ));
        }
        if url::Url::parse(&self.base_url).is_err() {
            warnings.push(ConfigWarning::new("base_url", "not a valid absolute URL"));
        }
        if self.history_page_size == 0 {
            warnings.push(ConfigWarning::new("history_page_size", "0 disables paging"));
        }
        if self.context_page_size < 2 {
            warnings.push(ConfigWarning::new(
                "context_page_size",
                "needs at least 2 to fetch both sides of the target",
            ));
        }
        if self.stream_timeout_secs == 0 {
            warnings.push(ConfigWarning::new(
                "stream_timeout_secs",
                "0 closes every stream immediately",
            ));
        }
        warnings
    }
}

/// Advisory warning produced while loading config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Field path.
    pub field: &'static str,
    /// What looks wrong.
    pub message: String,
}

impl ConfigWarning {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of loading configuration.
#[derive(Debug)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: EngineConfig,
    /// Advisory warnings.
    pub warnings: Vec<ConfigWarning>,
}

/// Load config from `dir/chat-sync.json` (if present) and the environment.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(dir: &Path) -> Result<LoadedConfig> {
    let path = dir.join(CONFIG_FILE);
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str::<EngineConfig>(&raw).map_err(|e| {
            ChatSyncError::InvalidConfig(format!("{}: {e}", path.display()))
        })?
    } else {
        EngineConfig::default()
    };
    config.apply_env_overrides();
    let warnings = config.validate();
    for w in &warnings {
        tracing::warn!(field = w.field, "config: {}", w.message);
    }
    Ok(LoadedConfig { config, warnings })
}
