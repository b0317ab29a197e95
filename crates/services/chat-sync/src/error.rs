//! Error types for chat_sync.

use thiserror::Error;

/// Result type alias for chat_sync operations.
pub type Result<T> = std::result::Result<T, ChatSyncError>;

/// Error type for chat_sync operations.
#[derive(Debug, Error)]
pub enum ChatSyncError {
    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Human readable message (the `detail` field when the body carries one).
        message: String,
        /// Structured `detail` payload, if the body was JSON.
        detail: Option<serde_json::Value>,
    },

    /// Connection, DNS or timeout failure before a response arrived.
    #[error("Network error: {0}")]
    Network(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image dimensions could not be probed.
    #[error("Image probe failed: {0}")]
    Image(#[from] image::ImageError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The server accepted the request but refused the operation.
    #[error("Rejected: {reason}")]
    Rejected {
        /// Reason reported by the server.
        reason: String,
    },

    /// A transfer was aborted through its abort handle.
    #[error("Transfer aborted")]
    Aborted,

    /// Transport event queue closed unexpectedly.
    #[error("Transport stream closed unexpectedly")]
    StreamClosed,

    /// Internal state error (unknown correlation id, missing window, ...).
    #[error("Internal state error: {0}")]
    State(String),
}

/// Coarse failure classes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fetch/transport failure; the user may retry.
    TransientNetwork,
    /// The server rejected the operation; not retried automatically.
    TerminalBusiness,
}

impl ChatSyncError {
    /// Build an HTTP error from a status code and raw body.
    ///
    /// FastAPI style bodies (`{"detail": ...}`) are unpacked so that
    /// `message` holds the human readable part.
    pub fn http(status: u16, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let detail = parsed.as_ref().and_then(|v| v.get("detail")).cloned();
        let message = match &detail {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None if body.trim().is_empty() => format!("status {status}"),
            None => body.trim().to_string(),
        };
        Self::Http {
            status,
            message,
            detail,
        }
    }

    /// HTTP status code, if this is an HTTP error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is a 5xx response.
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    /// Whether this is a 4xx response.
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// Whether repeating the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::StreamClosed => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Map onto the failure taxonomy used for per-message state.
    pub fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::TransientNetwork
        } else {
            ErrorClass::TerminalBusiness
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for ChatSyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::Http {
                status: status.as_u16(),
                message: e.to_string(),
                detail: None,
            };
        }
        Self::Network(e.to_string())
    }
}
