//! High-level entry point.
//!
//! [`ClientBuilder`] wires the HTTP collaborators and the SSE transport into
//! a [`ChatEngine`].

use crate::config::EngineConfig;
use crate::engine::ChatEngine;
#[cfg(not(feature = "sse"))]
use crate::error::ChatSyncError;
use crate::error::Result;

#[cfg(feature = "sse")]
use crate::engine::Collaborators;
#[cfg(feature = "sse")]
use crate::http::{HttpClient, HttpConfig, ServerApi};
#[cfg(feature = "sse")]
use crate::sse::{SseOptions, SseTransport};
#[cfg(feature = "sse")]
use std::sync::Arc;

/// Builder for a server-backed [`ChatEngine`].
#[derive(Clone, Debug, Default)]
pub struct ClientBuilder {
    config: EngineConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    ///
    /// Default settings:
    /// - Base URL: `http://127.0.0.1:8000`
    /// - Timeout: 30 seconds
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a full configuration, e.g. one returned by
    /// [`config::load`](crate::config::load).
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the base URL of the chat server.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Set the uid of the signed-in user.
    pub fn self_uid(mut self, uid: impl Into<String>) -> Self {
        self.config.self_uid = uid.into();
        self
    }

    /// Set the request timeout in seconds.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    /// Build the engine.
    ///
    /// The engine is not connected yet; call [`ChatEngine::connect`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or if the
    /// `sse` feature is not enabled.
    #[cfg(feature = "sse")]
    pub fn build(self) -> Result<ChatEngine> {
        let http = HttpClient::new(HttpConfig {
            base_url: self.config.base_url.clone(),
            timeout: self.config.request_timeout(),
        })?;
        let transport = SseTransport::new(
            http.clone(),
            self.config.self_uid.clone(),
            SseOptions::from(self.config.sse),
        );
        let apis = Collaborators::from_api(Arc::new(ServerApi::new(http)), Arc::new(transport));
        tracing::debug!(base_url = %self.config.base_url, "chat engine built");
        Ok(ChatEngine::new(self.config, apis))
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns an error because the `sse` feature is required.
    #[cfg(not(feature = "sse"))]
    pub fn build(self) -> Result<ChatEngine> {
        Err(ChatSyncError::InvalidConfig(
            "sse feature required to build a server-backed engine".into(),
        ))
    }
}

impl ChatEngine {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let builder = ClientBuilder::new()
            .base_url("http://chat.local:9000")
            .self_uid("staff-1")
            .timeout_secs(5);
        assert_eq!(builder.config.base_url, "http://chat.local:9000");
        assert_eq!(builder.config.self_uid, "staff-1");
        assert_eq!(builder.config.request_timeout_secs, 5);
    }

    #[cfg(feature = "sse")]
    #[tokio::test]
    async fn test_build_creates_engine() {
        let engine = ChatEngine::builder()
            .base_url("http://127.0.0.1:9")
            .self_uid("staff-1")
            .build()
            .unwrap();
        assert_eq!(engine.config().self_uid, "staff-1");
        assert!(engine.conversations().await.is_empty());
    }

    #[cfg(feature = "sse")]
    #[test]
    fn test_build_rejects_bad_url() {
        let result = ClientBuilder::new().base_url("not a url").build();
        assert!(result.is_err());
    }
}
