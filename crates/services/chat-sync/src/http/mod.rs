//! HTTP collaborators for the chat server REST API.
//!
//! This module provides the core HTTP client, the per-resource API modules
//! and [`ServerApi`], which implements the engine's collaborator traits on
//! top of them.

use crate::backend::{ConversationApi, HistoryApi, ProgressSender, SendApi, UploadApi};
use crate::error::{ChatSyncError, Result};
use crate::types::api::{
    HistoryPage, HistoryRequest, SendRequest, SendResponse, SyncRequest, SyncResponse,
    UploadRequest, UploadedFile,
};
use crate::types::channel::ChannelKey;
use crate::types::message::CorrelationId;
use async_trait::async_trait;
use reqwest::{Client as ReqClient, Method, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod conversations;
pub mod files;
pub mod messages;

/// Configuration for the HTTP client.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Base URL of the chat server.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
}

/// HTTP client for the chat server.
#[derive(Clone)]
pub struct HttpClient {
    inner: ReqClient,
    cfg: HttpConfig,
}

impl HttpClient {
    /// Create a new HTTP client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(cfg: HttpConfig) -> Result<Self> {
        url::Url::parse(&cfg.base_url)?;
        let inner = ReqClient::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ChatSyncError::Network(e.to_string()))?;
        Ok(Self {
            inner,
            cfg: HttpConfig {
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                timeout: cfg.timeout,
            },
        })
    }

    /// Get the base URL.
    pub fn base(&self) -> &str {
        &self.cfg.base_url
    }

    /// Underlying reqwest client (shared connection pool).
    pub fn reqwest(&self) -> &ReqClient {
        &self.inner
    }

    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.cfg.base_url, path);
        self.inner.request(method, &url)
    }

    // ==================== Typed HTTP Methods ====================

    /// POST request with JSON body returning deserialized JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or response cannot be deserialized.
    pub async fn post<TReq: serde::Serialize + ?Sized, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes> {
        self.send_json(Method::POST, path, body).await
    }

    /// POST request expecting no meaningful response body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn post_empty<TReq: serde::Serialize + ?Sized>(&self, path: &str, body: &TReq) -> Result<()> {
        self.send_empty(Method::POST, path, body).await
    }

    /// PUT request expecting no meaningful response body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn put_empty<TReq: serde::Serialize + ?Sized>(&self, path: &str, body: &TReq) -> Result<()> {
        self.send_empty(Method::PUT, path, body).await
    }

    /// DELETE request with JSON body expecting no meaningful response body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete_empty<TReq: serde::Serialize + ?Sized>(&self, path: &str, body: &TReq) -> Result<()> {
        self.send_empty(Method::DELETE, path, body).await
    }

    /// POST a multipart form returning deserialized JSON.
    ///
    /// Resolves with [`ChatSyncError::Aborted`] as soon as `abort` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, is aborted or the response
    /// cannot be deserialized.
    pub async fn post_multipart<TRes: DeserializeOwned>(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
        abort: &CancellationToken,
    ) -> Result<TRes> {
        let send = self.build_request(Method::POST, path).multipart(form).send();
        let resp = tokio::select! {
            res = send => res.map_err(|e| ChatSyncError::Network(e.to_string()))?,
            () = abort.cancelled() => return Err(ChatSyncError::Aborted),
        };
        Self::map_json_response(resp).await
    }

    async fn send_json<TReq: serde::Serialize + ?Sized, TRes: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &TReq,
    ) -> Result<TRes> {
        let resp = self
            .build_request(method, path)
            .json(body)
            .send()
            .await
            .map_err(|e| ChatSyncError::Network(e.to_string()))?;
        Self::map_json_response(resp).await
    }

    async fn send_empty<TReq: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &TReq,
    ) -> Result<()> {
        let resp = self
            .build_request(method, path)
            .json(body)
            .send()
            .await
            .map_err(|e| ChatSyncError::Network(e.to_string()))?;
        Self::check_status(resp).await
    }

    // ==================== Response Handling ====================

    /// Map response to JSON, parsing `{"detail": ...}` error bodies.
    async fn map_json_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChatSyncError::Network(e.to_string()))?;

        if !status.is_success() {
            let body_text = String::from_utf8_lossy(&bytes);
            return Err(ChatSyncError::http(status.as_u16(), &body_text));
        }

        serde_json::from_slice(&bytes).map_err(ChatSyncError::from)
    }

    /// Check response status, returning a parsed error on failure.
    async fn check_status(resp: Response) -> Result<()> {
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatSyncError::http(status.as_u16(), &body));
        }

        Ok(())
    }
}

/// The chat server's REST API as engine collaborators.
#[derive(Clone)]
pub struct ServerApi {
    http: HttpClient,
}

impl ServerApi {
    /// Create a server API over an HTTP client.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Get the conversations API.
    pub fn conversations(&self) -> conversations::ConversationsApi {
        conversations::ConversationsApi::new(self.http.clone())
    }

    /// Get the messages API.
    pub fn messages(&self) -> messages::MessagesApi {
        messages::MessagesApi::new(self.http.clone())
    }

    /// Get the files API.
    pub fn files(&self) -> files::FilesApi {
        files::FilesApi::new(self.http.clone())
    }
}

#[async_trait]
impl HistoryApi for ServerApi {
    async fn fetch(&self, req: &HistoryRequest) -> Result<HistoryPage> {
        self.conversations().messages(req).await
    }
}

#[async_trait]
impl ConversationApi for ServerApi {
    async fn sync(&self, req: &SyncRequest) -> Result<SyncResponse> {
        self.conversations().sync(req).await
    }

    async fn set_unread(&self, channel: &ChannelKey, unread: u32) -> Result<()> {
        self.conversations().set_unread(channel, unread).await
    }

    async fn delete(&self, channel: &ChannelKey) -> Result<()> {
        self.conversations().delete(channel).await
    }
}

#[async_trait]
impl SendApi for ServerApi {
    async fn send(&self, req: &SendRequest) -> Result<SendResponse> {
        self.messages().send(req).await
    }

    async fn cancel_stream(
        &self,
        correlation_id: &CorrelationId,
        reason: Option<&str>,
    ) -> Result<()> {
        self.messages().cancel_run(correlation_id, reason).await
    }
}

#[async_trait]
impl UploadApi for ServerApi {
    async fn upload(
        &self,
        req: UploadRequest,
        progress: ProgressSender,
        abort: CancellationToken,
    ) -> Result<UploadedFile> {
        self.files().upload(req, progress, abort).await
    }
}
