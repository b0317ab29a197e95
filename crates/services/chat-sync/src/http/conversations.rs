//! Conversations API: sync, unread, delete and history.

use crate::error::Result;
use crate::http::HttpClient;
use crate::types::api::{HistoryPage, HistoryRequest, SyncRequest, SyncResponse};
use crate::types::channel::ChannelKey;
use serde::Serialize;
use tracing::debug;

#[derive(Serialize)]
struct UnreadBody<'a> {
    #[serde(flatten)]
    channel: &'a ChannelKey,
    unread: u32,
}

/// Conversations API client.
#[derive(Clone)]
pub struct ConversationsApi {
    http: HttpClient,
}

impl ConversationsApi {
    /// Create a new Conversations API client.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Fetch the authoritative conversation list.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn sync(&self, req: &SyncRequest) -> Result<SyncResponse> {
        debug!(version = req.version, "POST /v1/conversations/my");
        self.http.post("/v1/conversations/my", req).await
    }

    /// Set the unread count of a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn set_unread(&self, channel: &ChannelKey, unread: u32) -> Result<()> {
        self.http
            .put_empty("/v1/conversations/unread", &UnreadBody { channel, unread })
            .await
    }

    /// Delete a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete(&self, channel: &ChannelKey) -> Result<()> {
        self.http.delete_empty("/v1/conversations", channel).await
    }

    /// Fetch one page of channel history.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn messages(&self, req: &HistoryRequest) -> Result<HistoryPage> {
        debug!(
            channel = %req.channel,
            start = req.start_message_seq,
            pull_mode = ?req.pull_mode,
            "POST /v1/conversations/messages"
        );
        self.http.post("/v1/conversations/messages", req).await
    }
}
