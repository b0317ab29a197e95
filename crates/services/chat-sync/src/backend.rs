//! Collaborator seams consumed by the engine.
//!
//! The engine only talks to the outside world through these traits. The
//! `http` and `sse` modules provide the production implementations; tests
//! substitute in-memory mocks.

use crate::error::Result;
use crate::types::api::{
    HistoryPage, HistoryRequest, OutboundPacket, PushAck, SendRequest, SendResponse, SyncRequest,
    SyncResponse, UploadRequest, UploadedFile,
};
use crate::types::channel::ChannelKey;
use crate::types::event::TransportEvent;
use crate::types::message::CorrelationId;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel on which uploads report progress in percent (0..=100).
pub type ProgressSender = mpsc::UnboundedSender<u8>;

/// Bidirectional, cursor-based message history.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Fetch one page of history.
    async fn fetch(&self, req: &HistoryRequest) -> Result<HistoryPage>;
}

/// Authoritative conversation list and unread bookkeeping.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Fetch the authoritative conversation list.
    async fn sync(&self, req: &SyncRequest) -> Result<SyncResponse>;

    /// Set the server-side unread count of a conversation.
    async fn set_unread(&self, channel: &ChannelKey, unread: u32) -> Result<()>;

    /// Remove a conversation from the server-side list.
    async fn delete(&self, channel: &ChannelKey) -> Result<()>;
}

/// Message submission and AI run control.
#[async_trait]
pub trait SendApi: Send + Sync {
    /// Submit a message.
    async fn send(&self, req: &SendRequest) -> Result<SendResponse>;

    /// Ask the server to stop the AI run producing `correlation_id`.
    async fn cancel_stream(&self, correlation_id: &CorrelationId, reason: Option<&str>)
    -> Result<()>;
}

/// Cancellable, progress-reporting file upload.
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// Upload a file.
    ///
    /// Implementations must resolve with [`crate::ChatSyncError::Aborted`]
    /// once `abort` is cancelled.
    async fn upload(
        &self,
        req: UploadRequest,
        progress: ProgressSender,
        abort: CancellationToken,
    ) -> Result<UploadedFile>;
}

/// Handle to a live transport connection.
///
/// Dropping the handle disconnects.
pub struct TransportSubscription {
    rx: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TransportSubscription {
    /// Wrap a receiver fed by a background task.
    pub fn new(
        rx: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
        task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { rx, cancel, task }
    }

    /// Build a subscription over a plain receiver (no background task).
    pub fn from_receiver(rx: mpsc::Receiver<TransportEvent>) -> Self {
        Self::new(rx, CancellationToken::new(), None)
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Close the subscription explicitly.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called or the handle was dropped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Real-time transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the event stream.
    async fn connect(&self) -> Result<TransportSubscription>;

    /// Push a packet and wait for its acknowledgment.
    async fn push(&self, packet: &OutboundPacket) -> Result<PushAck>;
}
