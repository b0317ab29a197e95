//! Message types.

use crate::types::channel::{ChannelInfo, ChannelKey};
use crate::types::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason code the transport reports for a delivered message.
pub const REASON_SUCCESS: u8 = 1;
/// Generic failure reason code recorded when a send attempt fails locally.
pub const REASON_SEND_FAILED: u8 = 0;

/// Client-generated identifier matching an optimistic message to its
/// server-confirmed echo (`client_msg_no` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a message, relative to the local user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// Sent by the logged-in staff member.
    Me,
    /// Sent by the visitor, an AI agent or another staff member.
    #[default]
    Counterparty,
}

/// Transient status of a locally created message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Submitted, waiting for acknowledgment.
    Sending,
    /// File upload in progress.
    Uploading,
}

/// One unit of conversation content.
///
/// Fields below `payload` are local view state and are never sent to or read
/// from the server, except `reason_code` which the transport may assign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Owning channel.
    #[serde(flatten)]
    pub channel: ChannelKey,
    /// Server message id (empty for optimistic messages).
    #[serde(default)]
    pub message_id: String,
    /// Server-assigned per-channel sequence; `0` means not yet known.
    #[serde(default, rename = "message_seq")]
    pub sequence: u64,
    /// Correlation id (`client_msg_no`).
    #[serde(default, rename = "client_msg_no", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Sender uid.
    #[serde(default)]
    pub from_uid: String,
    /// Arrival timestamp (unix seconds).
    #[serde(default)]
    pub timestamp: i64,
    /// Content.
    pub payload: Payload,
    /// Transport-assigned reason code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u8>,

    /// Sender role, resolved against the local uid at ingestion.
    #[serde(skip)]
    pub role: SenderRole,
    /// Accumulated AI text while a stream is in progress.
    #[serde(skip)]
    pub stream_buffer: Option<String>,
    /// Transient send/upload status.
    #[serde(skip)]
    pub status: Option<TransferStatus>,
    /// Upload progress in percent.
    #[serde(skip)]
    pub upload_progress: Option<u8>,
    /// Terminal upload failure.
    #[serde(skip)]
    pub upload_error: Option<String>,
    /// Terminal error reported by the producer (e.g. AI run failed).
    #[serde(skip)]
    pub error_message: Option<String>,
    /// Upload was cancelled by the user.
    #[serde(skip)]
    pub cancelled: bool,
    /// Display info of the author, filled from the channel-info collaborator.
    #[serde(skip)]
    pub sender_info: Option<ChannelInfo>,
}

impl Message {
    /// Build a message with only wire fields set.
    pub fn new(channel: ChannelKey, payload: Payload) -> Self {
        Self {
            channel,
            message_id: String::new(),
            sequence: 0,
            correlation_id: None,
            from_uid: String::new(),
            timestamp: 0,
            payload,
            reason_code: None,
            role: SenderRole::Counterparty,
            stream_buffer: None,
            status: None,
            upload_progress: None,
            upload_error: None,
            error_message: None,
            cancelled: false,
            sender_info: None,
        }
    }

    /// Build an optimistic local message authored by `from_uid`.
    pub fn local(
        channel: ChannelKey,
        correlation_id: CorrelationId,
        from_uid: impl Into<String>,
        payload: Payload,
        status: TransferStatus,
    ) -> Self {
        let mut msg = Self::new(channel, payload);
        msg.correlation_id = Some(correlation_id);
        msg.from_uid = from_uid.into();
        msg.timestamp = chrono::Utc::now().timestamp();
        msg.role = SenderRole::Me;
        msg.status = Some(status);
        if status == TransferStatus::Uploading {
            msg.upload_progress = Some(0);
        }
        msg
    }

    /// Whether the server has assigned a sequence.
    pub fn is_confirmed(&self) -> bool {
        self.sequence > 0
    }

    /// Whether the last send attempt ended in failure.
    pub fn is_failed(&self) -> bool {
        self.upload_error.is_some()
            || self
                .reason_code
                .is_some_and(|code| code != REASON_SUCCESS)
    }

    /// Whether a stream is still writing into this message.
    pub fn is_streaming(&self) -> bool {
        self.stream_buffer.is_some()
    }

    /// Preview text for the conversation list.
    pub fn preview(&self) -> String {
        match &self.stream_buffer {
            Some(buf) if !buf.is_empty() => buf.clone(),
            _ => self.payload.preview(),
        }
    }

    /// Merge a server echo into this (local) entry.
    ///
    /// Server-owned fields are taken from `echo`; local view state is kept
    /// except the transient status, which settles.
    pub fn absorb_echo(&mut self, echo: &Self) {
        if echo.sequence > 0 {
            self.sequence = echo.sequence;
        }
        if !echo.message_id.is_empty() {
            self.message_id.clone_from(&echo.message_id);
        }
        if echo.timestamp > 0 {
            self.timestamp = echo.timestamp;
        }
        if !matches!(echo.payload, Payload::Loading) {
            self.payload = echo.payload.clone();
        }
        if echo.reason_code.is_some() {
            self.reason_code = echo.reason_code;
        }
        if !echo.from_uid.is_empty() {
            self.from_uid.clone_from(&echo.from_uid);
        }
        self.status = None;
        self.upload_progress = None;
    }
}
