//! Request and response types for the server collaborators.

use crate::types::channel::{ChannelInfo, ChannelKey};
use crate::types::message::{CorrelationId, Message};
use crate::types::payload::Payload;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

/// History pull direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum PullMode {
    /// Older than `start_message_seq` (wire `0`).
    Down,
    /// Newer than `start_message_seq` (wire `1`).
    Up,
}

impl From<PullMode> for u8 {
    fn from(mode: PullMode) -> Self {
        match mode {
            PullMode::Down => 0,
            PullMode::Up => 1,
        }
    }
}

impl From<u8> for PullMode {
    fn from(v: u8) -> Self {
        if v == 0 { Self::Down } else { Self::Up }
    }
}

/// Cursor-based history request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Channel to read.
    #[serde(flatten)]
    pub channel: ChannelKey,
    /// Cursor; `0` with [`PullMode::Down`] means "from the live edge".
    pub start_message_seq: u64,
    /// Optional far bound; `0` means unbounded.
    pub end_message_seq: u64,
    /// Maximum number of messages.
    pub limit: u32,
    /// Direction.
    pub pull_mode: PullMode,
}

/// One page of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Messages in any order; the pager sorts them.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Whether more messages exist past this page in the pulled direction.
    #[serde(default, deserialize_with = "bool_or_int")]
    pub more: bool,
    /// Server hint for the next cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_start_seq: Option<u64>,
}

/// Accept `true`/`false` as well as `0`/`1` for boolean flags.
fn bool_or_int<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    let v = serde_json::Value::deserialize(de)?;
    Ok(match v {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        _ => false,
    })
}

/// Conversation sync request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Local version watermark.
    pub version: u64,
    /// `channel_id:channel_type:last_seq` entries joined by `|`.
    pub last_msg_seqs: String,
    /// Recent messages to return per conversation.
    pub msg_count: u32,
}

/// One conversation in a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedConversation {
    /// Channel identity.
    #[serde(flatten)]
    pub channel: ChannelKey,
    /// Unread count.
    #[serde(default)]
    pub unread: u32,
    /// Last activity (unix seconds).
    #[serde(default)]
    pub timestamp: i64,
    /// Last sequence in the channel.
    #[serde(default)]
    pub last_msg_seq: u64,
    /// Monotonic conversation version.
    #[serde(default)]
    pub version: u64,
    /// Most recent messages, ascending or descending.
    #[serde(default)]
    pub recents: Vec<Message>,
}

/// Channel display info delivered next to a sync response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Channel identity.
    #[serde(flatten)]
    pub channel: ChannelKey,
    /// Display info.
    #[serde(flatten)]
    pub info: ChannelInfo,
}

/// Conversation sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Conversations.
    #[serde(default)]
    pub conversations: Vec<SyncedConversation>,
    /// Display info for the channels above.
    #[serde(default)]
    pub channels: Vec<ChannelSummary>,
}

impl SyncResponse {
    /// Highest conversation version in the response.
    pub fn version(&self) -> u64 {
        self.conversations
            .iter()
            .map(|c| c.version)
            .max()
            .unwrap_or_default()
    }
}

/// Message submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Target channel.
    #[serde(flatten)]
    pub channel: ChannelKey,
    /// Content.
    pub payload: Payload,
    /// Correlation id.
    pub client_msg_no: CorrelationId,
    /// Sender uid.
    pub from_uid: String,
}

/// Outcome discriminator of the send API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// Accepted.
    Ok,
    /// Refused.
    Error,
}

/// Send API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    /// Outcome.
    pub status: SendStatus,
    /// Reason when refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Packet pushed over the transport after the send API accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPacket {
    /// Target channel.
    #[serde(flatten)]
    pub channel: ChannelKey,
    /// Correlation id.
    pub client_msg_no: CorrelationId,
    /// Content.
    pub payload: Payload,
}

/// Transport acknowledgment of a pushed packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Reason code (`1` = success).
    pub reason_code: u8,
    /// Server message id, when assigned synchronously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Server sequence, when assigned synchronously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_seq: Option<u64>,
}

/// A file the user picked for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// File contents.
    pub data: Bytes,
}

impl OutboundFile {
    /// Create an outbound file.
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the file should be sent as an image payload.
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

/// Upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Channel the file belongs to.
    pub channel: ChannelKey,
    /// The file.
    pub file: OutboundFile,
}

/// Upload API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Server file id.
    pub file_id: String,
    /// Stored file name.
    pub file_name: String,
    /// Stored size in bytes.
    pub file_size: u64,
    /// Detected MIME type.
    #[serde(default)]
    pub file_type: String,
    /// URL the message payload references.
    pub file_url: String,
}
