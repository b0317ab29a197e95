//! Conversation list entries.

use crate::types::channel::{ChannelInfo, ChannelKey};
use serde::{Deserialize, Serialize};

/// Priority flag driving list highlighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Nothing new.
    #[default]
    Normal,
    /// Unread counterparty activity.
    High,
}

/// One channel's summary for the list view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Channel identity.
    pub channel: ChannelKey,
    /// Last-message preview text.
    pub preview: String,
    /// Last activity (unix seconds, authoritative).
    pub timestamp: i64,
    /// Last known sequence.
    pub last_sequence: u64,
    /// Unread counterparty messages.
    pub unread: u32,
    /// Highlight flag.
    pub priority: Priority,
    /// Cached display info.
    pub info: ChannelInfo,
}

impl Conversation {
    /// Create an empty conversation entry for `channel`.
    pub fn new(channel: ChannelKey) -> Self {
        Self {
            channel,
            preview: String::new(),
            timestamp: 0,
            last_sequence: 0,
            unread: 0,
            priority: Priority::Normal,
            info: ChannelInfo::default(),
        }
    }
}
