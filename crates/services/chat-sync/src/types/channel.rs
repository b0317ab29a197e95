//! Channel identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric channel type as assigned by the messaging server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(pub u8);

impl ChannelType {
    /// One-to-one channel (staff personal channel, visitor channel).
    pub const PERSON: Self = Self(1);
    /// Group channel.
    pub const GROUP: Self = Self(2);
    /// Customer-service channel between a visitor and the support team.
    pub const CUSTOMER_SERVICE: Self = Self(251);
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A channel as addressed on the wire: id plus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Channel identifier.
    pub channel_id: String,
    /// Channel type.
    pub channel_type: ChannelType,
}

impl ChannelKey {
    /// Create a channel key.
    pub fn new(channel_id: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_type,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel_id, self.channel_type)
    }
}

/// Display information for a channel, sourced from the channel-info collaborator.
///
/// Every field is optional; `None` means "unknown", not "cleared".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Presence/service status (e.g. "online", "queued").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Tags attached to the visitor/channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Last time the counterparty was seen (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

impl ChannelInfo {
    /// Fill every unknown field of `self` from `cached`.
    pub fn backfill_from(&mut self, cached: &Self) {
        if self.name.is_none() {
            self.name.clone_from(&cached.name);
        }
        if self.avatar.is_none() {
            self.avatar.clone_from(&cached.avatar);
        }
        if self.status.is_none() {
            self.status.clone_from(&cached.status);
        }
        if self.tags.is_none() {
            self.tags.clone_from(&cached.tags);
        }
        if self.last_seen.is_none() {
            self.last_seen = cached.last_seen;
        }
    }

    /// Overlay the known fields of `update` onto `self`.
    ///
    /// Returns `true` when at least one field changed.
    pub fn overlay(&mut self, update: &Self) -> bool {
        let before = self.clone();
        if update.name.is_some() {
            self.name.clone_from(&update.name);
        }
        if update.avatar.is_some() {
            self.avatar.clone_from(&update.avatar);
        }
        if update.status.is_some() {
            self.status.clone_from(&update.status);
        }
        if update.tags.is_some() {
            self.tags.clone_from(&update.tags);
        }
        if update.last_seen.is_some() {
            self.last_seen = update.last_seen;
        }
        *self != before
    }
}
