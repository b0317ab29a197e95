//! Canonical channel and message identity.
//!
//! Every component compares messages through [`identity_of`], so
//! reconciliation of optimistic entries against server echoes is a typed
//! operation instead of string matching.

use crate::types::channel::{ChannelKey, ChannelType};
use crate::types::message::{CorrelationId, Message};
use std::cmp::Ordering;

/// Build a channel key.
pub fn channel_key(channel_id: impl Into<String>, channel_type: ChannelType) -> ChannelKey {
    ChannelKey::new(channel_id, channel_type)
}

/// Identity of a message that has no server sequence yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalId {
    /// Client correlation id.
    Correlation(CorrelationId),
    /// Server message id without a sequence.
    Server(String),
    /// Neither id is known; derived from author and arrival time.
    Derived {
        /// Author uid.
        from_uid: String,
        /// Arrival timestamp.
        timestamp: i64,
    },
}

/// Resolved identity of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageIdentity {
    /// The server assigned a sequence.
    Confirmed {
        /// Owning channel.
        channel: ChannelKey,
        /// Per-channel sequence.
        sequence: u64,
    },
    /// Not (yet) confirmed.
    Local(LocalId),
}

impl MessageIdentity {
    /// Whether this identity carries a server sequence.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// Resolve the identity of `msg`. Total: every message has one.
pub fn identity_of(msg: &Message) -> MessageIdentity {
    if msg.sequence > 0 {
        return MessageIdentity::Confirmed {
            channel: msg.channel.clone(),
            sequence: msg.sequence,
        };
    }
    let local = match &msg.correlation_id {
        Some(id) => LocalId::Correlation(id.clone()),
        None if !msg.message_id.is_empty() => LocalId::Server(msg.message_id.clone()),
        None => LocalId::Derived {
            from_uid: msg.from_uid.clone(),
            timestamp: msg.timestamp,
        },
    };
    MessageIdentity::Local(local)
}

/// Whether `a` and `b` are the same logical message.
///
/// Besides equal identities, a confirmed echo matches the optimistic entry
/// carrying the same correlation id.
pub fn same_message(a: &Message, b: &Message) -> bool {
    if identity_of(a) == identity_of(b) {
        return true;
    }
    a.channel == b.channel
        && a.correlation_id.is_some()
        && a.correlation_id == b.correlation_id
}

/// Window ordering: confirmed messages by sequence, unconfirmed ones after
/// them. Unconfirmed messages compare equal so a stable sort keeps their
/// insertion order.
pub fn window_order(a: &Message, b: &Message) -> Ordering {
    match (a.is_confirmed(), b.is_confirmed()) {
        (true, true) => a.sequence.cmp(&b.sequence),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    }
}
