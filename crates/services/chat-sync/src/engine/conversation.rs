//! Conversation list: authoritative sync plus incremental updates.

use super::{ChatEngine, EngineEvent};
use crate::error::Result;
use crate::types::api::{SyncRequest, SyncResponse};
use crate::types::channel::{ChannelInfo, ChannelKey};
use crate::types::conversation::{Conversation, Priority};
use crate::types::message::{Message, SenderRole};
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// How the open window catches up after a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heal {
    /// Nothing confirmed is loaded yet; fetch the latest page.
    Initial,
    /// The window ends before the conversation's last message.
    Newer,
}

/// Sorted conversation list with a version watermark and an info cache.
#[derive(Debug, Default)]
pub struct ConversationIndex {
    list: Vec<Conversation>,
    version: u64,
    info_cache: HashMap<ChannelKey, ChannelInfo>,
}

impl ConversationIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversations, most recent activity first.
    pub fn list(&self) -> &[Conversation] {
        &self.list
    }

    /// Conversation of `channel`.
    pub fn get(&self, channel: &ChannelKey) -> Option<&Conversation> {
        self.list.iter().find(|c| &c.channel == channel)
    }

    /// Local version watermark.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Cached display info of `channel`.
    pub fn cached_info(&self, channel: &ChannelKey) -> Option<&ChannelInfo> {
        self.info_cache.get(channel)
    }

    /// Build the request for the next authoritative sync.
    pub fn sync_request(&self, msg_count: u32) -> SyncRequest {
        let mut last_msg_seqs = String::new();
        for conv in self.list.iter().filter(|c| c.last_sequence > 0) {
            if !last_msg_seqs.is_empty() {
                last_msg_seqs.push('|');
            }
            let _ = write!(
                last_msg_seqs,
                "{}:{}:{}",
                conv.channel.channel_id, conv.channel.channel_type, conv.last_sequence
            );
        }
        SyncRequest {
            version: self.version,
            last_msg_seqs,
            msg_count,
        }
    }

    /// Replace the list from a full server sync.
    ///
    /// Display fields the server omits are kept from the local cache.
    pub fn apply_authoritative_sync(&mut self, resp: &SyncResponse) {
        for summary in &resp.channels {
            self.info_cache
                .entry(summary.channel.clone())
                .or_default()
                .overlay(&summary.info);
        }

        let mut next = Vec::with_capacity(resp.conversations.len());
        for synced in &resp.conversations {
            let mut conv = Conversation::new(synced.channel.clone());
            let latest = synced.recents.iter().max_by_key(|m| m.sequence);
            conv.timestamp = synced.timestamp;
            conv.last_sequence = synced.last_msg_seq;
            if let Some(latest) = latest {
                conv.preview = latest.preview();
                conv.timestamp = conv.timestamp.max(latest.timestamp);
                conv.last_sequence = conv.last_sequence.max(latest.sequence);
            } else if let Some(prev) = self.get(&synced.channel) {
                conv.preview.clone_from(&prev.preview);
            }
            conv.unread = synced.unread;
            conv.priority = if synced.unread > 0 {
                Priority::High
            } else {
                Priority::Normal
            };
            if let Some(cached) = self.info_cache.get(&synced.channel) {
                conv.info.backfill_from(cached);
            }
            if let Some(prev) = self.get(&synced.channel) {
                conv.info.backfill_from(&prev.info);
            }
            next.push(conv);
        }
        self.list = next;
        self.sort();
        self.version = self.version.max(resp.version());
    }

    /// Fold a message into its conversation.
    ///
    /// Counterparty messages for unseen channels create the conversation.
    /// Stale messages never move the preview or timestamp backwards. Unread
    /// grows only for new counterparty messages outside the open channel.
    /// Returns whether the list changed.
    pub fn apply_message(&mut self, msg: &Message, open: Option<&ChannelKey>) -> bool {
        let from_counterparty = msg.role == SenderRole::Counterparty;
        let idx = match self.list.iter().position(|c| c.channel == msg.channel) {
            Some(idx) => idx,
            None if from_counterparty => {
                let mut conv = Conversation::new(msg.channel.clone());
                if let Some(info) = self.info_cache.get(&msg.channel) {
                    conv.info = info.clone();
                }
                debug!(channel = %msg.channel, "conversation auto-created");
                self.list.push(conv);
                self.list.len() - 1
            }
            None => return false,
        };

        let conv = &mut self.list[idx];
        let before = conv.clone();
        let is_new = msg.sequence == 0 || msg.sequence > conv.last_sequence;
        let not_stale = msg.timestamp >= conv.timestamp
            && (msg.sequence == 0 || msg.sequence >= conv.last_sequence);
        if not_stale {
            conv.preview = msg.preview();
            conv.timestamp = msg.timestamp;
        }
        conv.last_sequence = conv.last_sequence.max(msg.sequence);
        if from_counterparty && is_new && open != Some(&msg.channel) {
            conv.unread += 1;
            conv.priority = Priority::High;
        }
        let changed = *conv != before;
        if changed {
            self.sort();
        }
        changed
    }

    /// Overlay externally fetched display info. Returns whether anything changed.
    pub fn apply_channel_info(&mut self, channel: &ChannelKey, info: &ChannelInfo) -> bool {
        let cache_changed = self
            .info_cache
            .entry(channel.clone())
            .or_default()
            .overlay(info);
        let conv_changed = self
            .list
            .iter_mut()
            .find(|c| &c.channel == channel)
            .is_some_and(|c| c.info.overlay(info));
        cache_changed || conv_changed
    }

    /// Zero the unread count. Returns the previous count, or `None` if it
    /// was already zero (or the conversation is unknown).
    pub fn clear_unread(&mut self, channel: &ChannelKey) -> Option<u32> {
        let conv = self.list.iter_mut().find(|c| &c.channel == channel)?;
        if conv.unread == 0 {
            return None;
        }
        let previous = conv.unread;
        conv.unread = 0;
        conv.priority = Priority::Normal;
        Some(previous)
    }

    /// Remove a conversation. Returns whether it existed.
    pub fn delete(&mut self, channel: &ChannelKey) -> bool {
        let before = self.list.len();
        self.list.retain(|c| &c.channel != channel);
        self.list.len() != before
    }

    fn sort(&mut self) {
        // stable: ties keep their previous relative order
        self.list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
}

impl ChatEngine {
    /// Sync once unless a sync already succeeded or is in flight.
    ///
    /// Returns whether a sync ran.
    pub async fn ensure_synced(&self) -> Result<bool> {
        {
            let st = self.inner.state.lock().await;
            if st.sync.synced {
                return Ok(false);
            }
        }
        self.sync_conversations().await
    }

    /// Force an authoritative sync (suppressed while one is in flight).
    pub async fn resync(&self) -> Result<bool> {
        info!("forced conversation resync");
        self.sync_conversations().await
    }

    async fn sync_conversations(&self) -> Result<bool> {
        let req = {
            let mut st = self.inner.state.lock().await;
            if st.sync.in_flight {
                debug!("sync already in flight");
                return Ok(false);
            }
            st.sync.in_flight = true;
            st.conversations
                .sync_request(self.inner.config.recent_message_count)
        };

        let result = self.inner.apis.conversations.sync(&req).await;

        let mut events = vec![];
        let heal = {
            let mut st = self.inner.state.lock().await;
            st.sync.in_flight = false;
            let mut resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, "conversation sync failed");
                    return Err(e);
                }
            };
            st.sync.synced = true;
            for synced in &mut resp.conversations {
                self.classify_all(&mut synced.recents);
            }
            st.conversations.apply_authoritative_sync(&resp);
            events.push(EngineEvent::ConversationsChanged);
            debug!(
                count = resp.conversations.len(),
                version = st.conversations.version(),
                "conversations synced"
            );

            for summary in &resp.channels {
                for ch in st
                    .pager
                    .apply_sender_info(&summary.channel.channel_id, &summary.info)
                {
                    events.push(EngineEvent::WindowChanged(ch));
                }
            }

            let mut heal = None;
            if let Some(open) = st.active_channel.clone() {
                let synced = resp.conversations.into_iter().find(|c| c.channel == open);
                let last_seq = st.conversations.get(&open).map_or(0, |c| c.last_sequence);
                if let Some(window) = st.pager.window_mut(&open) {
                    let mut changed = false;
                    if window.newer_cursor == 0 {
                        if last_seq > 0 {
                            info!(channel = %open, last_seq, "open window empty after resync");
                            heal = Some((open.clone(), Heal::Initial));
                        }
                    } else {
                        if !window.has_more_newer {
                            if let Some(synced) = synced {
                                changed |= window.merge_all(synced.recents);
                            }
                        }
                        if last_seq > window.newer_cursor && !window.has_more_newer {
                            info!(channel = %open, last_seq, newest = window.newer_cursor, "window behind after resync");
                            window.has_more_newer = true;
                            changed = true;
                            heal = Some((open.clone(), Heal::Newer));
                        }
                    }
                    if changed {
                        events.push(EngineEvent::WindowChanged(open));
                    }
                }
            }
            heal
        };
        self.emit(events);

        if let Some((channel, heal)) = heal {
            let limit = self.inner.config.history_page_size;
            let result = match heal {
                Heal::Initial => self.load_initial(&channel, limit).await,
                Heal::Newer => self.load_newer(&channel, limit).await,
            };
            if let Err(e) = result {
                warn!(channel = %channel, ?heal, error = %e, "post-resync catch-up failed");
            }
        }
        Ok(true)
    }

    /// Remove a conversation locally; the server call is best-effort.
    pub async fn delete_conversation(&self, channel: &ChannelKey) -> bool {
        let removed = self.inner.state.lock().await.conversations.delete(channel);
        if removed {
            self.emit([EngineEvent::ConversationsChanged]);
        }
        if let Err(e) = self.inner.apis.conversations.delete(channel).await {
            warn!(channel = %channel, error = %e, "conversation delete failed");
        }
        removed
    }

    /// Propagate display info of `channel` into the list and into messages
    /// authored by it.
    pub async fn apply_channel_info(&self, channel: &ChannelKey, info: &ChannelInfo) -> bool {
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock().await;
            if st.conversations.apply_channel_info(channel, info) {
                events.push(EngineEvent::ConversationsChanged);
            }
            for ch in st.pager.apply_sender_info(&channel.channel_id, info) {
                events.push(EngineEvent::WindowChanged(ch));
            }
        }
        let changed = !events.is_empty();
        self.emit(events);
        changed
    }
}
