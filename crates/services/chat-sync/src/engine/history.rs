//! Bidirectional, cursor-based history windows.
//!
//! Fetches follow a begin/complete protocol: `begin_*` registers the request
//! as in flight and returns a ticket, the caller performs the network call
//! without holding any lock, and `complete*` merges the page. A second
//! request for the same channel and direction is refused while one is
//! outstanding. Context loads and `clear` bump the channel epoch so pages
//! requested against an older window are discarded on completion.

use super::identity::{identity_of, same_message, window_order};
use super::{ChatEngine, EngineEvent};
use crate::error::Result;
use crate::types::api::{HistoryPage, HistoryRequest, PullMode};
use crate::types::channel::{ChannelInfo, ChannelKey};
use crate::types::message::{CorrelationId, Message};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// The materialized slice of one channel's messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryWindow {
    /// Confirmed messages ascending by sequence, then unconfirmed ones in
    /// insertion order.
    pub messages: Vec<Message>,
    /// Oldest confirmed sequence in the window (`0` when empty).
    pub older_cursor: u64,
    /// Whether older messages exist on the server.
    pub has_more_older: bool,
    /// Newest confirmed sequence in the window (`0` when empty).
    pub newer_cursor: u64,
    /// Whether newer messages exist on the server (window is not at the
    /// live edge).
    pub has_more_newer: bool,
}

/// What happened to a message offered to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New entry.
    Inserted,
    /// Matched and updated an optimistic entry.
    Reconciled,
    /// Identity already present; the existing entry was kept.
    Discarded,
}

impl HistoryWindow {
    /// Confirmed sequences front to back.
    pub fn sequences(&self) -> Vec<u64> {
        self.messages
            .iter()
            .filter(|m| m.is_confirmed())
            .map(|m| m.sequence)
            .collect()
    }

    /// Entry carrying `id`.
    pub fn find_by_correlation(&self, id: &CorrelationId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.correlation_id.as_ref() == Some(id))
    }

    /// Offer one message under the merge rule: existing identities win,
    /// except that a confirmed echo reconciles its optimistic entry.
    pub fn merge(&mut self, msg: Message) -> MergeOutcome {
        let outcome = self.merge_inner(msg);
        if outcome != MergeOutcome::Discarded {
            self.refresh_cursors();
        }
        outcome
    }

    /// Merge many messages. Returns whether anything changed.
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = Message>) -> bool {
        let mut changed = false;
        for msg in messages {
            changed |= self.merge_inner(msg) != MergeOutcome::Discarded;
        }
        if changed {
            self.refresh_cursors();
        }
        changed
    }

    fn merge_inner(&mut self, msg: Message) -> MergeOutcome {
        if !msg.is_confirmed() {
            if self.messages.iter().any(|m| same_message(m, &msg)) {
                return MergeOutcome::Discarded;
            }
            self.messages.push(msg);
            return MergeOutcome::Inserted;
        }

        let local = self
            .messages
            .iter()
            .position(|m| !m.is_confirmed() && same_message(m, &msg));
        let pos = self.confirmed_position(msg.sequence);
        let occupied = self
            .messages
            .get(pos)
            .is_some_and(|m| identity_of(m) == identity_of(&msg));

        match (local, occupied) {
            (Some(idx), true) => {
                // echo already present under its sequence; drop the optimistic copy
                self.messages.remove(idx);
                MergeOutcome::Reconciled
            }
            (Some(idx), false) => {
                let mut entry = self.messages.remove(idx);
                entry.absorb_echo(&msg);
                let pos = self.confirmed_position(entry.sequence);
                self.messages.insert(pos, entry);
                MergeOutcome::Reconciled
            }
            (None, true) => MergeOutcome::Discarded,
            (None, false) => {
                self.messages.insert(pos, msg);
                MergeOutcome::Inserted
            }
        }
    }

    fn confirmed_position(&self, sequence: u64) -> usize {
        self.messages
            .partition_point(|m| m.is_confirmed() && m.sequence < sequence)
    }

    /// Recompute the cursors from the confirmed entries.
    ///
    /// While the window is detached, `newer_cursor` is the newest sequence
    /// fetched contiguously and only `Newer` pages advance it; a confirmed
    /// send past that edge must not make `load_newer` skip the gap.
    fn refresh_cursors(&mut self) {
        let mut confirmed = self.messages.iter().filter(|m| m.is_confirmed());
        self.older_cursor = confirmed.next().map_or(0, |m| m.sequence);
        if self.has_more_newer && self.newer_cursor != 0 {
            return;
        }
        self.newer_cursor = self
            .messages
            .iter()
            .rev()
            .find(|m| m.is_confirmed())
            .map_or(self.older_cursor, |m| m.sequence);
    }

    fn replace(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(window_order);
        self.messages.clear();
        self.merge_all(messages);
        self.refresh_cursors();
    }
}

/// Kind of history fetch, used for in-flight suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    /// Most recent page.
    Initial,
    /// Page before the older cursor.
    Older,
    /// Page after the newer cursor.
    Newer,
    /// Two pages around a target sequence.
    Context,
}

/// A registered single-page fetch.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    /// Channel.
    pub channel: ChannelKey,
    /// Direction.
    pub kind: FetchKind,
    /// Request to send.
    pub request: HistoryRequest,
    epoch: u64,
}

/// A registered context fetch.
#[derive(Debug, Clone)]
pub struct ContextTicket {
    /// Channel.
    pub channel: ChannelKey,
    /// Sequence the window centres on.
    pub target: u64,
    /// Page ending at (and including) the target.
    pub older: HistoryRequest,
    /// Page after the target.
    pub newer: HistoryRequest,
    epoch: u64,
}

/// Per-channel windows plus the in-flight guard.
#[derive(Debug, Default)]
pub struct HistoryPager {
    windows: HashMap<ChannelKey, HistoryWindow>,
    in_flight: HashSet<(ChannelKey, FetchKind)>,
    epochs: HashMap<ChannelKey, u64>,
}

impl HistoryPager {
    /// Create an empty pager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the window for `channel` if missing. Returns whether it was created.
    pub fn open(&mut self, channel: &ChannelKey) -> bool {
        if self.windows.contains_key(channel) {
            return false;
        }
        self.windows.insert(channel.clone(), HistoryWindow::default());
        true
    }

    /// Window of `channel`.
    pub fn window(&self, channel: &ChannelKey) -> Option<&HistoryWindow> {
        self.windows.get(channel)
    }

    /// Mutable window of `channel`.
    pub fn window_mut(&mut self, channel: &ChannelKey) -> Option<&mut HistoryWindow> {
        self.windows.get_mut(channel)
    }

    /// Whether a fetch of `kind` is outstanding for `channel`.
    pub fn is_in_flight(&self, channel: &ChannelKey, kind: FetchKind) -> bool {
        self.in_flight.contains(&(channel.clone(), kind))
    }

    /// Register a single-page fetch.
    ///
    /// Returns `None` when suppressed: same fetch in flight, no window (for
    /// older/newer), or nothing more to load in that direction.
    pub fn begin(&mut self, channel: &ChannelKey, kind: FetchKind, limit: u32) -> Option<FetchTicket> {
        if self.is_in_flight(channel, kind) {
            debug!(channel = %channel, ?kind, "fetch already in flight");
            return None;
        }
        let (start, pull_mode) = match kind {
            FetchKind::Initial => {
                self.open(channel);
                (0, PullMode::Down)
            }
            FetchKind::Older => {
                let w = self.windows.get(channel)?;
                if !w.has_more_older || w.older_cursor == 0 {
                    return None;
                }
                (w.older_cursor, PullMode::Down)
            }
            FetchKind::Newer => {
                let w = self.windows.get(channel)?;
                if !w.has_more_newer {
                    return None;
                }
                (w.newer_cursor, PullMode::Up)
            }
            FetchKind::Context => return None,
        };
        self.in_flight.insert((channel.clone(), kind));
        Some(FetchTicket {
            channel: channel.clone(),
            kind,
            request: HistoryRequest {
                channel: channel.clone(),
                start_message_seq: start,
                end_message_seq: 0,
                limit,
                pull_mode,
            },
            epoch: self.epoch(channel),
        })
    }

    /// Register a context fetch centred on `target`.
    pub fn begin_context(
        &mut self,
        channel: &ChannelKey,
        target: u64,
        total_limit: u32,
    ) -> Option<ContextTicket> {
        if self.is_in_flight(channel, FetchKind::Context) {
            debug!(channel = %channel, target, "context fetch already in flight");
            return None;
        }
        self.open(channel);
        self.in_flight.insert((channel.clone(), FetchKind::Context));
        let older_limit = total_limit.div_ceil(2).max(1);
        let newer_limit = (total_limit / 2).max(1);
        Some(ContextTicket {
            channel: channel.clone(),
            target,
            older: HistoryRequest {
                channel: channel.clone(),
                start_message_seq: target + 1,
                end_message_seq: 0,
                limit: older_limit,
                pull_mode: PullMode::Down,
            },
            newer: HistoryRequest {
                channel: channel.clone(),
                start_message_seq: target,
                end_message_seq: 0,
                limit: newer_limit,
                pull_mode: PullMode::Up,
            },
            epoch: self.epoch(channel),
        })
    }

    /// Merge the page of a finished fetch. Returns whether the window changed.
    pub fn complete(&mut self, ticket: &FetchTicket, page: HistoryPage) -> bool {
        self.in_flight.remove(&(ticket.channel.clone(), ticket.kind));
        if self.epoch(&ticket.channel) != ticket.epoch {
            debug!(channel = %ticket.channel, kind = ?ticket.kind, "stale page discarded");
            return false;
        }
        let Some(window) = self.windows.get_mut(&ticket.channel) else {
            return false;
        };
        let before = (window.has_more_older, window.has_more_newer);
        let exhausted = page.messages.is_empty();
        let changed = match ticket.kind {
            FetchKind::Initial => {
                if window.has_more_newer {
                    // detached window: the live edge replaces it
                    window.messages.retain(|m| !m.is_confirmed());
                }
                window.has_more_older = page.more && !exhausted;
                window.has_more_newer = false;
                let changed = window.merge_all(page.messages);
                window.refresh_cursors();
                changed
            }
            FetchKind::Older => {
                window.has_more_older = page.more && !exhausted;
                window.merge_all(page.messages)
            }
            FetchKind::Newer => {
                window.has_more_newer = page.more && !exhausted;
                if let Some(newest) = page.messages.iter().map(|m| m.sequence).max() {
                    window.newer_cursor = window.newer_cursor.max(newest);
                }
                let changed = window.merge_all(page.messages);
                window.refresh_cursors();
                changed
            }
            FetchKind::Context => false,
        };
        changed || before != (window.has_more_older, window.has_more_newer)
    }

    /// Replace the window with the pages of a context fetch.
    pub fn complete_context(
        &mut self,
        ticket: &ContextTicket,
        older: HistoryPage,
        newer: HistoryPage,
    ) -> bool {
        self.in_flight
            .remove(&(ticket.channel.clone(), FetchKind::Context));
        if self.epoch(&ticket.channel) != ticket.epoch {
            return false;
        }
        let Some(window) = self.windows.get_mut(&ticket.channel) else {
            return false;
        };
        let has_more_older = older.more && !older.messages.is_empty();
        let has_more_newer = newer.more && !newer.messages.is_empty();
        let mut combined = older.messages;
        combined.extend(newer.messages);
        window.has_more_newer = false;
        window.replace(combined);
        window.has_more_older = has_more_older;
        window.has_more_newer = has_more_newer;
        self.bump_epoch(&ticket.channel);
        true
    }

    /// Release the in-flight marker of a failed fetch.
    pub fn abort(&mut self, channel: &ChannelKey, kind: FetchKind) {
        self.in_flight.remove(&(channel.clone(), kind));
    }

    /// Drop the window of `channel` and invalidate outstanding fetches.
    pub fn clear(&mut self, channel: &ChannelKey) -> bool {
        self.bump_epoch(channel);
        self.windows.remove(channel).is_some()
    }

    /// Offer a live message to its channel's window.
    ///
    /// A window that is not at the live edge only accepts reconciliations;
    /// other live messages would open a gap and arrive later via `load_newer`.
    pub fn ingest_live(&mut self, msg: Message) -> bool {
        let Some(window) = self.windows.get_mut(&msg.channel) else {
            return false;
        };
        if window.has_more_newer {
            let reconciles = msg.correlation_id.is_some()
                && window
                    .messages
                    .iter()
                    .any(|m| !m.is_confirmed() && same_message(m, &msg));
            if !reconciles {
                debug!(channel = %msg.channel, seq = msg.sequence, "window detached, live message deferred");
                return false;
            }
        }
        window.merge(msg) != MergeOutcome::Discarded
    }

    /// Append an optimistic local entry to its channel's window.
    pub fn push_local(&mut self, msg: Message) -> bool {
        self.windows
            .get_mut(&msg.channel)
            .is_some_and(|w| w.merge(msg) == MergeOutcome::Inserted)
    }

    /// Entry carrying `id` in `channel`.
    pub fn find_by_correlation(&self, channel: &ChannelKey, id: &CorrelationId) -> Option<&Message> {
        self.windows.get(channel)?.find_by_correlation(id)
    }

    /// Channel whose window holds an entry carrying `id`.
    pub fn locate_correlation(&self, id: &CorrelationId) -> Option<ChannelKey> {
        self.windows
            .iter()
            .find(|(_, w)| w.find_by_correlation(id).is_some())
            .map(|(k, _)| k.clone())
    }

    /// Mutate the entry carrying `id`. Returns whether the entry changed.
    pub fn update_local(
        &mut self,
        channel: &ChannelKey,
        id: &CorrelationId,
        f: impl FnOnce(&mut Message),
    ) -> bool {
        let Some(window) = self.windows.get_mut(channel) else {
            return false;
        };
        let Some(idx) = window
            .messages
            .iter()
            .position(|m| m.correlation_id.as_ref() == Some(id))
        else {
            return false;
        };
        let before = window.messages[idx].clone();
        f(&mut window.messages[idx]);
        if window.messages[idx] == before {
            return false;
        }
        if window.messages[idx].sequence != before.sequence {
            // newly confirmed: move into sequence order
            let entry = window.messages.remove(idx);
            window.merge(entry);
        }
        true
    }

    /// Attach `info` to every materialized message authored by `uid`.
    ///
    /// Returns the channels whose windows changed.
    pub fn apply_sender_info(&mut self, uid: &str, info: &ChannelInfo) -> Vec<ChannelKey> {
        let mut changed = Vec::new();
        for (key, window) in &mut self.windows {
            let mut touched = false;
            for msg in window.messages.iter_mut().filter(|m| m.from_uid == uid) {
                let mut current = msg.sender_info.clone().unwrap_or_default();
                if current.overlay(info) {
                    msg.sender_info = Some(current);
                    touched = true;
                }
            }
            if touched {
                changed.push(key.clone());
            }
        }
        changed
    }

    fn epoch(&self, channel: &ChannelKey) -> u64 {
        self.epochs.get(channel).copied().unwrap_or_default()
    }

    fn bump_epoch(&mut self, channel: &ChannelKey) {
        *self.epochs.entry(channel.clone()).or_default() += 1;
    }
}

impl ChatEngine {
    /// Fetch the most recent `limit` messages of `channel`.
    ///
    /// Returns `Ok(false)` when the fetch was suppressed or changed nothing.
    pub async fn load_initial(&self, channel: &ChannelKey, limit: u32) -> Result<bool> {
        let ticket = self
            .inner
            .state
            .lock()
            .await
            .pager
            .begin(channel, FetchKind::Initial, limit);
        match ticket {
            Some(ticket) => self.run_fetch(ticket).await,
            None => Ok(false),
        }
    }

    /// Fetch up to `limit` messages older than the window.
    pub async fn load_older(&self, channel: &ChannelKey, limit: u32) -> Result<bool> {
        let ticket = self
            .inner
            .state
            .lock()
            .await
            .pager
            .begin(channel, FetchKind::Older, limit);
        match ticket {
            Some(ticket) => self.run_fetch(ticket).await,
            None => Ok(false),
        }
    }

    /// Fetch up to `limit` messages newer than the window.
    pub async fn load_newer(&self, channel: &ChannelKey, limit: u32) -> Result<bool> {
        let ticket = self
            .inner
            .state
            .lock()
            .await
            .pager
            .begin(channel, FetchKind::Newer, limit);
        match ticket {
            Some(ticket) => self.run_fetch(ticket).await,
            None => Ok(false),
        }
    }

    /// Replace the window with `total_limit` messages around `target`.
    pub async fn load_context(
        &self,
        channel: &ChannelKey,
        target: u64,
        total_limit: u32,
    ) -> Result<bool> {
        let Some(ticket) = self
            .inner
            .state
            .lock()
            .await
            .pager
            .begin_context(channel, target, total_limit)
        else {
            return Ok(false);
        };
        debug!(channel = %channel, target, "loading context");
        let history = &self.inner.apis.history;
        let (older, newer) = futures::join!(history.fetch(&ticket.older), history.fetch(&ticket.newer));

        let mut st = self.inner.state.lock().await;
        let (mut older, mut newer) = match (older, newer) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => {
                st.pager.abort(channel, FetchKind::Context);
                warn!(channel = %channel, error = %e, "context fetch failed");
                return Err(e);
            }
        };
        self.classify_all(&mut older.messages);
        self.classify_all(&mut newer.messages);
        let changed = st.pager.complete_context(&ticket, older, newer);
        drop(st);
        if changed {
            self.emit([EngineEvent::WindowChanged(channel.clone())]);
        }
        Ok(changed)
    }

    /// Reset the window of `channel`.
    pub async fn clear_history(&self, channel: &ChannelKey) -> bool {
        let cleared = self.inner.state.lock().await.pager.clear(channel);
        if cleared {
            self.emit([EngineEvent::WindowChanged(channel.clone())]);
        }
        cleared
    }

    async fn run_fetch(&self, ticket: FetchTicket) -> Result<bool> {
        let result = self.inner.apis.history.fetch(&ticket.request).await;
        let mut st = self.inner.state.lock().await;
        let mut page = match result {
            Ok(page) => page,
            Err(e) => {
                st.pager.abort(&ticket.channel, ticket.kind);
                warn!(channel = %ticket.channel, kind = ?ticket.kind, error = %e, "history fetch failed");
                return Err(e);
            }
        };
        self.classify_all(&mut page.messages);
        let changed = st.pager.complete(&ticket, page);
        drop(st);
        if changed {
            self.emit([EngineEvent::WindowChanged(ticket.channel)]);
        }
        Ok(changed)
    }
}
