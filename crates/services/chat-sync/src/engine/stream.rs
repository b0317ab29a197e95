//! Incremental AI response assembly.
//!
//! At most one session is active. A session ends through an explicit end
//! signal, a new send (cancel) or the safety timeout; all three settle the
//! owning message the same way.

use super::scheduler::TimerKey;
use super::{ChatEngine, EngineEvent, SyncState};
use crate::types::channel::ChannelKey;
use crate::types::event::StreamSignal;
use crate::types::message::{CorrelationId, Message};
use crate::types::payload::Payload;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Remembered ids of recently closed sessions, so late chunks are dropped
/// instead of reopening them.
const CLOSED_HISTORY: usize = 64;

/// One in-flight AI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    /// Correlation id of the AI message.
    pub correlation_id: CorrelationId,
    /// Channel the response belongs to, when known.
    pub channel: Option<ChannelKey>,
    /// Accumulated text.
    pub buffer: String,
    /// Whether the explicit start signal has been seen.
    pub started: bool,
    /// When the safety timeout fires.
    pub deadline: Instant,
}

/// Result of opening (or re-opening) a session.
#[derive(Debug)]
pub struct Opened {
    /// Previously active session that was displaced.
    pub displaced: Option<StreamSession>,
    /// Whether a new session was created (as opposed to an existing one
    /// being marked started).
    pub created: bool,
}

/// Single-active-session stream state.
#[derive(Debug)]
pub struct StreamAssembler {
    current: Option<StreamSession>,
    closed: VecDeque<CorrelationId>,
    timeout: Duration,
}

impl StreamAssembler {
    /// Create an assembler with the given safety timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            current: None,
            closed: VecDeque::new(),
            timeout,
        }
    }

    /// Whether a session is active.
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Correlation id of the active session.
    pub fn active_id(&self) -> Option<&CorrelationId> {
        self.current.as_ref().map(|s| &s.correlation_id)
    }

    /// The active session.
    pub fn current(&self) -> Option<&StreamSession> {
        self.current.as_ref()
    }

    /// Whether `id` belongs to a session that already ended.
    pub fn is_closed(&self, id: &CorrelationId) -> bool {
        self.closed.contains(id)
    }

    /// Explicit start signal.
    ///
    /// Returns `None` when `id` already ended. Starting an id whose chunks
    /// raced ahead keeps the accumulated buffer.
    pub fn start(&mut self, id: &CorrelationId, channel: Option<&ChannelKey>) -> Option<Opened> {
        let opened = self.open(id, channel)?;
        if let Some(session) = self.current.as_mut() {
            session.started = true;
        }
        Some(opened)
    }

    /// Append a chunk, implicitly opening the session if needed.
    ///
    /// Returns `None` when `id` already ended.
    pub fn append(
        &mut self,
        id: &CorrelationId,
        chunk: &str,
        channel: Option<&ChannelKey>,
    ) -> Option<Opened> {
        let opened = self.open(id, channel)?;
        if let Some(session) = self.current.as_mut() {
            session.buffer.push_str(chunk);
        }
        Some(opened)
    }

    /// End the session `id`. Returns the session if it was the active one.
    pub fn finalize(&mut self, id: &CorrelationId) -> Option<StreamSession> {
        if self.active_id() != Some(id) {
            self.remember_closed(id.clone());
            return None;
        }
        self.take_current()
    }

    /// Drop the active session regardless of its id.
    pub fn cancel(&mut self) -> Option<StreamSession> {
        self.take_current()
    }

    fn open(&mut self, id: &CorrelationId, channel: Option<&ChannelKey>) -> Option<Opened> {
        if self.is_closed(id) {
            return None;
        }
        if let Some(session) = self.current.as_mut().filter(|s| &s.correlation_id == id) {
            if session.channel.is_none() {
                session.channel = channel.cloned();
            }
            return Some(Opened {
                displaced: None,
                created: false,
            });
        }
        let displaced = self.take_current();
        self.current = Some(StreamSession {
            correlation_id: id.clone(),
            channel: channel.cloned(),
            buffer: String::new(),
            started: false,
            deadline: Instant::now() + self.timeout,
        });
        Some(Opened {
            displaced,
            created: true,
        })
    }

    fn take_current(&mut self) -> Option<StreamSession> {
        let session = self.current.take()?;
        self.remember_closed(session.correlation_id.clone());
        Some(session)
    }

    fn remember_closed(&mut self, id: CorrelationId) {
        if self.closed.contains(&id) {
            return;
        }
        if self.closed.len() == CLOSED_HISTORY {
            self.closed.pop_front();
        }
        self.closed.push_back(id);
    }
}

/// Move a finished session's text into its message.
fn settle_message(msg: &mut Message, buffer: &str, error: Option<&str>) {
    if !buffer.is_empty() && matches!(msg.payload, Payload::Loading | Payload::Text { .. }) {
        msg.payload = Payload::text(buffer);
    }
    msg.stream_buffer = None;
    if let Some(error) = error {
        msg.error_message = Some(error.to_string());
    }
}

impl ChatEngine {
    /// Route one stream signal.
    pub(crate) async fn on_stream_signal(
        &self,
        channel: Option<ChannelKey>,
        signal: StreamSignal,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let mut st = self.inner.state.lock().await;
        let was_busy = st.streams.is_busy();
        match signal {
            StreamSignal::Start { id } => {
                let Some(opened) = st.streams.start(&id, channel.as_ref()) else {
                    debug!(correlation_id = %id, "start for closed stream ignored");
                    return events;
                };
                self.after_open(&mut st, &id, opened, &mut events);
            }
            StreamSignal::Content { id, data } => {
                let Some(opened) = st.streams.append(&id, &data, channel.as_ref()) else {
                    debug!(correlation_id = %id, "chunk for closed stream dropped");
                    return events;
                };
                if opened.created {
                    debug!(correlation_id = %id, "chunk arrived before start");
                }
                self.after_open(&mut st, &id, opened, &mut events);
                let buffer = st
                    .streams
                    .current()
                    .map(|s| s.buffer.clone())
                    .unwrap_or_default();
                if let Some(ch) = Self::stream_channel(&st, &id) {
                    if st.pager.update_local(&ch, &id, |m| {
                        m.stream_buffer = Some(buffer);
                    }) {
                        events.push(EngineEvent::WindowChanged(ch));
                    }
                }
            }
            StreamSignal::End { id, error } => {
                if let Some(error) = &error {
                    warn!(correlation_id = %id, error = %error, "stream ended with error");
                }
                let session = st.streams.finalize(&id);
                self.close_session(&mut st, &id, session, error.as_deref(), &mut events);
            }
        }
        if st.streams.is_busy() != was_busy {
            events.push(EngineEvent::StreamChanged {
                busy: st.streams.is_busy(),
            });
        }
        events
    }

    fn after_open(
        &self,
        st: &mut SyncState,
        id: &CorrelationId,
        opened: Opened,
        events: &mut Vec<EngineEvent>,
    ) {
        if let Some(displaced) = opened.displaced {
            info!(
                displaced = %displaced.correlation_id,
                correlation_id = %id,
                "new stream displaced active stream"
            );
            let displaced_id = displaced.correlation_id.clone();
            self.close_session(st, &displaced_id, Some(displaced), None, events);
        }
        if opened.created {
            self.arm_stream_timeout(st, id.clone());
        }
        if let Some(ch) = Self::stream_channel(st, id) {
            if st.pager.find_by_correlation(&ch, id).is_none() {
                let mut placeholder = Message::new(ch.clone(), Payload::Loading);
                placeholder.correlation_id = Some(id.clone());
                placeholder.timestamp = chrono::Utc::now().timestamp();
                placeholder.stream_buffer = Some(String::new());
                if st.pager.push_local(placeholder) {
                    events.push(EngineEvent::WindowChanged(ch));
                }
            } else if st.pager.update_local(&ch, id, |m| {
                if m.stream_buffer.is_none() {
                    m.stream_buffer = Some(String::new());
                }
            }) {
                events.push(EngineEvent::WindowChanged(ch));
            }
        }
    }

    /// Settle the message of a finished (or unknown) session.
    fn close_session(
        &self,
        st: &mut SyncState,
        id: &CorrelationId,
        session: Option<StreamSession>,
        error: Option<&str>,
        events: &mut Vec<EngineEvent>,
    ) {
        st.timers.cancel(&TimerKey::StreamTimeout(id.clone()));
        let buffer = session.as_ref().map(|s| s.buffer.clone()).unwrap_or_default();
        let channel = session
            .and_then(|s| s.channel)
            .or_else(|| st.pager.locate_correlation(id));
        let Some(ch) = channel else {
            return;
        };
        if st
            .pager
            .update_local(&ch, id, |m| settle_message(m, &buffer, error))
        {
            events.push(EngineEvent::WindowChanged(ch));
        }
    }

    fn stream_channel(st: &SyncState, id: &CorrelationId) -> Option<ChannelKey> {
        st.streams
            .current()
            .filter(|s| &s.correlation_id == id)
            .and_then(|s| s.channel.clone())
            .or_else(|| st.pager.locate_correlation(id))
            .or_else(|| st.active_channel.clone())
    }

    fn arm_stream_timeout(&self, st: &mut SyncState, id: CorrelationId) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.stream_timeout();
        st.timers
            .schedule(TimerKey::StreamTimeout(id.clone()), timeout, async move {
                if let Some(engine) = ChatEngine::upgrade(&weak) {
                    engine.expire_stream(&id).await;
                }
            });
    }

    /// Safety net: close a silent stream as if it ended without error.
    async fn expire_stream(&self, id: &CorrelationId) {
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock().await;
            let Some(session) = st.streams.finalize(id) else {
                return;
            };
            info!(correlation_id = %id, "stream timed out");
            self.close_session(&mut st, id, Some(session), None, &mut events);
            events.push(EngineEvent::StreamChanged { busy: false });
        }
        self.emit(events);
    }

    /// Interrupt the active stream.
    ///
    /// The server is notified best-effort; local busy state is cleared
    /// whatever the outcome. Returns whether a stream was active.
    pub async fn cancel_stream(&self, reason: Option<&str>) -> bool {
        let Some(id) = self.inner.state.lock().await.streams.active_id().cloned() else {
            return false;
        };
        if let Err(e) = self.inner.apis.sender.cancel_stream(&id, reason).await {
            warn!(correlation_id = %id, error = %e, "stream cancel request failed");
        }

        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock().await;
            if st.streams.active_id() == Some(&id) {
                let session = st.streams.cancel();
                self.close_session(&mut st, &id, session, None, &mut events);
                events.push(EngineEvent::StreamChanged { busy: false });
                info!(correlation_id = %id, "stream cancelled");
            }
        }
        self.emit(events);
        true
    }
}
