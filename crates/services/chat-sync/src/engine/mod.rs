//! The chat synchronization engine.
//!
//! [`ChatEngine`] owns all session state (conversation list, history
//! windows, stream sessions, pending transfers, timers) behind one async
//! mutex. State is only mutated inside short synchronous sections; network
//! calls and timers run with the lock released, and their results are
//! merged with idempotent rules.

pub mod connection;
pub mod conversation;
pub mod history;
pub mod identity;
pub mod ingest;
pub mod scheduler;
pub mod send;
pub mod stream;
pub mod unread;

use crate::backend::{ConversationApi, HistoryApi, SendApi, Transport, UploadApi};
use crate::config::EngineConfig;
use crate::types::channel::ChannelKey;
use crate::types::conversation::Conversation;
use crate::types::event::ConnectionStatus;
use crate::types::message::{CorrelationId, Message};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;

pub use connection::{ConnectionCoordinator, StatusChange};
pub use conversation::ConversationIndex;
pub use history::{HistoryPager, HistoryWindow, MergeOutcome};
pub use identity::{MessageIdentity, channel_key, identity_of};
pub use scheduler::{Debouncer, TimerKey};
pub use send::{SendPipeline, TransferKind, TransferState, TransferSummary};
pub use stream::{StreamAssembler, StreamSession};
pub use unread::UnreadCoordinator;

/// Capacity of the change-notification channel.
const EVENT_CAPACITY: usize = 256;

/// Change notification for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The conversation list changed.
    ConversationsChanged,
    /// A history window changed.
    WindowChanged(ChannelKey),
    /// The busy flag of AI streaming flipped.
    StreamChanged {
        /// Whether a stream is active.
        busy: bool,
    },
    /// Transport status changed.
    ConnectionChanged(ConnectionStatus),
    /// A send or upload changed state.
    TransferChanged(CorrelationId),
}

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    /// History API.
    pub history: Arc<dyn HistoryApi>,
    /// Conversation sync API.
    pub conversations: Arc<dyn ConversationApi>,
    /// Send API.
    pub sender: Arc<dyn SendApi>,
    /// Upload API.
    pub uploads: Arc<dyn UploadApi>,
    /// Real-time transport.
    pub transport: Arc<dyn Transport>,
}

impl Collaborators {
    /// Use one value for the four request/response APIs.
    pub fn from_api<A>(api: Arc<A>, transport: Arc<dyn Transport>) -> Self
    where
        A: HistoryApi + ConversationApi + SendApi + UploadApi + 'static,
    {
        Self {
            history: Arc::clone(&api) as Arc<dyn HistoryApi>,
            conversations: Arc::clone(&api) as Arc<dyn ConversationApi>,
            sender: Arc::clone(&api) as Arc<dyn SendApi>,
            uploads: api,
            transport,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SyncGuard {
    pub(crate) in_flight: bool,
    pub(crate) synced: bool,
}

pub(crate) struct SyncState {
    pub(crate) active_channel: Option<ChannelKey>,
    pub(crate) conversations: ConversationIndex,
    pub(crate) pager: HistoryPager,
    pub(crate) streams: StreamAssembler,
    pub(crate) transfers: SendPipeline,
    pub(crate) connection: ConnectionCoordinator,
    pub(crate) unread: UnreadCoordinator,
    pub(crate) timers: Debouncer<TimerKey>,
    pub(crate) sync: SyncGuard,
    pub(crate) pump: Option<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) apis: Collaborators,
    pub(crate) state: Mutex<SyncState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(pump) = st.pump.take() {
            pump.abort();
        }
        st.timers.cancel_all();
    }
}

/// Handle to a chat engine session. Cheap to clone.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    /// Create an engine over the given collaborators.
    pub fn new(config: EngineConfig, apis: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SyncState {
            active_channel: None,
            conversations: ConversationIndex::new(),
            pager: HistoryPager::new(),
            streams: StreamAssembler::new(config.stream_timeout()),
            transfers: SendPipeline::new(),
            connection: ConnectionCoordinator::new(),
            unread: UnreadCoordinator::new(config.unread_ack_debounce()),
            timers: Debouncer::new(),
            sync: SyncGuard::default(),
            pump: None,
        };
        Self {
            inner: Arc::new(EngineInner {
                config,
                apis,
                state: Mutex::new(state),
                events,
            }),
        }
    }

    pub(crate) fn upgrade(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            // no receivers is fine
            let _ = self.inner.events.send(event);
        }
    }

    /// Open `channel`: make it active, clear its unread count and load the
    /// most recent page.
    pub async fn open_channel(&self, channel: &ChannelKey) -> crate::error::Result<()> {
        {
            let mut st = self.inner.state.lock().await;
            st.active_channel = Some(channel.clone());
            st.pager.open(channel);
        }
        debug!(channel = %channel, "channel opened");
        self.clear_unread(channel).await;
        self.load_initial(channel, self.inner.config.history_page_size)
            .await
            .map(|_| ())
    }

    /// Open `channel` centred on message `target`, e.g. when jumping to a
    /// search hit. The window is detached from the live edge until
    /// `load_newer` reaches it.
    pub async fn open_channel_at(&self, channel: &ChannelKey, target: u64) -> crate::error::Result<()> {
        self.inner.state.lock().await.active_channel = Some(channel.clone());
        debug!(channel = %channel, target, "channel opened at message");
        self.clear_unread(channel).await;
        self.load_context(channel, target, self.inner.config.context_page_size)
            .await
            .map(|_| ())
    }

    /// Leave `channel`: drop its window and deactivate it.
    pub async fn close_channel(&self, channel: &ChannelKey) {
        {
            let mut st = self.inner.state.lock().await;
            if st.active_channel.as_ref() == Some(channel) {
                st.active_channel = None;
            }
        }
        self.clear_history(channel).await;
    }

    /// Append an optimistic message to its window and conversation.
    pub(crate) fn add_local(&self, st: &mut SyncState, msg: Message) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let channel = msg.channel.clone();
        if st
            .conversations
            .apply_message(&msg, st.active_channel.as_ref())
        {
            events.push(EngineEvent::ConversationsChanged);
        }
        if st.pager.push_local(msg) {
            events.push(EngineEvent::WindowChanged(channel));
        }
        events
    }

    /// Mutate the message carrying `id`, notifying when it changed.
    pub(crate) fn update_message(
        &self,
        st: &mut SyncState,
        channel: &ChannelKey,
        id: &CorrelationId,
        f: impl FnOnce(&mut Message),
    ) -> bool {
        let changed = st.pager.update_local(channel, id, f);
        if changed {
            self.emit([EngineEvent::WindowChanged(channel.clone())]);
        }
        changed
    }

    // ---- snapshots ----

    /// Conversations, most recent first.
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.lock().await.conversations.list().to_vec()
    }

    /// Conversation of `channel`.
    pub async fn conversation(&self, channel: &ChannelKey) -> Option<Conversation> {
        self.inner
            .state
            .lock()
            .await
            .conversations
            .get(channel)
            .cloned()
    }

    /// History window of `channel`.
    pub async fn window(&self, channel: &ChannelKey) -> Option<HistoryWindow> {
        self.inner.state.lock().await.pager.window(channel).cloned()
    }

    /// Currently open channel.
    pub async fn active_channel(&self) -> Option<ChannelKey> {
        self.inner.state.lock().await.active_channel.clone()
    }

    /// Whether an AI stream is active.
    pub async fn is_streaming(&self) -> bool {
        self.inner.state.lock().await.streams.is_busy()
    }

    /// Transport status.
    pub async fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().await.connection.status()
    }

    /// In-flight and retryable transfers.
    pub async fn pending_transfers(&self) -> Vec<TransferSummary> {
        self.inner.state.lock().await.transfers.summaries()
    }

    /// Local conversation version watermark.
    pub async fn version(&self) -> u64 {
        self.inner.state.lock().await.conversations.version()
    }
}
