//! Optimistic unread clearing with a debounced server acknowledgment.

use super::scheduler::{Debouncer, TimerKey};
use super::{ChatEngine, EngineEvent};
use crate::backend::ConversationApi;
use crate::engine::conversation::ConversationIndex;
use crate::types::channel::ChannelKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Clears unread counts locally and schedules one acknowledgment per
/// channel per debounce window.
#[derive(Debug, Clone, Copy)]
pub struct UnreadCoordinator {
    delay: Duration,
}

impl UnreadCoordinator {
    /// Create a coordinator with the given debounce delay.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Zero the unread count of `channel` and schedule the acknowledgment.
    ///
    /// No-op (returns `false`) when the count is already zero. Acknowledgment
    /// failures are logged; the local state is not reverted.
    pub fn clear(
        &self,
        index: &mut ConversationIndex,
        timers: &mut Debouncer<TimerKey>,
        channel: &ChannelKey,
        api: Arc<dyn ConversationApi>,
    ) -> bool {
        let Some(previous) = index.clear_unread(channel) else {
            debug!(channel = %channel, "unread already zero");
            return false;
        };
        debug!(channel = %channel, previous, "unread cleared");
        let target = channel.clone();
        timers.schedule(TimerKey::UnreadAck(channel.clone()), self.delay, async move {
            if let Err(e) = api.set_unread(&target, 0).await {
                warn!(channel = %target, error = %e, "unread acknowledgment failed");
            }
        });
        true
    }
}

impl ChatEngine {
    /// Clear the unread count of `channel`. Returns whether anything changed.
    pub async fn clear_unread(&self, channel: &ChannelKey) -> bool {
        let cleared = {
            let mut st = self.inner.state.lock().await;
            let st = &mut *st;
            st.unread.clear(
                &mut st.conversations,
                &mut st.timers,
                channel,
                Arc::clone(&self.inner.apis.conversations),
            )
        };
        if cleared {
            self.emit([EngineEvent::ConversationsChanged]);
        }
        cleared
    }
}
