//! Routing of inbound transport events.

use super::{ChatEngine, EngineEvent};
use crate::types::event::TransportEvent;
use crate::types::message::{Message, SenderRole};
use tracing::{debug, trace};

impl ChatEngine {
    /// Apply one transport event.
    ///
    /// The pump started by [`connect`](Self::connect) calls this for every
    /// event; it is public so other transports can feed the engine directly.
    pub async fn ingest(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message { message } => self.on_message(message).await,
            TransportEvent::Status { status } => self.on_status(status).await,
            TransportEvent::Custom(custom) => {
                trace!(signal = ?custom.signal, "stream signal");
                let events = self.on_stream_signal(custom.channel, custom.signal).await;
                self.emit(events);
            }
            TransportEvent::Unknown => debug!("unknown transport event ignored"),
        }
    }

    async fn on_message(&self, mut msg: Message) {
        self.classify(&mut msg);
        let mut events = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;

            // an echo of our own send confirms the transfer
            if let Some(id) = msg.correlation_id.as_ref().filter(|_| msg.is_confirmed()) {
                if msg.role == SenderRole::Me && st.transfers.settle(id) {
                    debug!(correlation_id = %id, "transfer confirmed by echo");
                    events.push(EngineEvent::TransferChanged(id.clone()));
                }
            }

            if st
                .conversations
                .apply_message(&msg, st.active_channel.as_ref())
            {
                events.push(EngineEvent::ConversationsChanged);
            }
            let channel = msg.channel.clone();
            if st.pager.ingest_live(msg) {
                events.push(EngineEvent::WindowChanged(channel));
            }
        }
        self.emit(events);
    }

    /// Resolve the sender role against the local uid.
    pub(crate) fn classify(&self, msg: &mut Message) {
        let self_uid = &self.inner.config.self_uid;
        msg.role = if !self_uid.is_empty() && &msg.from_uid == self_uid {
            SenderRole::Me
        } else {
            SenderRole::Counterparty
        };
    }

    pub(crate) fn classify_all(&self, messages: &mut [Message]) {
        for msg in messages {
            self.classify(msg);
        }
    }
}
