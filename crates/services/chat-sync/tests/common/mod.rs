//! In-memory backend shared by the engine flow tests.

use async_trait::async_trait;
use chat_sync::backend::{
    ConversationApi, HistoryApi, ProgressSender, SendApi, Transport, TransportSubscription,
    UploadApi,
};
use chat_sync::types::api::{
    HistoryPage, HistoryRequest, OutboundPacket, PullMode, PushAck, SendRequest, SendResponse,
    SendStatus, SyncRequest, SyncResponse, UploadRequest, UploadedFile,
};
use chat_sync::types::channel::{ChannelKey, ChannelType};
use chat_sync::types::event::TransportEvent;
use chat_sync::types::message::{CorrelationId, Message};
use chat_sync::types::payload::Payload;
use chat_sync::{ChatEngine, ChatSyncError, Collaborators, EngineConfig, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

pub const SELF_UID: &str = "staff-1";
pub const VISITOR_UID: &str = "visitor-1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn channel(id: &str) -> ChannelKey {
    ChannelKey::new(id, ChannelType::CUSTOMER_SERVICE)
}

/// A server-confirmed text message.
pub fn confirmed(channel: &ChannelKey, seq: u64, from_uid: &str, text: &str) -> Message {
    let mut msg = Message::new(channel.clone(), Payload::text(text));
    msg.sequence = seq;
    msg.message_id = format!("m{seq}");
    msg.from_uid = from_uid.to_string();
    msg.timestamp = 1_700_000_000 + seq as i64;
    msg
}

/// Consume one scripted failure, if any are left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// How the next upload behaves.
#[derive(Debug, Clone, Copy)]
pub enum UploadScript {
    /// Report 50 and 100, then succeed.
    Succeed,
    /// Report the given percent, then fail.
    FailAt(u8),
    /// Report the given percent, then wait for the abort signal.
    HoldAt(u8),
}

/// Recording implementation of every collaborator.
#[derive(Default)]
pub struct MockBackend {
    pub history: Mutex<HashMap<ChannelKey, Vec<Message>>>,
    pub history_requests: Mutex<Vec<HistoryRequest>>,
    pub failing_fetches: AtomicUsize,
    pub sync_response: Mutex<SyncResponse>,
    pub sync_requests: Mutex<Vec<SyncRequest>>,
    pub sync_delay: Mutex<Option<Duration>>,
    pub unread_calls: Mutex<Vec<(ChannelKey, u32)>>,
    pub deletes: Mutex<Vec<ChannelKey>>,
    pub sends: Mutex<Vec<SendRequest>>,
    pub failing_sends: AtomicUsize,
    send_gate: Mutex<Option<Arc<Notify>>>,
    pub cancels: Mutex<Vec<(CorrelationId, Option<String>)>>,
    pub uploads: Mutex<Vec<UploadRequest>>,
    pub upload_scripts: Mutex<VecDeque<UploadScript>>,
    pub pushes: Mutex<Vec<OutboundPacket>>,
    pub failing_pushes: AtomicUsize,
    push_gate: Mutex<Option<Arc<Notify>>>,
    pub next_seq: AtomicU64,
    pub connects: AtomicUsize,
    feed: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.next_seq.store(100, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn seed_history(&self, channel: &ChannelKey, seqs: impl IntoIterator<Item = u64>) {
        let messages = seqs
            .into_iter()
            .map(|seq| confirmed(channel, seq, VISITOR_UID, &format!("msg {seq}")))
            .collect();
        self.history
            .lock()
            .unwrap()
            .insert(channel.clone(), messages);
    }

    pub fn history_requests(&self) -> Vec<HistoryRequest> {
        self.history_requests.lock().unwrap().clone()
    }

    pub fn sync_count(&self) -> usize {
        self.sync_requests.lock().unwrap().len()
    }

    pub fn unread_calls(&self) -> Vec<(ChannelKey, u32)> {
        self.unread_calls.lock().unwrap().clone()
    }

    pub fn script_upload(&self, script: UploadScript) {
        self.upload_scripts.lock().unwrap().push_back(script);
    }

    /// Park every send until the returned handle is notified.
    pub fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Park every transport push until the returned handle is notified.
    pub fn hold_pushes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.push_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Deliver an event on the live subscription.
    pub async fn feed(&self, event: TransportEvent) {
        let tx = self.feed.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(event).await.unwrap();
        }
    }

    pub fn engine(self: &Arc<Self>) -> ChatEngine {
        let config = EngineConfig {
            self_uid: SELF_UID.to_string(),
            ..EngineConfig::default()
        };
        self.engine_with(config)
    }

    pub fn engine_with(self: &Arc<Self>, config: EngineConfig) -> ChatEngine {
        let transport: Arc<dyn Transport> = Arc::clone(self) as Arc<dyn Transport>;
        ChatEngine::new(config, Collaborators::from_api(Arc::clone(self), transport))
    }
}

#[async_trait]
impl HistoryApi for MockBackend {
    async fn fetch(&self, req: &HistoryRequest) -> Result<HistoryPage> {
        self.history_requests.lock().unwrap().push(req.clone());
        if take_one(&self.failing_fetches) {
            return Err(ChatSyncError::Network("connection reset".into()));
        }
        let all = self
            .history
            .lock()
            .unwrap()
            .get(&req.channel)
            .cloned()
            .unwrap_or_default();
        let limit = req.limit as usize;
        let (messages, more) = match req.pull_mode {
            PullMode::Down => {
                let below: Vec<Message> = all
                    .into_iter()
                    .filter(|m| req.start_message_seq == 0 || m.sequence < req.start_message_seq)
                    .collect();
                let skip = below.len().saturating_sub(limit);
                (below[skip..].to_vec(), skip > 0)
            }
            PullMode::Up => {
                let above: Vec<Message> = all
                    .into_iter()
                    .filter(|m| m.sequence > req.start_message_seq)
                    .collect();
                let more = above.len() > limit;
                (above.into_iter().take(limit).collect(), more)
            }
        };
        Ok(HistoryPage {
            messages,
            more,
            next_start_seq: None,
        })
    }
}

#[async_trait]
impl ConversationApi for MockBackend {
    async fn sync(&self, req: &SyncRequest) -> Result<SyncResponse> {
        self.sync_requests.lock().unwrap().push(req.clone());
        let delay = *self.sync_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.sync_response.lock().unwrap().clone())
    }

    async fn set_unread(&self, channel: &ChannelKey, unread: u32) -> Result<()> {
        self.unread_calls
            .lock()
            .unwrap()
            .push((channel.clone(), unread));
        Ok(())
    }

    async fn delete(&self, channel: &ChannelKey) -> Result<()> {
        self.deletes.lock().unwrap().push(channel.clone());
        Ok(())
    }
}

#[async_trait]
impl SendApi for MockBackend {
    async fn send(&self, req: &SendRequest) -> Result<SendResponse> {
        self.sends.lock().unwrap().push(req.clone());
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if take_one(&self.failing_sends) {
            return Err(ChatSyncError::Network("connection reset".into()));
        }
        Ok(SendResponse {
            status: SendStatus::Ok,
            message: None,
        })
    }

    async fn cancel_stream(&self, correlation_id: &CorrelationId, reason: Option<&str>) -> Result<()> {
        self.cancels
            .lock()
            .unwrap()
            .push((correlation_id.clone(), reason.map(str::to_string)));
        Ok(())
    }
}

#[async_trait]
impl UploadApi for MockBackend {
    async fn upload(
        &self,
        req: UploadRequest,
        progress: ProgressSender,
        abort: tokio_util::sync::CancellationToken,
    ) -> Result<UploadedFile> {
        let name = req.file.name.clone();
        let size = req.file.size();
        self.uploads.lock().unwrap().push(req);
        let script = self
            .upload_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(UploadScript::Succeed);
        match script {
            UploadScript::Succeed => {
                let _ = progress.send(50);
                let _ = progress.send(100);
                Ok(UploadedFile {
                    file_id: "f1".into(),
                    file_name: name.clone(),
                    file_size: size,
                    file_type: String::new(),
                    file_url: format!("/files/{name}"),
                })
            }
            UploadScript::FailAt(pct) => {
                let _ = progress.send(pct);
                Err(ChatSyncError::http(500, "storage unavailable"))
            }
            UploadScript::HoldAt(pct) => {
                let _ = progress.send(pct);
                abort.cancelled().await;
                Err(ChatSyncError::Aborted)
            }
        }
    }
}

#[async_trait]
impl Transport for MockBackend {
    async fn connect(&self) -> Result<TransportSubscription> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.feed.lock().unwrap() = Some(tx);
        Ok(TransportSubscription::from_receiver(rx))
    }

    async fn push(&self, packet: &OutboundPacket) -> Result<PushAck> {
        self.pushes.lock().unwrap().push(packet.clone());
        let gate = self.push_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if take_one(&self.failing_pushes) {
            return Err(ChatSyncError::Network("transport closed".into()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        Ok(PushAck {
            reason_code: 1,
            message_id: Some(format!("m{seq}")),
            message_seq: Some(seq),
        })
    }
}
