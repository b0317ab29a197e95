//! Optimistic sends and uploads.
//!
//! Every attempt resolves to a visible state on its message: confirmed,
//! failed with a reason code, failed with an upload error, or cancelled.
//! Failed transfers stay in the registry so they can be retried; settled or
//! cancelled ones leave it.

use super::{ChatEngine, EngineEvent};
use crate::backend::ProgressSender;
use crate::error::{ChatSyncError, Result};
use crate::types::api::{
    OutboundFile, OutboundPacket, PushAck, SendRequest, SendStatus, UploadRequest, UploadedFile,
};
use crate::types::channel::ChannelKey;
use crate::types::message::{
    CorrelationId, Message, REASON_SEND_FAILED, REASON_SUCCESS, TransferStatus,
};
use crate::types::payload::Payload;
use std::collections::HashMap;
use std::io::Cursor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reason passed to the server when a new send interrupts a stream.
const NEW_MESSAGE_REASON: &str = "new_message";

/// What a transfer carries.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferKind {
    /// Ready-to-send payload.
    Message(Payload),
    /// File to upload; `uploaded` is set once the upload succeeded.
    Upload {
        /// Original file, retained for retries.
        file: OutboundFile,
        /// Payload built from the upload response.
        uploaded: Option<Payload>,
    },
}

/// State of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// An attempt is running.
    InFlight(TransferStatus),
    /// The last attempt failed; retry is possible.
    Failed,
}

/// An in-flight or retryable send/upload.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    /// Correlation id shared with the optimistic message.
    pub correlation_id: CorrelationId,
    /// Target channel.
    pub channel: ChannelKey,
    /// Content.
    pub kind: TransferKind,
    /// Current state.
    pub state: TransferState,
    /// Number of attempts made.
    pub attempts: u32,
    abort: Option<CancellationToken>,
}

impl PendingTransfer {
    /// Payload ready to be sent, if any.
    pub fn payload(&self) -> Option<&Payload> {
        match &self.kind {
            TransferKind::Message(payload) => Some(payload),
            TransferKind::Upload { uploaded, .. } => uploaded.as_ref(),
        }
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Correlation id.
    pub correlation_id: CorrelationId,
    /// Target channel.
    pub channel: ChannelKey,
    /// Whether the entry is a file upload.
    pub is_upload: bool,
    /// Current state.
    pub state: TransferState,
    /// Attempts made.
    pub attempts: u32,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The running attempt was signalled to abort.
    AbortRequested,
    /// Nothing was running; the entry was dropped.
    CancelledLocally,
}

/// Registry of pending transfers, keyed by correlation id.
#[derive(Debug, Default)]
pub struct SendPipeline {
    transfers: HashMap<CorrelationId, PendingTransfer>,
}

impl SendPipeline {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transfer in flight.
    pub fn register(&mut self, correlation_id: CorrelationId, channel: ChannelKey, kind: TransferKind) {
        let status = match kind {
            TransferKind::Message(_) => TransferStatus::Sending,
            TransferKind::Upload { .. } => TransferStatus::Uploading,
        };
        self.transfers.insert(
            correlation_id.clone(),
            PendingTransfer {
                correlation_id,
                channel,
                kind,
                state: TransferState::InFlight(status),
                attempts: 1,
                abort: None,
            },
        );
    }

    /// Entry for `id`.
    pub fn get(&self, id: &CorrelationId) -> Option<&PendingTransfer> {
        self.transfers.get(id)
    }

    /// Failed entry for `id`. Errors when `id` is unknown or not failed.
    pub fn failed(&self, id: &CorrelationId) -> Result<&PendingTransfer> {
        let entry = self
            .transfers
            .get(id)
            .ok_or_else(|| ChatSyncError::State(format!("no pending transfer {id}")))?;
        if entry.state != TransferState::Failed {
            return Err(ChatSyncError::State(format!("transfer {id} is not retryable")));
        }
        Ok(entry)
    }

    /// Restart a failed transfer. Errors when `id` is unknown or not failed.
    pub fn begin_retry(&mut self, id: &CorrelationId, status: TransferStatus) -> Result<PendingTransfer> {
        self.failed(id)?;
        let Some(entry) = self.transfers.get_mut(id) else {
            return Err(ChatSyncError::State(format!("no pending transfer {id}")));
        };
        entry.state = TransferState::InFlight(status);
        entry.attempts += 1;
        Ok(entry.clone())
    }

    /// Move an upload on to the send step.
    pub fn mark_uploaded(&mut self, id: &CorrelationId, payload: Payload) {
        if let Some(entry) = self.transfers.get_mut(id) {
            if let TransferKind::Upload { uploaded, .. } = &mut entry.kind {
                *uploaded = Some(payload);
            }
            entry.state = TransferState::InFlight(TransferStatus::Sending);
            entry.abort = None;
        }
    }

    /// Attach the abort handle of the running attempt.
    pub fn attach_abort(&mut self, id: &CorrelationId, token: CancellationToken) {
        if let Some(entry) = self.transfers.get_mut(id) {
            entry.abort = Some(token);
        }
    }

    /// The attempt failed; keep the entry for retry.
    pub fn fail(&mut self, id: &CorrelationId) {
        if let Some(entry) = self.transfers.get_mut(id) {
            entry.state = TransferState::Failed;
            entry.abort = None;
        }
    }

    /// The transfer settled; drop it.
    pub fn settle(&mut self, id: &CorrelationId) -> bool {
        self.transfers.remove(id).is_some()
    }

    /// Cancel a transfer: abort the running upload, or drop the entry when
    /// nothing is running.
    ///
    /// A transfer in its send step cannot be cancelled; the message is
    /// already on its way to the server.
    pub fn cancel(&mut self, id: &CorrelationId) -> Result<CancelOutcome> {
        let entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| ChatSyncError::State(format!("no pending transfer {id}")))?;
        if entry.state == TransferState::InFlight(TransferStatus::Sending) {
            return Err(ChatSyncError::State(format!("transfer {id} is being sent")));
        }
        if let Some(token) = entry.abort.take() {
            token.cancel();
            return Ok(CancelOutcome::AbortRequested);
        }
        self.transfers.remove(id);
        Ok(CancelOutcome::CancelledLocally)
    }

    /// Snapshot of all entries.
    pub fn summaries(&self) -> Vec<TransferSummary> {
        let mut out: Vec<TransferSummary> = self
            .transfers
            .values()
            .map(|t| TransferSummary {
                correlation_id: t.correlation_id.clone(),
                channel: t.channel.clone(),
                is_upload: matches!(t.kind, TransferKind::Upload { .. }),
                state: t.state,
                attempts: t.attempts,
            })
            .collect();
        out.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        out
    }
}

/// Probe pixel dimensions of an image held in memory.
pub fn probe_image_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let reader = image::ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

/// Build the message payload for an uploaded file.
fn uploaded_payload(file: &OutboundFile, uploaded: &UploadedFile) -> Payload {
    if file.is_image() {
        let (width, height) = probe_image_dimensions(&file.data).unwrap_or_else(|e| {
            warn!(file = %file.name, error = %e, "image dimensions unavailable");
            (0, 0)
        });
        Payload::Image {
            url: uploaded.file_url.clone(),
            width,
            height,
            name: Some(file.name.clone()),
        }
    } else {
        Payload::File {
            url: uploaded.file_url.clone(),
            name: file.name.clone(),
            size: uploaded.file_size,
        }
    }
}

/// Placeholder payload shown while a file uploads.
fn pending_payload(file: &OutboundFile) -> Payload {
    if file.is_image() {
        Payload::Image {
            url: String::new(),
            width: 0,
            height: 0,
            name: Some(file.name.clone()),
        }
    } else {
        Payload::File {
            url: String::new(),
            name: file.name.clone(),
            size: file.size(),
        }
    }
}

impl ChatEngine {
    /// Send a text message to `channel`.
    ///
    /// An active stream is cancelled first. Returns the correlation id of
    /// the optimistic message; the send outcome is reflected on it.
    pub async fn send_text(&self, channel: &ChannelKey, text: impl Into<String>) -> CorrelationId {
        self.send_payload(channel, Payload::text(text)).await
    }

    /// Send an arbitrary payload to `channel`.
    pub async fn send_payload(&self, channel: &ChannelKey, payload: Payload) -> CorrelationId {
        self.cancel_stream(Some(NEW_MESSAGE_REASON)).await;

        let id = CorrelationId::generate();
        {
            let mut st = self.inner.state.lock().await;
            let msg = Message::local(
                channel.clone(),
                id.clone(),
                &self.inner.config.self_uid,
                payload.clone(),
                TransferStatus::Sending,
            );
            let mut events = self.add_local(&mut st, msg);
            st.transfers
                .register(id.clone(), channel.clone(), TransferKind::Message(payload));
            events.push(EngineEvent::TransferChanged(id.clone()));
            drop(st);
            self.emit(events);
        }
        debug!(correlation_id = %id, channel = %channel, "message queued");
        self.deliver(&id).await;
        id
    }

    /// Re-submit a failed message (or the send step of an uploaded file).
    ///
    /// Errors only when `id` is not a failed transfer.
    pub async fn retry(&self, id: &CorrelationId) -> Result<()> {
        {
            let mut st = self.inner.state.lock().await;
            let transfer = st.transfers.begin_retry(id, TransferStatus::Sending)?;
            if transfer.payload().is_none() {
                st.transfers.fail(id);
                return Err(ChatSyncError::State(format!(
                    "transfer {id} has not been uploaded; use retry_upload"
                )));
            }
            self.update_message(&mut st, &transfer.channel, id, |m| {
                m.status = Some(TransferStatus::Sending);
                m.reason_code = None;
            });
        }
        info!(correlation_id = %id, "retrying send");
        self.deliver(id).await;
        Ok(())
    }

    /// Submit the registry payload of `id` and push it over the transport.
    async fn deliver(&self, id: &CorrelationId) {
        let Some((channel, payload)) = self
            .inner
            .state
            .lock()
            .await
            .transfers
            .get(id)
            .and_then(|t| t.payload().map(|p| (t.channel.clone(), p.clone())))
        else {
            return;
        };

        let outcome = self.submit(&channel, id, payload).await;

        let mut st = self.inner.state.lock().await;
        if st.transfers.get(id).is_none() {
            // the echo confirmed the message while the push was pending
            debug!(correlation_id = %id, ok = outcome.is_ok(), "transfer already settled");
            return;
        }
        match outcome {
            Ok(ack) if ack.reason_code == REASON_SUCCESS => {
                st.transfers.settle(id);
                self.update_message(&mut st, &channel, id, |m| {
                    m.status = None;
                    m.reason_code = Some(ack.reason_code);
                    if let Some(seq) = ack.message_seq {
                        m.sequence = seq;
                    }
                    if let Some(message_id) = ack.message_id {
                        m.message_id = message_id;
                    }
                });
                debug!(correlation_id = %id, "message delivered");
            }
            Ok(ack) => {
                st.transfers.fail(id);
                warn!(correlation_id = %id, reason_code = ack.reason_code, "transport refused message");
                self.update_message(&mut st, &channel, id, |m| {
                    m.status = None;
                    m.reason_code = Some(ack.reason_code);
                });
            }
            Err(e) => {
                st.transfers.fail(id);
                warn!(correlation_id = %id, error = %e, class = ?e.class(), "send failed");
                self.update_message(&mut st, &channel, id, |m| {
                    m.status = None;
                    m.reason_code = Some(REASON_SEND_FAILED);
                });
            }
        }
        drop(st);
        self.emit([EngineEvent::TransferChanged(id.clone())]);
    }

    async fn submit(&self, channel: &ChannelKey, id: &CorrelationId, payload: Payload) -> Result<PushAck> {
        let req = SendRequest {
            channel: channel.clone(),
            payload: payload.clone(),
            client_msg_no: id.clone(),
            from_uid: self.inner.config.self_uid.clone(),
        };
        let resp = self.inner.apis.sender.send(&req).await?;
        if resp.status == SendStatus::Error {
            return Err(ChatSyncError::Rejected {
                reason: resp.message.unwrap_or_else(|| "send rejected".to_string()),
            });
        }
        self.inner
            .apis
            .transport
            .push(&OutboundPacket {
                channel: channel.clone(),
                client_msg_no: id.clone(),
                payload,
            })
            .await
    }

    /// Upload `file` to `channel` and send it as an image or file message.
    pub async fn upload_and_send(&self, channel: &ChannelKey, file: OutboundFile) -> CorrelationId {
        self.cancel_stream(Some(NEW_MESSAGE_REASON)).await;

        let id = CorrelationId::generate();
        {
            let mut st = self.inner.state.lock().await;
            let msg = Message::local(
                channel.clone(),
                id.clone(),
                &self.inner.config.self_uid,
                pending_payload(&file),
                TransferStatus::Uploading,
            );
            let mut events = self.add_local(&mut st, msg);
            st.transfers.register(
                id.clone(),
                channel.clone(),
                TransferKind::Upload {
                    file,
                    uploaded: None,
                },
            );
            events.push(EngineEvent::TransferChanged(id.clone()));
            drop(st);
            self.emit(events);
        }
        self.run_upload(&id).await;
        id
    }

    /// Retry a failed upload from scratch (progress resets to 0). When the
    /// upload had succeeded and only the send failed, the send is retried.
    pub async fn retry_upload(&self, id: &CorrelationId) -> Result<()> {
        {
            let mut st = self.inner.state.lock().await;
            let already_uploaded = match &st.transfers.failed(id)?.kind {
                TransferKind::Upload { uploaded, .. } => uploaded.is_some(),
                TransferKind::Message(_) => {
                    return Err(ChatSyncError::State(format!("transfer {id} is not an upload")));
                }
            };
            if already_uploaded {
                drop(st);
                return self.retry(id).await;
            }
            let transfer = st.transfers.begin_retry(id, TransferStatus::Uploading)?;
            self.update_message(&mut st, &transfer.channel, id, |m| {
                m.status = Some(TransferStatus::Uploading);
                m.upload_progress = Some(0);
                m.upload_error = None;
                m.cancelled = false;
            });
        }
        info!(correlation_id = %id, "retrying upload");
        self.run_upload(id).await;
        Ok(())
    }

    /// Cancel an upload: abort it if running, else mark the message cancelled.
    ///
    /// Errors when `id` is unknown or its send step is already running.
    pub async fn cancel_upload(&self, id: &CorrelationId) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        let channel = st
            .transfers
            .get(id)
            .map(|t| t.channel.clone())
            .ok_or_else(|| ChatSyncError::State(format!("no pending transfer {id}")))?;
        match st.transfers.cancel(id)? {
            CancelOutcome::AbortRequested => {
                debug!(correlation_id = %id, "upload abort requested");
            }
            CancelOutcome::CancelledLocally => {
                self.update_message(&mut st, &channel, id, |m| {
                    m.cancelled = true;
                    m.status = None;
                    m.upload_progress = None;
                });
                drop(st);
                self.emit([EngineEvent::TransferChanged(id.clone())]);
            }
        }
        Ok(())
    }

    async fn run_upload(&self, id: &CorrelationId) {
        let token = CancellationToken::new();
        let prepared = {
            let mut st = self.inner.state.lock().await;
            let Some(transfer) = st.transfers.get(id) else {
                return;
            };
            let TransferKind::Upload { file, .. } = &transfer.kind else {
                return;
            };
            let channel = transfer.channel.clone();
            let file = file.clone();
            if file.size() > self.inner.config.max_upload_bytes {
                Err((channel, file))
            } else {
                st.transfers.attach_abort(id, token.clone());
                Ok((channel, file))
            }
        };

        let (channel, file) = match prepared {
            Ok(ready) => ready,
            Err((channel, file)) => {
                warn!(correlation_id = %id, size = file.size(), "file exceeds upload limit");
                let limit = self.inner.config.max_upload_bytes;
                self.fail_upload(id, &channel, format!("file exceeds the {limit} byte limit"))
                    .await;
                return;
            }
        };

        let (progress_tx, mut progress_rx): (ProgressSender, _) = mpsc::unbounded_channel();
        let request = UploadRequest {
            channel: channel.clone(),
            file: file.clone(),
        };
        let upload = self.inner.apis.uploads.upload(request, progress_tx, token.clone());
        tokio::pin!(upload);
        let result = loop {
            tokio::select! {
                res = &mut upload => break res,
                () = token.cancelled() => break Err(ChatSyncError::Aborted),
                Some(pct) = progress_rx.recv() => self.report_progress(&channel, id, pct).await,
            }
        };
        while let Ok(pct) = progress_rx.try_recv() {
            self.report_progress(&channel, id, pct).await;
        }

        match result {
            Ok(uploaded) => {
                let payload = uploaded_payload(&file, &uploaded);
                debug!(correlation_id = %id, url = %uploaded.file_url, "upload finished");
                {
                    let mut st = self.inner.state.lock().await;
                    st.transfers.mark_uploaded(id, payload.clone());
                    self.update_message(&mut st, &channel, id, |m| {
                        m.payload = payload;
                        m.status = Some(TransferStatus::Sending);
                        m.upload_progress = None;
                    });
                }
                self.deliver(id).await;
            }
            Err(ChatSyncError::Aborted) => {
                info!(correlation_id = %id, "upload cancelled");
                let mut st = self.inner.state.lock().await;
                st.transfers.settle(id);
                self.update_message(&mut st, &channel, id, |m| {
                    m.cancelled = true;
                    m.status = None;
                    m.upload_progress = None;
                });
                drop(st);
                self.emit([EngineEvent::TransferChanged(id.clone())]);
            }
            Err(e) => {
                warn!(correlation_id = %id, error = %e, class = ?e.class(), "upload failed");
                self.fail_upload(id, &channel, e.to_string()).await;
            }
        }
    }

    async fn fail_upload(&self, id: &CorrelationId, channel: &ChannelKey, error: String) {
        let mut st = self.inner.state.lock().await;
        st.transfers.fail(id);
        self.update_message(&mut st, channel, id, |m| {
            m.status = None;
            m.upload_error = Some(error);
        });
        drop(st);
        self.emit([EngineEvent::TransferChanged(id.clone())]);
    }

    async fn report_progress(&self, channel: &ChannelKey, id: &CorrelationId, pct: u8) {
        let pct = pct.min(100);
        let mut st = self.inner.state.lock().await;
        self.update_message(&mut st, channel, id, |m| {
            if m.upload_progress.is_none_or(|p| pct > p) {
                m.upload_progress = Some(pct);
            }
        });
    }
}
