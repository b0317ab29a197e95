//! SSE (Server-Sent Events) transport.
//!
//! This module provides the real-time [`Transport`] with reconnection and
//! backoff. Frames carry JSON [`TransportEvent`]s; connection changes are
//! reported in-band as `status` events so the engine sees every reconnect.

use crate::backend::{Transport, TransportSubscription};
use crate::config::SseConfig;
use crate::error::Result;
use crate::http::HttpClient;
use crate::http::messages::MessagesApi;
use crate::types::api::{OutboundPacket, PushAck};
use crate::types::event::{ConnectionStatus, TransportEvent};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures::StreamExt;
use reqwest_eventsource::{Event as EsEvent, EventSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

/// Path of the event stream.
pub const EVENTS_PATH: &str = "/v1/transport/events";

/// Options for SSE subscription.
#[derive(Clone, Copy, Debug)]
pub struct SseOptions {
    /// Channel capacity (default: 256).
    pub capacity: usize,
    /// Initial backoff interval (default: 250ms).
    pub initial_interval: Duration,
    /// Max backoff interval (default: 30s).
    pub max_interval: Duration,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self::from(SseConfig::default())
    }
}

impl From<SseConfig> for SseOptions {
    fn from(cfg: SseConfig) -> Self {
        Self {
            capacity: cfg.capacity,
            initial_interval: Duration::from_millis(cfg.initial_backoff_ms),
            max_interval: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

/// SSE transport to the chat server.
#[derive(Clone)]
pub struct SseTransport {
    http: HttpClient,
    uid: String,
    opts: SseOptions,
    last_event_id: Arc<RwLock<Option<String>>>,
}

impl SseTransport {
    /// Create a new SSE transport for the user `uid`.
    pub fn new(http: HttpClient, uid: impl Into<String>, opts: SseOptions) -> Self {
        Self {
            http,
            uid: uid.into(),
            opts,
            last_event_id: Arc::new(RwLock::new(None)),
        }
    }

    /// Last event id seen, used to resume after reconnects.
    pub async fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().await.clone()
    }

    fn spawn(&self) -> TransportSubscription {
        let (tx, rx) = mpsc::channel(self.opts.capacity);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let http = self.http.reqwest().clone();
        let url = format!("{}{}", self.http.base(), EVENTS_PATH);
        let uid = self.uid.clone();
        let lei = Arc::clone(&self.last_event_id);
        let initial = self.opts.initial_interval;
        let max = self.opts.max_interval;

        let task = tokio::spawn(async move {
            // max_elapsed_time: None retries forever
            let mut backoff = ExponentialBackoff {
                initial_interval: initial,
                max_interval: max,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            };
            let status = |status| TransportEvent::Status { status };

            loop {
                if cancel_clone.is_cancelled() {
                    break;
                }
                if tx.send(status(ConnectionStatus::Connecting)).await.is_err() {
                    return;
                }

                let mut req = http.get(&url).query(&[("uid", uid.as_str())]);
                if let Some(id) = lei.read().await.clone() {
                    req = req.header("Last-Event-ID", id);
                }

                match EventSource::new(req) {
                    Ok(mut es) => loop {
                        let event = tokio::select! {
                            ev = es.next() => ev,
                            () = cancel_clone.cancelled() => {
                                es.close();
                                return;
                            }
                        };
                        let Some(event) = event else { break };
                        match event {
                            Ok(EsEvent::Open) => {
                                backoff.reset();
                                tracing::debug!("SSE connection opened");
                                if tx.send(status(ConnectionStatus::Connected)).await.is_err() {
                                    es.close();
                                    return;
                                }
                            }
                            Ok(EsEvent::Message(msg)) => {
                                if !msg.id.is_empty() {
                                    *lei.write().await = Some(msg.id.clone());
                                }
                                match serde_json::from_str::<TransportEvent>(&msg.data) {
                                    Ok(ev) => {
                                        if tx.send(ev).await.is_err() {
                                            es.close();
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse SSE event: {}", e);
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("SSE error: {:?}", e);
                                es.close();
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Failed to create EventSource: {:?}", e);
                    }
                }

                if tx.send(status(ConnectionStatus::Disconnected)).await.is_err() {
                    return;
                }
                if let Some(delay) = backoff.next_backoff() {
                    tracing::debug!("SSE reconnecting after {:?}", delay);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel_clone.cancelled() => { return; }
                    }
                }
            }
        });

        TransportSubscription::new(rx, cancel, Some(task))
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> Result<TransportSubscription> {
        Ok(self.spawn())
    }

    async fn push(&self, packet: &OutboundPacket) -> Result<PushAck> {
        MessagesApi::new(self.http.clone()).push(packet).await
    }
}
