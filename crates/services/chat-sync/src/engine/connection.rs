//! Transport lifecycle and reconnection detection.

use super::{ChatEngine, EngineEvent};
use crate::error::Result;
use crate::types::event::ConnectionStatus;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of observing a status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusChange {
    /// The status differs from the previous one.
    pub changed: bool,
    /// This is a reconnection; a forced resync is due.
    pub resync: bool,
}

/// Tracks connection status and whether a connection ever succeeded.
#[derive(Debug, Default)]
pub struct ConnectionCoordinator {
    status: ConnectionStatus,
    ever_connected: bool,
}

impl ConnectionCoordinator {
    /// Create a coordinator in the `Disconnected` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Record a status reported by the transport.
    ///
    /// Entering `Connected` after having been connected before requests a
    /// resync; the first connect does not.
    pub fn observe(&mut self, status: ConnectionStatus) -> StatusChange {
        if status == self.status {
            return StatusChange::default();
        }
        let resync = status == ConnectionStatus::Connected && self.ever_connected;
        if status == ConnectionStatus::Connected {
            self.ever_connected = true;
        }
        self.status = status;
        StatusChange {
            changed: true,
            resync,
        }
    }
}

impl ChatEngine {
    /// Open the transport and start draining its events.
    ///
    /// Any previous subscription is dropped first.
    pub async fn connect(&self) -> Result<()> {
        self.disconnect().await;
        self.on_status(ConnectionStatus::Connecting).await;
        let mut subscription = match self.inner.apis.transport.connect().await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "transport connect failed");
                self.on_status(ConnectionStatus::Disconnected).await;
                return Err(e);
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(engine) = ChatEngine::upgrade(&weak) else {
                    break;
                };
                engine.ingest(event).await;
            }
            debug!("transport event stream ended");
            if let Some(engine) = ChatEngine::upgrade(&weak) {
                engine.on_status(ConnectionStatus::Disconnected).await;
            }
        });
        self.inner.state.lock().await.pump = Some(pump);
        Ok(())
    }

    /// Stop the event pump and drop the transport subscription.
    pub async fn disconnect(&self) {
        let pump = self.inner.state.lock().await.pump.take();
        if let Some(pump) = pump {
            pump.abort();
            self.on_status(ConnectionStatus::Disconnected).await;
        }
    }

    /// Record a connection status; a reconnection triggers a forced resync.
    pub(crate) async fn on_status(&self, status: ConnectionStatus) {
        let change = self.inner.state.lock().await.connection.observe(status);
        if !change.changed {
            return;
        }
        info!(?status, "connection status changed");
        self.emit([EngineEvent::ConnectionChanged(status)]);
        if change.resync {
            if let Err(e) = self.resync().await {
                warn!(error = %e, "resync after reconnect failed");
            }
        }
    }
}
