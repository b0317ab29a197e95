//! Messages API: send, AI run cancel and transport push.

use crate::error::Result;
use crate::http::HttpClient;
use crate::types::api::{OutboundPacket, PushAck, SendRequest, SendResponse};
use crate::types::message::CorrelationId;
use serde::Serialize;

#[derive(Serialize)]
struct CancelRunBody<'a> {
    client_msg_no: &'a CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Messages API client.
#[derive(Clone)]
pub struct MessagesApi {
    http: HttpClient,
}

impl MessagesApi {
    /// Create a new Messages API client.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Submit a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn send(&self, req: &SendRequest) -> Result<SendResponse> {
        self.http.post("/v1/chat/messages/send", req).await
    }

    /// Stop the AI run producing `client_msg_no`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn cancel_run(&self, client_msg_no: &CorrelationId, reason: Option<&str>) -> Result<()> {
        self.http
            .post_empty(
                "/v1/ai/runs/cancel",
                &CancelRunBody {
                    client_msg_no,
                    reason,
                },
            )
            .await
    }

    /// Push a packet over the transport's HTTP ingress.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn push(&self, packet: &OutboundPacket) -> Result<PushAck> {
        self.http.post("/v1/transport/send", packet).await
    }
}
