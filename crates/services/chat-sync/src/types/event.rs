//! Transport event types.

use crate::types::channel::ChannelKey;
use crate::types::message::{CorrelationId, Message};
use serde::{Deserialize, Serialize};

/// Connection state of the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and receiving events.
    Connected,
}

/// Incremental AI stream signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum StreamSignal {
    /// A stream session begins.
    #[serde(rename = "stream.start")]
    Start {
        /// Correlation id of the AI message.
        id: CorrelationId,
    },
    /// A chunk of text.
    #[serde(rename = "stream.content")]
    Content {
        /// Correlation id of the AI message.
        id: CorrelationId,
        /// Text chunk.
        data: String,
    },
    /// The stream finished, optionally with an error.
    #[serde(rename = "stream.end")]
    End {
        /// Correlation id of the AI message.
        id: CorrelationId,
        /// Error reported by the producer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StreamSignal {
    /// Correlation id carried by the signal.
    pub fn id(&self) -> &CorrelationId {
        match self {
            Self::Start { id } | Self::Content { id, .. } | Self::End { id, .. } => id,
        }
    }
}

/// Custom (non-message) transport signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomEvent {
    /// Channel the signal belongs to, when the producer sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelKey>,
    /// Signal body.
    #[serde(flatten)]
    pub signal: StreamSignal,
}

/// Event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A full message.
    Message {
        /// The message.
        message: Message,
    },
    /// Connection state change.
    Status {
        /// New state.
        status: ConnectionStatus,
    },
    /// Custom signal (AI streaming).
    Custom(CustomEvent),
    /// Fallback for unknown event types.
    #[serde(other)]
    Unknown,
}

impl TransportEvent {
    /// Channel this event concerns, if any.
    pub fn channel(&self) -> Option<&ChannelKey> {
        match self {
            Self::Message { message } => Some(&message.channel),
            Self::Custom(custom) => custom.channel.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::channel::ChannelType;

    #[test]
    fn test_deserialize_stream_content() {
        let json = r#"{"type":"custom","event":"stream.content","id":"ai_1","data":"Hel","channel":{"channel_id":"c1","channel_type":251}}"#;
        let ev: TransportEvent = serde_json::from_str(json).unwrap();
        match ev {
            TransportEvent::Custom(custom) => {
                assert_eq!(
                    custom.signal,
                    StreamSignal::Content {
                        id: CorrelationId::from("ai_1"),
                        data: "Hel".into()
                    }
                );
                assert_eq!(
                    custom.channel,
                    Some(ChannelKey::new("c1", ChannelType::CUSTOMER_SERVICE))
                );
            }
            other => panic!("Expected Custom, got {other:?}"),
        }
    }

    #[test]
    fn test_deserialize_stream_end_with_error() {
        let json = r#"{"type":"custom","event":"stream.end","id":"ai_1","error":"AI processing failed"}"#;
        let ev: TransportEvent = serde_json::from_str(json).unwrap();
        let TransportEvent::Custom(custom) = ev else {
            panic!("Expected Custom");
        };
        assert_eq!(custom.signal.id().as_str(), "ai_1");
        assert!(matches!(
            custom.signal,
            StreamSignal::End { error: Some(ref e), .. } if e == "AI processing failed"
        ));
    }

    #[test]
    fn test_deserialize_status() {
        let json = r#"{"type":"status","status":"connected"}"#;
        let ev: TransportEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            ev,
            TransportEvent::Status {
                status: ConnectionStatus::Connected
            }
        );
    }

    #[test]
    fn test_deserialize_unknown() {
        let json = r#"{"type":"typing","uid":"x"}"#;
        let ev: TransportEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev, TransportEvent::Unknown);
    }
}
