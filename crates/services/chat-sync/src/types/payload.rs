//! Message payload variants and their wire encoding.
//!
//! On the wire a payload is a JSON object discriminated by a numeric `type`
//! field. Decoding is total: anything unrecognised is kept verbatim as
//! [`Payload::Unknown`] so it survives a round trip through the engine.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Wire discriminator for text payloads.
pub const TYPE_TEXT: u64 = 1;
/// Wire discriminator for image payloads.
pub const TYPE_IMAGE: u64 = 2;
/// Wire discriminator for generic file payloads.
pub const TYPE_FILE: u64 = 8;
/// Wire discriminator for mixed text + images payloads.
pub const TYPE_MIXED: u64 = 12;
/// Wire discriminator for command payloads.
pub const TYPE_COMMAND: u64 = 99;
/// Wire discriminator for the AI "thinking" placeholder.
pub const TYPE_LOADING: u64 = 100;

/// An image embedded in a mixed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Image URL.
    pub url: String,
    /// Pixel width.
    #[serde(default)]
    pub width: u32,
    /// Pixel height.
    #[serde(default)]
    pub height: u32,
}

/// Content carried by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Payload {
    /// Plain text.
    Text {
        /// Text content.
        content: String,
    },
    /// Image with probed dimensions.
    Image {
        /// Image URL.
        url: String,
        /// Pixel width.
        width: u32,
        /// Pixel height.
        height: u32,
        /// Original file name.
        name: Option<String>,
    },
    /// Generic file attachment.
    File {
        /// File URL.
        url: String,
        /// Original file name.
        name: String,
        /// Size in bytes.
        size: u64,
    },
    /// Text with inline images.
    Mixed {
        /// Text content.
        content: String,
        /// Attached images.
        images: Vec<ImageRef>,
    },
    /// Client command (e.g. transfer, end session).
    Command {
        /// Command name.
        cmd: String,
        /// Command parameters.
        param: Value,
    },
    /// Placeholder shown while an AI response is being generated.
    Loading,
    /// Unrecognised payload, kept verbatim.
    Unknown(Value),
}

impl Payload {
    /// Convenience constructor for text payloads.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Numeric wire discriminator.
    pub fn type_code(&self) -> Option<u64> {
        match self {
            Self::Text { .. } => Some(TYPE_TEXT),
            Self::Image { .. } => Some(TYPE_IMAGE),
            Self::File { .. } => Some(TYPE_FILE),
            Self::Mixed { .. } => Some(TYPE_MIXED),
            Self::Command { .. } => Some(TYPE_COMMAND),
            Self::Loading => Some(TYPE_LOADING),
            Self::Unknown(v) => v.get("type").and_then(Value::as_u64),
        }
    }

    /// One-line preview used by the conversation list.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { content } | Self::Mixed { content, .. } => content.clone(),
            Self::Image { .. } => "[Image]".to_string(),
            Self::File { name, .. } => format!("[File] {name}"),
            Self::Command { cmd, .. } => format!("[{cmd}]"),
            Self::Loading => String::new(),
            Self::Unknown(_) => "[Unsupported message]".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TextWire {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ImageWire {
    url: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct FileWire {
    url: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct MixedWire {
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(Deserialize)]
struct CommandWire {
    cmd: String,
    #[serde(default)]
    param: Value,
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        let Some(code) = value.get("type").and_then(Value::as_u64) else {
            return Self::Unknown(value);
        };
        let decoded = match code {
            TYPE_TEXT => serde_json::from_value::<TextWire>(value.clone())
                .map(|w| Self::Text { content: w.content }),
            TYPE_IMAGE => serde_json::from_value::<ImageWire>(value.clone()).map(|w| Self::Image {
                url: w.url,
                width: w.width,
                height: w.height,
                name: w.name,
            }),
            TYPE_FILE => serde_json::from_value::<FileWire>(value.clone()).map(|w| Self::File {
                url: w.url,
                name: w.name,
                size: w.size,
            }),
            TYPE_MIXED => serde_json::from_value::<MixedWire>(value.clone()).map(|w| Self::Mixed {
                content: w.content,
                images: w.images,
            }),
            TYPE_COMMAND => serde_json::from_value::<CommandWire>(value.clone())
                .map(|w| Self::Command {
                    cmd: w.cmd,
                    param: w.param,
                }),
            TYPE_LOADING => return Self::Loading,
            _ => return Self::Unknown(value),
        };
        decoded.unwrap_or(Self::Unknown(value))
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text { content } => json!({ "type": TYPE_TEXT, "content": content }),
            Payload::Image {
                url,
                width,
                height,
                name,
            } => {
                let mut v = json!({
                    "type": TYPE_IMAGE,
                    "url": url,
                    "width": width,
                    "height": height,
                });
                if let Some(name) = name {
                    v["name"] = Value::String(name);
                }
                v
            }
            Payload::File { url, name, size } => json!({
                "type": TYPE_FILE,
                "url": url,
                "name": name,
                "size": size,
            }),
            Payload::Mixed { content, images } => json!({
                "type": TYPE_MIXED,
                "content": content,
                "images": images,
            }),
            Payload::Command { cmd, param } => json!({
                "type": TYPE_COMMAND,
                "cmd": cmd,
                "param": param,
            }),
            Payload::Loading => json!({ "type": TYPE_LOADING }),
            Payload::Unknown(v) => v,
        }
    }
}
