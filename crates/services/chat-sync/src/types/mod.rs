//! Core types for chat_sync.
//!
//! This module contains channel, message, conversation, event and API types.

pub mod api;
pub mod channel;
pub mod conversation;
pub mod event;
pub mod message;
pub mod payload;

pub use api::*;
pub use channel::*;
pub use conversation::*;
pub use event::*;
pub use message::*;
pub use payload::*;
