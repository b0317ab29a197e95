//! Real-time chat synchronization engine for customer-support clients.
//!
//! The engine keeps a conversation list, bidirectional history windows,
//! AI stream assembly and optimistic sends consistent while events arrive
//! from a live transport and paged REST APIs.

#![deny(rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "sse")]
pub mod sse;

// Public ergonomic API
pub mod client;

// Re-exports
pub use crate::client::ClientBuilder;
pub use crate::config::EngineConfig;
pub use crate::engine::{ChatEngine, Collaborators, EngineEvent};
pub use crate::error::{ChatSyncError, Result};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
