//! Chat-completion client that normalizes provider responses into typed events.
//!
//! A call to [`LlmClient::complete`] yields zero or more [`StreamEvent::TextDelta`]
//! events followed by exactly one terminal [`StreamEvent::MessageComplete`] or
//! [`StreamEvent::Error`].

mod client;
mod config;
mod connection;
mod error;
mod events;
mod openai;
mod types;

pub use client::{EventStream, LlmClient};
pub use config::{DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TIMEOUT, LlmConfig};
pub use connection::{
    ChunkStream, CompletionChunk, CompletionRequest, CompletionResponse, Connection, Connector,
};
pub use error::{LlmError, Result};
pub use events::{EventType, StreamEvent, TextDelta, TokenUsage};
pub use openai::{OpenAiConnection, OpenAiConnector};
pub use types::{ChatMessage, Role};
