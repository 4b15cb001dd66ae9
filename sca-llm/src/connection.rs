//! Provider-neutral seam between [`crate::LlmClient`] and a remote completion API.

use crate::config::LlmConfig;
use crate::error::Result;
use crate::events::TokenUsage;
use crate::types::ChatMessage;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// The first choice of a single-shot response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// One incremental unit of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionChunk {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    /// Usually only present on the final chunk.
    pub usage: Option<TokenUsage>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;

/// A live, shareable handle to the remote API.
///
/// Implementations must tolerate concurrent requests.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Ends (yields `None`) once the provider signals end of stream.
    async fn create_stream(&self, request: &CompletionRequest) -> Result<ChunkStream>;
}

/// Opens connections for a client.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &LlmConfig) -> Result<Arc<dyn Connection>>;
}
