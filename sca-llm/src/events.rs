//! Normalized events produced by [`crate::LlmClient::complete`].

use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// A non-empty fragment of generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TextDelta {
    content: String,
}

impl TextDelta {
    pub fn new(content: impl Into<String>) -> Result<Self> {
        let content = content.into();
        if content.is_empty() {
            return Err(LlmError::InvalidInput(
                "text delta content must not be empty".to_string(),
            ));
        }
        Ok(Self { content })
    }

    /// `None` for absent or empty provider content.
    pub(crate) fn from_provider(content: Option<String>) -> Option<Self> {
        content
            .filter(|c| !c.is_empty())
            .map(|content| Self { content })
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

impl fmt::Display for TextDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

impl TryFrom<String> for TextDelta {
    type Error = LlmError;

    fn try_from(content: String) -> Result<Self> {
        Self::new(content)
    }
}

impl From<TextDelta> for String {
    fn from(v: TextDelta) -> Self {
        v.content
    }
}

/// Token accounting for one or more requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Prompt tokens served from the provider-side cache.
    #[serde(default)]
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn new(
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        cached_tokens: u64,
    ) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cached_tokens,
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
            cached_tokens: self.cached_tokens.saturating_add(rhs.cached_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), Add::add)
    }
}

impl<'a> Sum<&'a TokenUsage> for TokenUsage {
    fn sum<I: Iterator<Item = &'a TokenUsage>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TextDelta,
    MessageComplete,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TextDelta => "text_delta",
            EventType::MessageComplete => "message_complete",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of a completion's event sequence.
///
/// A sequence is zero or more `TextDelta` events followed by exactly one
/// terminal event, either `MessageComplete` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text_delta: TextDelta,
    },
    MessageComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_delta: Option<TextDelta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            StreamEvent::TextDelta { .. } => EventType::TextDelta,
            StreamEvent::MessageComplete { .. } => EventType::MessageComplete,
            StreamEvent::Error { .. } => EventType::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::TextDelta { .. })
    }

    pub fn text_delta(&self) -> Option<&TextDelta> {
        match self {
            StreamEvent::TextDelta { text_delta } => Some(text_delta),
            StreamEvent::MessageComplete { text_delta, .. } => text_delta.as_ref(),
            StreamEvent::Error { .. } => None,
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        match self {
            StreamEvent::MessageComplete { finish_reason, .. } => finish_reason.as_deref(),
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        match self {
            StreamEvent::MessageComplete { usage, .. } => usage.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StreamEvent::Error { error } => Some(error),
            _ => None,
        }
    }
}

impl From<&LlmError> for StreamEvent {
    fn from(e: &LlmError) -> Self {
        StreamEvent::Error {
            error: e.to_string(),
        }
    }
}
