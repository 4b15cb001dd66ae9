use crate::config::LlmConfig;
use crate::connection::{
    ChunkStream, CompletionChunk, CompletionRequest, CompletionResponse, Connection, Connector,
};
use crate::error::{LlmError, Result};
use crate::events::TokenUsage;
use crate::types::ChatMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opens [`OpenAiConnection`]s against any OpenAI-compatible endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiConnector;

impl Connector for OpenAiConnector {
    #[tracing::instrument(level = "debug", skip_all, fields(base_url = %config.base_url))]
    fn connect(&self, config: &LlmConfig) -> Result<Arc<dyn Connection>> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Connect(format!("reqwest client build failed: {e}")))?;
        Ok(Arc::new(OpenAiConnection::new(
            http,
            config.api_key.as_deref(),
            &config.chat_completions_url(),
        )))
    }
}

#[derive(Clone)]
pub struct OpenAiConnection {
    http: reqwest::Client,
    api_key: Option<String>,
    url: String,
}

impl OpenAiConnection {
    pub fn new(http: reqwest::Client, api_key: Option<&str>, url: &str) -> Self {
        Self {
            http,
            api_key: api_key.map(str::to_string),
            url: url.to_string(),
        }
    }

    async fn send(&self, req: &OpenAiChatRequest<'_>) -> Result<reqwest::Response> {
        let mut builder = self.http.post(&self.url).json(req);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        Ok(builder.send().await?)
    }
}

#[async_trait]
impl Connection for OpenAiConnection {
    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model))]
    async fn create(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let req = OpenAiChatRequest::new(request);
        let response = self.send(&req).await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "openai chat status={status} body={body}"
            )));
        }

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        parsed.try_into()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model))]
    async fn create_stream(&self, request: &CompletionRequest) -> Result<ChunkStream> {
        let req = OpenAiChatRequest::new(request);
        let response = self.send(&req).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "openai stream status={status} body={body}"
            )));
        }

        Ok(chunk_stream(response.bytes_stream()))
    }
}

/// Maps an SSE byte stream to completion chunks, ending at `[DONE]`.
fn chunk_stream<S, E>(bytes_stream: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<LlmError> + Send + 'static,
{
    let sse = Box::pin(decode_sse(bytes_stream));
    let stream = futures_util::stream::unfold(sse, |mut sse| async move {
        loop {
            let data = match sse.as_mut().next().await? {
                Ok(SseEvent::Data(data)) => data,
                Ok(SseEvent::Other) => continue,
                Err(e) => return Some((Err(e), sse)),
            };
            if data.trim() == "[DONE]" {
                return None;
            }

            let chunk: OpenAiStreamChunk = match serde_json::from_str(&data) {
                Ok(v) => v,
                Err(e) => {
                    return Some((
                        Err(LlmError::StreamParse(format!(
                            "openai chunk json error={e} data={data}"
                        ))),
                        sse,
                    ));
                }
            };
            if let Some(error) = chunk.error {
                return Some((
                    Err(LlmError::Http(format!("openai stream error={error}"))),
                    sse,
                ));
            }

            let out = CompletionChunk::from(chunk);
            if out.content.is_none() && out.finish_reason.is_none() && out.usage.is_none() {
                continue;
            }
            return Some((Ok(out), sse));
        }
    });
    Box::pin(stream)
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl<'a> OpenAiChatRequest<'a> {
    fn new(request: &'a CompletionRequest) -> Self {
        Self {
            model: &request.model,
            messages: request.messages.iter().map(OpenAiMessage::from).collect(),
            stream: request.stream,
            stream_options: request.stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for OpenAiMessage<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        Self {
            role: m.role.as_str(),
            content: &m.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct OpenAiPromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
            cached_tokens: u
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0),
        }
    }
}

impl TryFrom<OpenAiChatResponse> for CompletionResponse {
    type Error = LlmError;

    fn try_from(v: OpenAiChatResponse) -> Result<Self> {
        let choice = v.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openai response missing choices".to_string())
        })?;

        Ok(CompletionResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: v.usage.map(TokenUsage::from),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl From<OpenAiStreamChunk> for CompletionChunk {
    fn from(v: OpenAiStreamChunk) -> Self {
        let (content, finish_reason) = match v.choices.into_iter().next() {
            Some(choice) => (
                choice.delta.content.filter(|c| !c.is_empty()),
                choice.finish_reason,
            ),
            None => (None, None),
        };
        CompletionChunk {
            content,
            finish_reason,
            usage: v.usage.map(TokenUsage::from),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Other,
}

fn decode_sse<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<LlmError> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(bytes_stream), Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut eof)| async move {
            loop {
                if let Some((end, sep)) = find_frame_end(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..end + sep).take(end).collect();
                    return Some((Ok(parse_frame(&raw)), (stream, buffer, eof)));
                }
                if eof {
                    if buffer.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let raw = std::mem::take(&mut buffer);
                    return Some((Ok(parse_frame(&raw)), (stream, buffer, eof)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), (stream, buffer, true))),
                    None => eof = true,
                }
            }
        },
    )
}

/// Offset of the first blank-line separator and its length.
fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &[u8]) -> SseEvent {
    let raw = String::from_utf8_lossy(raw);
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if data_lines.is_empty() {
        return SseEvent::Other;
    }
    SseEvent::Data(data_lines.join("\n"))
}
