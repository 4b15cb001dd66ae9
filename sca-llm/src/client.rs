use crate::config::LlmConfig;
use crate::connection::{ChunkStream, CompletionRequest, CompletionResponse, Connection, Connector};
use crate::error::{LlmError, Result};
use crate::events::{StreamEvent, TextDelta, TokenUsage};
use crate::openai::OpenAiConnector;
use crate::types::ChatMessage;
use futures_util::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lazily produced events of one completion. Dropping it abandons the request.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>;

/// Completion client holding at most one shared connection.
///
/// The connection is opened on first use and reused by every request, including
/// concurrent ones. [`LlmClient::close`] drops the held connection; requests
/// already in flight keep the connection they started on until they finish.
pub struct LlmClient {
    config: LlmConfig,
    connector: Arc<dyn Connector>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self::with_connector(config, Arc::new(OpenAiConnector))
    }

    pub fn with_connector(config: LlmConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Releases the held connection. Safe to call when none is open.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            tracing::debug!("llm connection released");
        }
    }

    /// Issues one chat-completion request.
    ///
    /// An empty conversation is rejected here, before any event exists. All
    /// later failures arrive as a single terminal [`StreamEvent::Error`].
    pub fn complete<'a>(
        &'a self,
        conversation: &[ChatMessage],
        streaming: bool,
    ) -> Result<EventStream<'a>> {
        if conversation.is_empty() {
            return Err(LlmError::InvalidInput(
                "conversation must contain at least one message".to_string(),
            ));
        }

        let request = CompletionRequest {
            model: self.config.model.clone(),
            messages: conversation.to_vec(),
            stream: streaming,
        };
        let request_id = Uuid::new_v4();
        tracing::debug!(
            %request_id,
            model = %request.model,
            streaming,
            messages = request.messages.len(),
            "completion requested"
        );

        let phase = Phase::Connect {
            client: self,
            request,
            request_id,
        };
        Ok(Box::pin(futures_util::stream::unfold(phase, advance)))
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }
        let conn = self.connector.connect(&self.config)?;
        tracing::debug!(base_url = %self.config.base_url, "llm connection created");
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

enum Phase<'a> {
    Connect {
        client: &'a LlmClient,
        request: CompletionRequest,
        request_id: Uuid,
    },
    Receiving {
        chunks: ChunkStream,
        summary: StreamSummary,
        request_id: Uuid,
    },
    Finished,
}

/// Terminal metadata seen so far on a streamed response.
#[derive(Debug, Default)]
struct StreamSummary {
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    deltas: usize,
}

async fn advance(phase: Phase<'_>) -> Option<(StreamEvent, Phase<'_>)> {
    match phase {
        Phase::Connect {
            client,
            request,
            request_id,
        } => {
            let conn = match client.connection().await {
                Ok(v) => v,
                Err(e) => return Some((failed(request_id, &e), Phase::Finished)),
            };

            if !request.stream {
                let event = match conn.create(&request).await {
                    Ok(resp) => message_complete(resp),
                    Err(e) => failed(request_id, &e),
                };
                return Some((event, Phase::Finished));
            }

            match conn.create_stream(&request).await {
                Ok(chunks) => receive(chunks, StreamSummary::default(), request_id).await,
                Err(e) => Some((failed(request_id, &e), Phase::Finished)),
            }
        }
        Phase::Receiving {
            chunks,
            summary,
            request_id,
        } => receive(chunks, summary, request_id).await,
        Phase::Finished => None,
    }
}

async fn receive<'a>(
    mut chunks: ChunkStream,
    mut summary: StreamSummary,
    request_id: Uuid,
) -> Option<(StreamEvent, Phase<'a>)> {
    loop {
        match chunks.next().await {
            Some(Ok(chunk)) => {
                if chunk.finish_reason.is_some() {
                    summary.finish_reason = chunk.finish_reason;
                }
                if chunk.usage.is_some() {
                    summary.usage = chunk.usage;
                }
                if let Some(text_delta) = TextDelta::from_provider(chunk.content) {
                    summary.deltas += 1;
                    let next = Phase::Receiving {
                        chunks,
                        summary,
                        request_id,
                    };
                    return Some((StreamEvent::TextDelta { text_delta }, next));
                }
            }
            Some(Err(e)) => return Some((failed(request_id, &e), Phase::Finished)),
            None => {
                tracing::debug!(
                    %request_id,
                    deltas = summary.deltas,
                    finish_reason = ?summary.finish_reason,
                    "completion stream finished"
                );
                let event = StreamEvent::MessageComplete {
                    text_delta: None,
                    finish_reason: summary.finish_reason,
                    usage: summary.usage,
                };
                return Some((event, Phase::Finished));
            }
        }
    }
}

fn message_complete(resp: CompletionResponse) -> StreamEvent {
    StreamEvent::MessageComplete {
        text_delta: TextDelta::from_provider(resp.content),
        finish_reason: resp.finish_reason,
        usage: resp.usage,
    }
}

fn failed(request_id: Uuid, e: &LlmError) -> StreamEvent {
    tracing::warn!(%request_id, error = %e, "completion failed");
    StreamEvent::from(e)
}

#[cfg(test)]
mod tests {
    use super::LlmClient;
    use crate::config::LlmConfig;
    use crate::connection::{
        ChunkStream, CompletionChunk, CompletionRequest, CompletionResponse, Connection,
        Connector,
    };
    use crate::error::{LlmError, Result};
    use crate::events::{EventType, StreamEvent, TokenUsage};
    use crate::types::ChatMessage;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Script {
        Respond(CompletionResponse),
        Chunks {
            chunks: Vec<CompletionChunk>,
            then_fail: Option<String>,
        },
        /// Yields the chunks, then never ends. Sets the flag when the stream is dropped.
        Hang {
            chunks: Vec<CompletionChunk>,
            dropped: Arc<AtomicBool>,
        },
        Fail(String),
    }

    struct FakeConnection {
        script: Script,
        requests: Arc<std::sync::Mutex<Vec<CompletionRequest>>>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn create(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            tokio::task::yield_now().await;
            match &self.script {
                Script::Respond(resp) => Ok(resp.clone()),
                Script::Fail(msg) => Err(LlmError::Timeout(msg.clone())),
                _ => panic!("unexpected non-streaming request"),
            }
        }

        async fn create_stream(&self, request: &CompletionRequest) -> Result<ChunkStream> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            match &self.script {
                Script::Chunks { chunks, then_fail } => {
                    let mut items: Vec<Result<CompletionChunk>> =
                        chunks.iter().cloned().map(Ok).collect();
                    if let Some(msg) = then_fail {
                        items.push(Err(LlmError::Http(msg.clone())));
                    }
                    Ok(Box::pin(futures_util::stream::iter(items)))
                }
                Script::Hang { chunks, dropped } => {
                    let guard = DropFlag(dropped.clone());
                    let items: Vec<Result<CompletionChunk>> =
                        chunks.iter().cloned().map(Ok).collect();
                    let stream = futures_util::stream::iter(items)
                        .chain(futures_util::stream::pending())
                        .map(move |item| {
                            let _keep = &guard;
                            item
                        });
                    Ok(Box::pin(stream))
                }
                Script::Fail(msg) => Err(LlmError::Connect(msg.clone())),
                Script::Respond(_) => panic!("unexpected streaming request"),
            }
        }
    }

    struct FakeConnector {
        script: Script,
        connects: AtomicUsize,
        requests: Arc<std::sync::Mutex<Vec<CompletionRequest>>>,
    }

    impl FakeConnector {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                connects: AtomicUsize::new(0),
                requests: Arc::new(std::sync::Mutex::new(Vec::new())),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl Connector for FakeConnector {
        fn connect(&self, _config: &LlmConfig) -> Result<Arc<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeConnection {
                script: self.script.clone(),
                requests: self.requests.clone(),
            }))
        }
    }

    struct BrokenConnector;

    impl Connector for BrokenConnector {
        fn connect(&self, _config: &LlmConfig) -> Result<Arc<dyn Connection>> {
            Err(LlmError::Connect("tls backend unavailable".to_string()))
        }
    }

    fn client(connector: Arc<dyn Connector>) -> LlmClient {
        LlmClient::with_connector(LlmConfig::default(), connector)
    }

    fn chunk(content: &str) -> CompletionChunk {
        CompletionChunk {
            content: Some(content.to_string()),
            ..CompletionChunk::default()
        }
    }

    fn hello() -> Vec<ChatMessage> {
        vec![ChatMessage::user("Hello")]
    }

    async fn collect(client: &LlmClient, streaming: bool) -> Vec<StreamEvent> {
        client
            .complete(&hello(), streaming)
            .expect("valid conversation")
            .collect()
            .await
    }

    #[tokio::test]
    async fn non_streaming_yields_one_message_complete_with_usage() {
        let connector = FakeConnector::new(Script::Respond(CompletionResponse {
            content: Some("Test response".to_string()),
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage::new(10, 5, 15, 2)),
        }));
        let client = client(connector.clone());

        let events = collect(&client, false).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type(), EventType::MessageComplete);
        assert_eq!(
            event.text_delta().map(|t| t.content()),
            Some("Test response")
        );
        assert_eq!(event.finish_reason(), Some("stop"));
        assert_eq!(event.usage(), Some(&TokenUsage::new(10, 5, 15, 2)));

        let requests = connector.requests.lock().expect("requests lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, client.model());
        assert_eq!(client.model(), "glm-4.7");
        assert_eq!(requests[0].messages, hello());
        assert!(!requests[0].stream);
    }

    #[tokio::test]
    async fn missing_content_and_usage_stay_unset() {
        for content in [None, Some(String::new())] {
            let connector = FakeConnector::new(Script::Respond(CompletionResponse {
                content,
                finish_reason: Some("stop".to_string()),
                usage: None,
            }));
            let events = collect(&client(connector), false).await;
            assert_eq!(events.len(), 1);
            assert!(events[0].text_delta().is_none());
            assert!(events[0].usage().is_none());
            assert_eq!(events[0].finish_reason(), Some("stop"));
        }
    }

    #[tokio::test]
    async fn streaming_yields_deltas_in_order_then_one_completion() {
        let mut chunks = vec![chunk("Hel"), chunk("lo"), chunk(", world")];
        chunks.push(CompletionChunk {
            finish_reason: Some("stop".to_string()),
            ..CompletionChunk::default()
        });
        chunks.push(CompletionChunk {
            usage: Some(TokenUsage::new(7, 3, 10, 0)),
            ..CompletionChunk::default()
        });
        let connector = FakeConnector::new(Script::Chunks {
            chunks,
            then_fail: None,
        });
        let client = client(connector.clone());

        let events = collect(&client, true).await;
        assert_eq!(events.len(), 4);
        let text: Vec<&str> = events[..3]
            .iter()
            .map(|e| {
                assert_eq!(e.event_type(), EventType::TextDelta);
                e.text_delta().expect("delta").content()
            })
            .collect();
        assert_eq!(text, vec!["Hel", "lo", ", world"]);

        let last = &events[3];
        assert_eq!(last.event_type(), EventType::MessageComplete);
        assert!(last.text_delta().is_none());
        assert_eq!(last.finish_reason(), Some("stop"));
        assert_eq!(last.usage(), Some(&TokenUsage::new(7, 3, 10, 0)));
        assert!(connector.requests.lock().expect("requests lock")[0].stream);
    }

    #[tokio::test]
    async fn streaming_without_terminal_metadata_still_completes() {
        let connector = FakeConnector::new(Script::Chunks {
            chunks: vec![chunk("only")],
            then_fail: None,
        });
        let events = collect(&client(connector), true).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::MessageComplete {
                text_delta: None,
                finish_reason: None,
                usage: None,
            }
        );
    }

    #[tokio::test]
    async fn transport_failure_becomes_single_error_event() {
        let client = client(FakeConnector::new(Script::Fail("deadline exceeded".to_string())));
        for streaming in [false, true] {
            let events = collect(&client, streaming).await;
            assert_eq!(events.len(), 1, "streaming={streaming}");
            assert_eq!(events[0].event_type(), EventType::Error);
            assert!(
                events[0]
                    .error()
                    .expect("error text")
                    .contains("deadline exceeded")
            );
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_after_delivered_deltas() {
        let connector = FakeConnector::new(Script::Chunks {
            chunks: vec![chunk("partial")],
            then_fail: Some("connection reset".to_string()),
        });
        let events = collect(&client(connector), true).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), EventType::TextDelta);
        assert_eq!(events[1].event_type(), EventType::Error);
        assert!(events.iter().all(|e| e.usage().is_none()));
    }

    #[tokio::test]
    async fn connection_setup_failure_is_reported_as_event() {
        let client = client(Arc::new(BrokenConnector));
        let events = collect(&client, false).await;
        assert_eq!(events.len(), 1);
        assert!(
            events[0]
                .error()
                .expect("error text")
                .contains("tls backend unavailable")
        );
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn empty_conversation_is_rejected_before_any_event() {
        let connector = FakeConnector::new(Script::Fail("unused".to_string()));
        let client = client(connector.clone());
        let err = match client.complete(&[], false) {
            Ok(_) => panic!("empty conversation must be rejected"),
            Err(e) => e,
        };
        assert!(matches!(err, LlmError::InvalidInput(_)));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn connection_is_created_lazily_and_reused() {
        let connector = FakeConnector::new(Script::Respond(CompletionResponse::default()));
        let client = client(connector.clone());

        let stream = client.complete(&hello(), false).expect("valid");
        assert_eq!(connector.connects(), 0, "no I/O before the stream is polled");
        assert!(!client.is_connected().await);
        drop(stream);

        collect(&client, false).await;
        collect(&client, false).await;
        assert_eq!(connector.connects(), 1);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn close_then_complete_recreates_connection_once() {
        let connector = FakeConnector::new(Script::Respond(CompletionResponse::default()));
        let client = client(connector.clone());

        client.close().await;
        collect(&client, false).await;
        assert_eq!(connector.connects(), 1);

        client.close().await;
        client.close().await;
        assert!(!client.is_connected().await);

        collect(&client, false).await;
        collect(&client, false).await;
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_connection() {
        let connector = FakeConnector::new(Script::Respond(CompletionResponse {
            content: Some("ok".to_string()),
            ..CompletionResponse::default()
        }));
        let client = client(connector.clone());

        let runs = (0..8).map(|_| collect(&client, false));
        let results = futures_util::future::join_all(runs).await;
        assert!(results.iter().all(|events| events.len() == 1));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_in_flight_response() {
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = FakeConnector::new(Script::Hang {
            chunks: vec![chunk("first")],
            dropped: dropped.clone(),
        });
        let client = client(connector);

        let mut events = client.complete(&hello(), true).expect("valid");
        let first = events.next().await.expect("first event");
        assert_eq!(first.event_type(), EventType::TextDelta);
        assert!(!dropped.load(Ordering::SeqCst));

        drop(events);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_does_not_abort_in_flight_stream() {
        let connector = FakeConnector::new(Script::Chunks {
            chunks: vec![chunk("a"), chunk("b")],
            then_fail: None,
        });
        let client = client(connector.clone());

        let mut events = client.complete(&hello(), true).expect("valid");
        assert!(events.next().await.is_some());
        client.close().await;
        let rest: Vec<StreamEvent> = events.collect().await;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].event_type(), EventType::MessageComplete);
        assert_eq!(connector.connects(), 1);
    }
}
