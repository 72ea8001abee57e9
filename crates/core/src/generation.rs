//! Grounded answer generation.
//!
//! [`AnswerGenerator`] renders the retrieved chunks and the question into a
//! fixed instruction template and hands it to a [`LanguageModel`]. Output
//! arrives as an [`AnswerStream`]: a one-shot, forward-only sequence of text
//! fragments that ends with an explicit completion or error signal.

use crate::embeddings::OPENAI_DEFAULT_BASE_URL;
use crate::error::GenerationError;
use crate::models::RetrievalResult;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const OPENAI_DEFAULT_CHAT_MODEL: &str = "gpt-4o";
const STREAM_BUFFER: usize = 64;

pub const PROMPT_TEMPLATE: &str = "\
You are a helpful assistant that answers questions about a provided document.
Answer the user's question using only the context below.
If the answer is not contained in the context, say that you could not find the answer in the document.
Do not make up information.

Context:
{context}

Question:
{question}

Answer{language}:
";

pub fn build_prompt(
    question: &str,
    retrieval: &RetrievalResult,
    answer_language: Option<&str>,
) -> String {
    let context = retrieval
        .chunks
        .iter()
        .map(|retrieved| retrieved.chunk.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    let language = answer_language
        .map(|language| format!(" (in {language})"))
        .unwrap_or_default();

    render_template(
        PROMPT_TEMPLATE,
        &[
            ("{context}", context.as_str()),
            ("{question}", question.trim()),
            ("{language}", language.as_str()),
        ],
    )
}

/// Fills placeholders in one left-to-right pass over `template`. Inserted
/// values are never scanned again.
fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                rendered.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }

    rendered.push_str(rest);
    rendered
}

#[derive(Debug)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    Error(GenerationError),
}

/// Producer half of an [`AnswerStream`].
pub struct AnswerSender {
    sender: mpsc::Sender<StreamEvent>,
}

impl AnswerSender {
    /// Returns `false` once the reader has gone away.
    pub async fn fragment(&self, text: impl Into<String>) -> bool {
        self.sender
            .send(StreamEvent::Fragment(text.into()))
            .await
            .is_ok()
    }

    pub async fn done(self) {
        let _ = self.sender.send(StreamEvent::Done).await;
    }

    pub async fn fail(self, error: GenerationError) {
        let _ = self.sender.send(StreamEvent::Error(error)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Single-reader answer fragments. Dropping the stream stops the producer.
pub struct AnswerStream {
    receiver: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl AnswerStream {
    pub fn channel(capacity: usize) -> (AnswerSender, AnswerStream) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            AnswerSender { sender },
            AnswerStream {
                receiver,
                finished: false,
            },
        )
    }

    /// A completed stream over fixed fragments.
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events: Vec<StreamEvent> = fragments
            .into_iter()
            .map(|fragment| StreamEvent::Fragment(fragment.into()))
            .chain(std::iter::once(StreamEvent::Done))
            .collect();
        let (sender, receiver) = mpsc::channel(events.len());
        for event in events {
            // capacity covers every event
            let _ = sender.try_send(event);
        }
        AnswerStream {
            receiver,
            finished: false,
        }
    }

    /// Next fragment, `None` after completion. A producer that disappears
    /// without signalling completion surfaces as [`GenerationError::Stream`].
    pub async fn next_fragment(&mut self) -> Option<Result<String, GenerationError>> {
        if self.finished {
            return None;
        }

        match self.receiver.recv().await {
            Some(StreamEvent::Fragment(text)) => Some(Ok(text)),
            Some(StreamEvent::Done) => {
                self.finished = true;
                None
            }
            Some(StreamEvent::Error(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            None => {
                self.finished = true;
                Some(Err(GenerationError::Stream(
                    "stream ended before completion".to_string(),
                )))
            }
        }
    }

    pub async fn collect_text(mut self) -> Result<String, GenerationError> {
        let mut answer = String::new();
        while let Some(fragment) = self.next_fragment().await {
            answer.push_str(&fragment?);
        }
        Ok(answer)
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<AnswerStream, GenerationError>;
}

pub struct AnswerGenerator {
    model: Arc<dyn LanguageModel>,
    answer_language: Option<String>,
}

impl AnswerGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, answer_language: Option<String>) -> Self {
        Self {
            model,
            answer_language,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
    ) -> Result<AnswerStream, GenerationError> {
        let prompt = build_prompt(question, retrieval, self.answer_language.as_deref());
        debug!(
            prompt_chars = prompt.len(),
            context_chunks = retrieval.len(),
            "prompting language model"
        );
        self.model.complete(&prompt).await
    }
}

/// Chat completions over an OpenAI-compatible endpoint with SSE streaming.
/// Point `base_url` at a local server to use a local model.
pub struct OpenAiChatModel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    timeout: Option<Duration>,
}

impl OpenAiChatModel {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: OPENAI_DEFAULT_BASE_URL.to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model: OPENAI_DEFAULT_CHAT_MODEL.to_string(),
            temperature: 0.0,
            timeout: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Bounds the wait for the response headers. The body streams unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, prompt: &str) -> Result<AnswerStream, GenerationError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": self.temperature,
                "stream": true,
            }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let sent = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, request.send())
                .await
                .map_err(|_| {
                    GenerationError::Request(format!("no response within {timeout:?}"))
                })?,
            None => request.send().await,
        };
        let response = sent.map_err(|error| {
            error!(error = %error, "chat request failed");
            GenerationError::Request(error.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "chat api error");
            return Err(map_status(status, body));
        }

        info!(model = %self.model, "answer stream started");
        let (sender, stream) = AnswerStream::channel(STREAM_BUFFER);
        tokio::spawn(pump_sse(response, sender));
        Ok(stream)
    }
}

fn map_status(status: StatusCode, body: String) -> GenerationError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::Auth(body),
        _ => GenerationError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Skip,
    Delta {
        content: Option<String>,
        finished: bool,
    },
    Done,
    Error(String),
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let parsed: Value = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(error) => return SseLine::Error(format!("malformed stream frame: {error}")),
    };
    if let Some(message) = parsed.pointer("/error/message").and_then(Value::as_str) {
        return SseLine::Error(message.to_string());
    }

    let content = parsed
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(str::to_string);
    let finished = parsed
        .pointer("/choices/0/finish_reason")
        .is_some_and(|reason| !reason.is_null());

    SseLine::Delta { content, finished }
}

async fn pump_sse(mut response: Response, sender: AnswerSender) {
    let mut pending: Vec<u8> = Vec::new();
    let mut finished = false;

    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                pending.extend_from_slice(&bytes);
                while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=newline).collect();
                    match parse_sse_line(&String::from_utf8_lossy(&raw)) {
                        SseLine::Skip => {}
                        SseLine::Delta { content, finished: last } => {
                            finished |= last;
                            if let Some(content) = content {
                                if !sender.fragment(content).await {
                                    debug!("answer stream dropped by reader");
                                    return;
                                }
                            }
                        }
                        SseLine::Done => {
                            sender.done().await;
                            return;
                        }
                        SseLine::Error(message) => {
                            sender.fail(GenerationError::Stream(message)).await;
                            return;
                        }
                    }
                }
            }
            Ok(None) if finished => {
                sender.done().await;
                return;
            }
            Ok(None) => {
                sender
                    .fail(GenerationError::Stream(
                        "response ended before completion".to_string(),
                    ))
                    .await;
                return;
            }
            Err(error) => {
                sender.fail(GenerationError::Request(error.to_string())).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, RetrievedChunk};

    fn retrieval(texts: &[&str]) -> RetrievalResult {
        RetrievalResult {
            query: "q".to_string(),
            chunks: texts
                .iter()
                .enumerate()
                .map(|(index, text)| RetrievedChunk {
                    chunk: Chunk {
                        chunk_id: format!("chunk-{index}"),
                        document_name: "doc.pdf".to_string(),
                        page_number: 1,
                        chunk_index: index as u64,
                        start_char: 0,
                        text: text.to_string(),
                    },
                    relevance: 1.0,
                })
                .collect(),
        }
    }

    #[test]
    fn prompt_embeds_context_and_question() {
        let prompt = build_prompt(
            "What is the capital of France?",
            &retrieval(&["The capital of France is Paris.", "Lyon is in France."]),
            None,
        );

        assert!(
            prompt.contains("Context:\nThe capital of France is Paris.\n\nLyon is in France.\n")
        );
        assert!(prompt.contains("Question:\nWhat is the capital of France?\n"));
        assert!(prompt.contains("using only the context"));
        assert!(prompt.contains("Do not make up information."));
        assert!(prompt.ends_with("Answer:\n"));
    }

    #[test]
    fn prompt_can_request_an_answer_language() {
        let prompt = build_prompt("Q?", &retrieval(&["ctx"]), Some("Vietnamese"));
        assert!(prompt.ends_with("Answer (in Vietnamese):\n"));
    }

    #[test]
    fn placeholders_inside_documents_and_questions_stay_literal() {
        let prompt = build_prompt(
            "Where does {language} go?",
            &retrieval(&["Use the {question} placeholder in templates. See {context}."]),
            Some("French"),
        );

        assert!(prompt.contains(
            "Context:\nUse the {question} placeholder in templates. See {context}.\n"
        ));
        assert!(prompt.contains("Question:\nWhere does {language} go?\n"));
        assert!(prompt.ends_with("Answer (in French):\n"));
    }

    #[tokio::test]
    async fn stream_concatenates_fragments_then_ends() {
        let mut stream = AnswerStream::from_fragments(["The capital ", "is ", "Paris."]);
        let mut seen = Vec::new();
        while let Some(fragment) = stream.next_fragment().await {
            seen.push(fragment.unwrap());
        }
        assert_eq!(seen.concat(), "The capital is Paris.");
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn producer_error_is_surfaced_once() {
        let (sender, mut stream) = AnswerStream::channel(4);
        assert!(sender.fragment("partial").await);
        sender
            .fail(GenerationError::RateLimited("slow down".to_string()))
            .await;

        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "partial");
        assert!(matches!(
            stream.next_fragment().await,
            Some(Err(GenerationError::RateLimited(_)))
        ));
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn producer_vanishing_without_done_is_an_error() {
        let (sender, stream) = AnswerStream::channel(4);
        assert!(sender.fragment("half an ans").await);
        drop(sender);

        assert!(matches!(
            stream.collect_text().await,
            Err(GenerationError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn dropping_reader_closes_producer() {
        let (sender, stream) = AnswerStream::channel(1);
        drop(stream);
        assert!(sender.is_closed());
        assert!(!sender.fragment("ignored").await);
    }

    #[test]
    fn sse_lines_are_parsed() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#),
            SseLine::Delta {
                content: Some("Hel".to_string()),
                finished: false
            }
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            SseLine::Delta {
                content: None,
                finished: true
            }
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
        assert!(matches!(
            parse_sse_line(r#"data: {"error":{"message":"quota exceeded"}}"#),
            SseLine::Error(message) if message == "quota exceeded"
        ));
    }

    #[test]
    fn http_status_maps_to_generation_errors() {
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            GenerationError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, String::new()),
            GenerationError::Auth(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, String::new()),
            GenerationError::Status { status: 502, .. }
        ));
    }

    /// Serves one chunked `text/event-stream` response, writing each piece
    /// as its own network chunk.
    async fn serve_sse(pieces: Vec<&'static str>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    return;
                }
                request.extend_from_slice(&buffer[..read]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let body_len = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + body_len {
                        break;
                    }
                }
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            for piece in pieces {
                let frame = format!("{:x}\r\n{piece}\r\n", piece.len());
                socket.write_all(frame.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        format!("http://{address}")
    }

    #[tokio::test]
    async fn sse_frames_split_across_chunks_complete_on_finish_reason() {
        let base_url = serve_sse(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"The capital \"},\"fin",
            "ish_reason\":null}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"is Paris.\"},\"finish_reason\":null}]}\n",
            "\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        ])
        .await;

        let model = OpenAiChatModel::new(None)
            .with_base_url(base_url)
            .with_timeout(Duration::from_secs(5));
        let answer = model
            .complete("Where?")
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(answer, "The capital is Paris.");
    }

    #[tokio::test]
    async fn sse_body_ending_without_completion_is_a_stream_error() {
        let base_url = serve_sse(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"The capital\"},\"finish_reason\":null}]}\n\n",
        ])
        .await;

        let stream = OpenAiChatModel::new(None)
            .with_base_url(base_url)
            .complete("Where?")
            .await
            .unwrap();
        assert!(matches!(
            stream.collect_text().await,
            Err(GenerationError::Stream(_))
        ));
    }

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn complete(&self, prompt: &str) -> Result<AnswerStream, GenerationError> {
            Ok(AnswerStream::from_fragments(prompt.split_inclusive(' ')))
        }
    }

    #[tokio::test]
    async fn generator_sends_rendered_prompt() {
        let generator = AnswerGenerator::new(Arc::new(EchoModel), None);
        let answer = generator
            .generate("Where?", &retrieval(&["The capital of France is Paris."]))
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert!(answer.contains("The capital of France is Paris."));
        assert!(answer.contains("Where?"));
    }
}
