//! The completion client: request building, retry, and the stream task.

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use voxrelay_config::CompletionConfig;
use voxrelay_core::error::ClientError;
use voxrelay_core::message::{Message, Role, ToolDefinition, ToolInvocation};

use crate::segment::SentenceSegmenter;
use crate::sse::{ParserEvent, StreamParser};

/// How incremental text leaves the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Every delta, unsegmented — fastest path for text rendering.
    Chunks,
    /// Sentence/clause units — for voice playback.
    Sentences,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub mode: OutputMode,
}

impl StreamRequest {
    pub fn chunks(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            mode: OutputMode::Chunks,
        }
    }

    pub fn sentences(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            mode: OutputMode::Sentences,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Events delivered while a response streams in.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One increment plus the full text so far (chunk mode).
    Delta { delta: String, text: String },
    /// One sentence/clause unit ready for playback (sentence mode).
    Sentence(String),
    /// A fully accumulated, validated tool invocation.
    ToolCall(ToolInvocation),
    /// The stream finished; fires exactly once with the complete text.
    Done { text: String },
}

/// Client for an OpenAI-compatible streaming completion endpoint.
pub struct CompletionClient {
    config: CompletionConfig,
    http: reqwest::Client,
}

impl CompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ClientError::Network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    /// Open a streaming completion request.
    ///
    /// Transient upstream failures (HTTP 5xx) are retried up to
    /// `max_retries` more times with a linear `retry_backoff_ms × attempt`
    /// delay; any other failure surfaces immediately. The returned
    /// receiver yields stream events until `Done`.
    pub async fn stream(
        &self,
        request: StreamRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ClientError>>, ClientError> {
        let body = self.build_body(&request);
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut attempt: u32 = 0;
        let response = loop {
            attempt += 1;
            debug!(model = %self.config.model, attempt, "Sending completion request");

            match self.send_once(&url, &body).await {
                Ok(response) => break response,
                Err(e) if e.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_backoff_ms * attempt as u64;
                    warn!(error = %e, attempt, delay_ms = delay, "Transient upstream failure, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let min_words_clause = self.config.min_words_clause;
        tokio::spawn(run_stream(response, request.mode, min_words_clause, tx));
        Ok(rx)
    }

    async fn send_once(
        &self,
        url: &str,
        body: &RequestBody,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if (500..600).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status_code: status,
                message,
            });
        }
        if status != 200 {
            let message = response.text().await.unwrap_or_default();
            warn!(status, body = %message, "Completion request rejected");
            return Err(ClientError::Rejected {
                status_code: status,
                message,
            });
        }
        Ok(response)
    }

    fn build_body(&self, request: &StreamRequest) -> RequestBody {
        let has_tools = !request.tools.is_empty();
        RequestBody {
            model: self.config.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => "system",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            stream: true,
            // Tool-augmented requests get the larger output budget.
            max_tokens: if has_tools {
                self.config.tool_max_tokens
            } else {
                self.config.max_tokens
            },
            tools: has_tools.then(|| {
                request
                    .tools
                    .iter()
                    .map(|t| ApiToolDefinition {
                        r#type: "function",
                        function: ApiToolFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            tool_choice: has_tools.then_some("auto"),
        }
    }
}

/// Read the SSE byte stream, parse frames, and fan events out.
async fn run_stream(
    response: reqwest::Response,
    mode: OutputMode,
    min_words_clause: usize,
    tx: mpsc::Sender<Result<StreamEvent, ClientError>>,
) {
    let mut parser = StreamParser::new();
    let mut segmenter = SentenceSegmenter::new(min_words_clause);
    let mut full_text = String::new();
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(ClientError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };

        for event in parser.push_bytes(&bytes) {
            if dispatch(event, mode, &mut segmenter, &mut full_text, &tx)
                .await
                .is_break()
            {
                return;
            }
        }
    }

    // Stream ended without [DONE] — drain what remains and finish anyway.
    for event in parser.finish() {
        if dispatch(event, mode, &mut segmenter, &mut full_text, &tx)
            .await
            .is_break()
        {
            return;
        }
    }
    finish_stream(mode, &mut segmenter, &full_text, &tx).await;
}

/// Forward one parser event to the caller. Break means stop reading.
async fn dispatch(
    event: ParserEvent,
    mode: OutputMode,
    segmenter: &mut SentenceSegmenter,
    full_text: &mut String,
    tx: &mpsc::Sender<Result<StreamEvent, ClientError>>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    match event {
        ParserEvent::Content(delta) => {
            full_text.push_str(&delta);
            match mode {
                OutputMode::Chunks => {
                    let event = StreamEvent::Delta {
                        delta,
                        text: full_text.clone(),
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        return ControlFlow::Break(()); // receiver dropped
                    }
                }
                OutputMode::Sentences => {
                    for sentence in segmenter.push(&delta) {
                        if tx.send(Ok(StreamEvent::Sentence(sentence))).await.is_err() {
                            return ControlFlow::Break(());
                        }
                    }
                }
            }
        }
        ParserEvent::ToolCall(invocation) => {
            if tx.send(Ok(StreamEvent::ToolCall(invocation))).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        ParserEvent::Finished => {
            finish_stream(mode, segmenter, full_text, tx).await;
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Emit the trailing sentence (if any) and the single `Done` event.
async fn finish_stream(
    mode: OutputMode,
    segmenter: &mut SentenceSegmenter,
    full_text: &str,
    tx: &mpsc::Sender<Result<StreamEvent, ClientError>>,
) {
    if mode == OutputMode::Sentences {
        if let Some(rest) = segmenter.finish() {
            if tx.send(Ok(StreamEvent::Sentence(rest))).await.is_err() {
                return;
            }
        }
    }
    let _ = tx
        .send(Ok(StreamEvent::Done {
            text: full_text.to_string(),
        }))
        .await;
}

// --- Request wire types ---

#[derive(Debug, Serialize)]
struct RequestBody {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: &'static str,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}
