//! Response orchestration.
//!
//! Ties the pipeline together: a user message is recorded into memory,
//! a prompt is built from session history, the completion request is
//! gated by the admission queue, streamed output is rendered through the
//! delivery scheduler (text) or a speech sink (voice), and the finished
//! response is written back to memory. All failure handling lives here:
//! completion failures surface as a generic apology, rendering failures
//! degrade silently, and nothing is fatal to the process.

use std::sync::Arc;
use tracing::{debug, info, warn};
use voxrelay_client::{CompletionClient, StreamEvent, StreamRequest};
use voxrelay_config::AppConfig;
use voxrelay_core::error::{ClientError, Error};
use voxrelay_core::message::{
    ConversationTurn, Role, SessionKey, ToolDefinition, ToolInvocation,
};
use voxrelay_core::surface::{DeliverySurface, SpeechSink};
use voxrelay_core::worker::{WorkerHandle, WorkerPool};
use voxrelay_delivery::ResponseRenderer;
use voxrelay_memory::MemoryStore;
use voxrelay_queue::{AdmissionQueue, QueueStatus};

/// Shown when the completion request itself fails after retries.
const APOLOGY: &str =
    "Sorry, I hit a problem generating that response. Please try again in a moment.";

/// Placeholder content for the message that streaming edits replace.
const PLACEHOLDER: &str = "…";

/// Memory marker written instead of the assistant turn when a voice
/// response was cancelled while streaming.
const CANCELLED_MARKER: &str = "[response cancelled]";

/// One inbound text message to respond to.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub session: SessionKey,
    /// Channel/DM id the response goes to.
    pub target: String,
    pub speaker_id: Option<String>,
    pub speaker_name: Option<String>,
    pub content: String,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
}

/// One completed (merged) voice utterance to respond to.
#[derive(Debug, Clone)]
pub struct VoiceRequest {
    pub session: SessionKey,
    pub speaker_id: Option<String>,
    pub speaker_name: Option<String>,
    pub content: String,
    pub system_prompt: String,
}

/// What a finished text response produced.
#[derive(Debug, Clone)]
pub struct TextOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

/// The full response pipeline for one assistant instance.
pub struct ResponsePipeline {
    config: AppConfig,
    memory: MemoryStore,
    client: CompletionClient,
    surface: Arc<dyn DeliverySurface>,
    workers: Option<Arc<dyn WorkerPool>>,
    text_queue: AdmissionQueue,
    image_queue: AdmissionQueue,
}

impl ResponsePipeline {
    pub fn new(
        config: AppConfig,
        memory: MemoryStore,
        client: CompletionClient,
        surface: Arc<dyn DeliverySurface>,
        workers: Option<Arc<dyn WorkerPool>>,
    ) -> Self {
        let text_queue = AdmissionQueue::new("text", config.queue.text_max_concurrent);
        let image_queue = AdmissionQueue::new("image", config.queue.image_max_concurrent);
        Self {
            config,
            memory,
            client,
            surface,
            workers,
            text_queue,
            image_queue,
        }
    }

    /// Respond to a text message: stream the completion into an edited
    /// host message, then record the turn.
    pub async fn respond_text(&self, request: TextRequest) -> Result<TextOutcome, Error> {
        info!(session = %request.session, "Handling text request");
        self.record_user_turn(
            &request.session,
            request.speaker_id.as_deref(),
            request.speaker_name.as_deref(),
            &request.content,
        )
        .await?;

        let messages = self
            .memory
            .build_prompt_messages(
                &request.session,
                &request.system_prompt,
                request.speaker_name.as_deref(),
                &request.content,
            )
            .await?;

        let worker = self.checkout_worker(&request.session).await;
        let result = self
            .text_queue
            .run(self.run_text_response(&request, messages))
            .await;
        self.checkin_worker(worker, &request.session).await;

        match result {
            Ok(Ok(outcome)) => {
                self.memory
                    .add_turn(
                        &request.session,
                        ConversationTurn::new(Role::Assistant, outcome.text.clone()),
                    )
                    .await?;
                Ok(outcome)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        }
    }

    /// Respond to a voice utterance: stream sentence units into the
    /// speech sink. `is_cancelled` is checked once after streaming; a
    /// cancelled response leaves a marker turn instead of the text.
    pub async fn respond_voice<F>(
        &self,
        request: VoiceRequest,
        sink: Arc<dyn SpeechSink>,
        is_cancelled: F,
    ) -> Result<Option<String>, Error>
    where
        F: Fn() -> bool + Send,
    {
        info!(session = %request.session, "Handling voice request");
        self.record_user_turn(
            &request.session,
            request.speaker_id.as_deref(),
            request.speaker_name.as_deref(),
            &request.content,
        )
        .await?;

        let messages = self
            .memory
            .build_prompt_messages(
                &request.session,
                &request.system_prompt,
                request.speaker_name.as_deref(),
                &request.content,
            )
            .await?;

        let worker = self.checkout_worker(&request.session).await;
        let result = self
            .text_queue
            .run(self.run_voice_response(&request.session, messages, sink))
            .await;
        self.checkin_worker(worker, &request.session).await;

        let text = match result {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(e.into()),
        };

        if is_cancelled() {
            debug!(session = %request.session, "Voice response cancelled after streaming");
            self.memory
                .add_turn(
                    &request.session,
                    ConversationTurn::new(Role::Assistant, CANCELLED_MARKER),
                )
                .await?;
            return Ok(None);
        }

        self.memory
            .add_turn(
                &request.session,
                ConversationTurn::new(Role::Assistant, text.clone()),
            )
            .await?;
        Ok(Some(text))
    }

    /// Gate an image-generation job on the image admission queue.
    pub async fn run_image_task<F, T>(&self, task: F) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        self.image_queue.run(task).await.map_err(Error::from)
    }

    pub fn text_queue_status(&self) -> QueueStatus {
        self.text_queue.status()
    }

    pub fn image_queue_status(&self) -> QueueStatus {
        self.image_queue.status()
    }

    /// Flush memory to its snapshot. Call on shutdown.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.memory.flush().await?;
        Ok(())
    }

    async fn run_text_response(
        &self,
        request: &TextRequest,
        messages: Vec<voxrelay_core::message::Message>,
    ) -> Result<TextOutcome, Error> {
        let handle = self
            .surface
            .send(&request.target, PLACEHOLDER)
            .await
            .map_err(Error::from)?;
        let renderer = ResponseRenderer::spawn(
            self.surface.clone(),
            request.target.clone(),
            handle,
            self.config.delivery,
        );

        let stream_request =
            StreamRequest::chunks(messages).with_tools(request.tools.clone());
        let mut rx = match self.client.stream(stream_request).await {
            Ok(rx) => rx,
            Err(e) => {
                self.apologize(renderer).await;
                return Err(e.into());
            }
        };

        let mut tool_calls = Vec::new();
        let mut final_text = None;
        while let Some(event) = rx.recv().await {
            match event {
                Ok(StreamEvent::Delta { text, .. }) => renderer.update(text),
                Ok(StreamEvent::ToolCall(call)) => tool_calls.push(call),
                Ok(StreamEvent::Done { text }) => {
                    final_text = Some(text);
                    break;
                }
                Ok(StreamEvent::Sentence(_)) => {}
                Err(e) => {
                    self.apologize(renderer).await;
                    return Err(e.into());
                }
            }
        }
        let Some(text) = final_text else {
            self.apologize(renderer).await;
            return Err(ClientError::StreamInterrupted("stream ended early".into()).into());
        };

        if let Err(e) = renderer.finalize(text.clone()).await {
            // Rendering already degraded as far as it could; tell the
            // user something went out even if the message is stale.
            warn!(session = %request.session, error = %e, "Final delivery failed");
            let _ = self.surface.send(&request.target, APOLOGY).await;
        }
        Ok(TextOutcome { text, tool_calls })
    }

    async fn run_voice_response(
        &self,
        session: &SessionKey,
        messages: Vec<voxrelay_core::message::Message>,
        sink: Arc<dyn SpeechSink>,
    ) -> Result<String, Error> {
        let mut rx = self
            .client
            .stream(StreamRequest::sentences(messages))
            .await
            .map_err(Error::from)?;

        let mut final_text = None;
        while let Some(event) = rx.recv().await {
            match event {
                Ok(StreamEvent::Sentence(sentence)) => {
                    if let Err(e) = sink.say(session, &sentence).await {
                        warn!(session = %session, error = %e, "Speech playback failed");
                    }
                }
                Ok(StreamEvent::Done { text }) => {
                    final_text = Some(text);
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
        final_text
            .ok_or_else(|| ClientError::StreamInterrupted("stream ended early".into()).into())
    }

    /// Replace the placeholder with the apology text, best effort.
    async fn apologize(&self, renderer: ResponseRenderer) {
        if let Err(e) = renderer.finalize(APOLOGY.to_string()).await {
            warn!(error = %e, "Failed to deliver apology message");
        }
    }

    async fn record_user_turn(
        &self,
        session: &SessionKey,
        speaker_id: Option<&str>,
        speaker_name: Option<&str>,
        content: &str,
    ) -> Result<(), Error> {
        let mut turn = ConversationTurn::new(Role::User, content);
        if let (Some(id), Some(name)) = (speaker_id, speaker_name) {
            turn = turn.with_speaker(id, name);
        }
        self.memory.add_turn(session, turn).await?;
        Ok(())
    }

    async fn checkout_worker(&self, session: &SessionKey) -> Option<WorkerHandle> {
        let pool = self.workers.as_ref()?;
        let worker = pool.pick_worker(session).await?;
        pool.start_request(&worker).await;
        Some(worker)
    }

    async fn checkin_worker(&self, worker: Option<WorkerHandle>, session: &SessionKey) {
        let (Some(pool), Some(worker)) = (self.workers.as_ref(), worker) else {
            return;
        };
        pool.end_request(&worker).await;
        pool.record_action(&worker, session).await;
    }
}
