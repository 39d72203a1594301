//! Debounced rendering of streamed text into one host message.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use voxrelay_config::DeliveryConfig;
use voxrelay_core::error::DeliveryError;
use voxrelay_core::surface::{DeliverySurface, MessageHandle};

use crate::split::split_message;
use crate::throttle::EditThrottle;

/// Glyphs appended to non-final edits to signal "still typing".
const CURSOR_GLYPHS: [char; 4] = ['▌', '▐', '▖', '▗'];

/// Bytes reserved per chunk for the part annotation when splitting.
const PART_ANNOTATION_RESERVE: usize = 12;

enum RenderMsg {
    Update(String),
    Finalize {
        text: String,
        done: oneshot::Sender<Result<(), DeliveryError>>,
    },
}

/// Renders a streaming response into one message via throttled edits.
///
/// A single task owns all delivery state. Updates overwrite a
/// latest-pending-text slot; one timer at a time drives the actual edit,
/// so edits to the message are strictly serialized. On finalize the text
/// is split if it exceeds the single-message ceiling and the parts go out
/// in order.
pub struct ResponseRenderer {
    tx: mpsc::Sender<RenderMsg>,
}

impl ResponseRenderer {
    /// Start a renderer for the message at `handle` in `target`.
    pub fn spawn(
        surface: Arc<dyn DeliverySurface>,
        target: String,
        handle: MessageHandle,
        config: DeliveryConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(render_task(surface, target, handle, config, rx));
        Self { tx }
    }

    /// Replace the pending text. Never blocks the streaming path on the
    /// edit cadence; if the renderer is gone the update is dropped.
    pub fn update(&self, text: String) {
        let _ = self.tx.try_send(RenderMsg::Update(text));
    }

    /// Write the final text and shut the renderer down.
    pub async fn finalize(self, text: String) -> Result<(), DeliveryError> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(RenderMsg::Finalize { text, done })
            .await
            .map_err(|_| DeliveryError::Finalized)?;
        result.await.map_err(|_| DeliveryError::Finalized)?
    }
}

struct DeliveryState {
    surface: Arc<dyn DeliverySurface>,
    target: String,
    handle: MessageHandle,
    config: DeliveryConfig,
    throttle: EditThrottle,
    cursor_frame: usize,
}

async fn render_task(
    surface: Arc<dyn DeliverySurface>,
    target: String,
    handle: MessageHandle,
    config: DeliveryConfig,
    mut rx: mpsc::Receiver<RenderMsg>,
) {
    let mut state = DeliveryState {
        surface,
        target,
        handle,
        throttle: EditThrottle::new(config),
        config,
        cursor_frame: 0,
    };
    let mut pending: Option<String> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
        tokio::select! {
            // Drain queued updates before firing the timer, so an edit
            // always carries the newest text.
            biased;
            msg = rx.recv() => match msg {
                Some(RenderMsg::Update(text)) => {
                    pending = Some(text);
                    if deadline.is_none() {
                        let now = Instant::now();
                        deadline = Some(now + state.throttle.next_delay(now));
                    }
                }
                Some(RenderMsg::Finalize { text, done }) => {
                    let _ = done.send(state.finalize(&text).await);
                    return;
                }
                None => return,
            },
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                deadline = None;
                if let Some(text) = pending.take() {
                    state.interim_edit(&text).await;
                }
            }
        }
    }
}

impl DeliveryState {
    /// One throttled non-final edit, cursor glyph appended.
    async fn interim_edit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let limit = self.message_limit();
        // While streaming, show only what fits; overflow is resolved at
        // finalize time by splitting.
        let shown = truncated(text, limit.saturating_sub(4));
        let glyph = CURSOR_GLYPHS[self.cursor_frame % CURSOR_GLYPHS.len()];
        self.cursor_frame += 1;
        let content = format!("{shown} {glyph}");

        let now = Instant::now();
        match self.surface.edit(&self.handle, &content).await {
            Ok(()) => self.throttle.note_edit(now),
            Err(e) => {
                debug!(error = %e, "Interim edit rejected, dropping to sustained cadence");
                self.throttle.note_failure(now);
            }
        }
    }

    /// Final edit: respect the throttle once more, then write the clean
    /// text, splitting into ordered parts when it exceeds the limit.
    async fn finalize(&mut self, text: &str) -> Result<(), DeliveryError> {
        let now = Instant::now();
        let delay = self.throttle.next_delay(now);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let limit = self.message_limit();
        if text.len() <= limit {
            return self.surface.edit(&self.handle, text).await;
        }

        let chunks = split_message(text, limit.saturating_sub(PART_ANNOTATION_RESERVE));
        let total = chunks.len();
        debug!(total, "Final text exceeds message limit, splitting");

        let mut first_error = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let content = if total > 1 {
                format!("{chunk} ({}/{total})", i + 1)
            } else {
                chunk.clone()
            };
            let result = if i == 0 {
                self.surface.edit(&self.handle, &content).await
            } else {
                // Fixed pause between follow-up sends preserves ordering.
                tokio::time::sleep(Duration::from_millis(self.config.chunk_delay_ms)).await;
                self.surface.send(&self.target, &content).await.map(|_| ())
            };
            if let Err(e) = result {
                warn!(part = i + 1, total, error = %e, "Failed to deliver response part");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn message_limit(&self) -> usize {
        self.config.max_message_len.min(self.surface.max_message_len())
    }
}

/// Cut to at most `limit` bytes on a char boundary.
fn truncated(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Edit(String),
        Send(String),
    }

    #[derive(Default)]
    struct RecordingSurface {
        calls: Mutex<Vec<Call>>,
        fail_edits: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DeliverySurface for RecordingSurface {
        async fn send(&self, _target: &str, content: &str) -> Result<MessageHandle, DeliveryError> {
            self.calls.lock().unwrap().push(Call::Send(content.into()));
            Ok(MessageHandle("m2".into()))
        }

        async fn edit(&self, _handle: &MessageHandle, content: &str) -> Result<(), DeliveryError> {
            if self.fail_edits.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DeliveryError::RateLimited("429".into()));
            }
            self.calls.lock().unwrap().push(Call::Edit(content.into()));
            Ok(())
        }
    }

    fn renderer(surface: Arc<RecordingSurface>) -> ResponseRenderer {
        ResponseRenderer::spawn(
            surface,
            "chan-1".into(),
            MessageHandle("m1".into()),
            DeliveryConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn updates_are_debounced_to_latest_text() {
        let surface = Arc::new(RecordingSurface::default());
        let r = renderer(surface.clone());

        r.update("Hel".into());
        r.update("Hello".into());
        r.update("Hello there".into());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let calls = surface.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Edit(content) => assert!(content.starts_with("Hello there")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interim_edits_carry_cursor_glyph_final_does_not() {
        let surface = Arc::new(RecordingSurface::default());
        let r = renderer(surface.clone());

        r.update("Working on it".into());
        tokio::time::sleep(Duration::from_millis(200)).await;
        r.finalize("Working on it. Done.".into()).await.unwrap();

        let calls = surface.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Edit(content) => {
                let last = content.chars().last().unwrap();
                assert!(CURSOR_GLYPHS.contains(&last), "no glyph in {content:?}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls[1], Call::Edit("Working on it. Done.".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_splits_long_text_into_annotated_parts() {
        let surface = Arc::new(RecordingSurface::default());
        let r = renderer(surface.clone());

        let text = "A full sentence here. ".repeat(200); // ~4400 bytes
        r.finalize(text).await.unwrap();

        let calls = surface.calls.lock().unwrap().clone();
        assert!(calls.len() >= 3);
        assert!(matches!(calls[0], Call::Edit(_)));
        for call in &calls[1..] {
            assert!(matches!(call, Call::Send(_)));
        }
        let total = calls.len();
        match &calls[0] {
            Call::Edit(content) => assert!(content.ends_with(&format!("(1/{total})"))),
            other => panic!("unexpected {other:?}"),
        }
        match calls.last().unwrap() {
            Call::Send(content) => assert!(content.ends_with(&format!("({total}/{total})"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_interim_edit_does_not_kill_finalize() {
        let surface = Arc::new(RecordingSurface::default());
        let r = renderer(surface.clone());

        surface
            .fail_edits
            .store(true, std::sync::atomic::Ordering::SeqCst);
        r.update("partial".into());
        tokio::time::sleep(Duration::from_millis(200)).await;
        surface
            .fail_edits
            .store(false, std::sync::atomic::Ordering::SeqCst);

        r.finalize("the full answer".into()).await.unwrap();
        let calls = surface.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![Call::Edit("the full answer".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_without_updates_edits_once() {
        let surface = Arc::new(RecordingSurface::default());
        let r = renderer(surface.clone());

        r.finalize("short answer".into()).await.unwrap();
        let calls = surface.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![Call::Edit("short answer".into())]);
    }
}
