//! Pending-transcript buffering and merge logic.
//!
//! At most one pending fragment exists per session. Each pending entry
//! carries an abortable continuation timer; the possible states are
//! idle (no entry), buffering (entry + armed timer), and flushed (entry
//! removed, utterance emitted). Completed utterances leave through the
//! mpsc receiver handed out at construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use voxrelay_config::TranscriptConfig;
use voxrelay_core::message::SessionKey;

use crate::rules::{looks_continuation, looks_incomplete};

/// A transcript fragment released by the filter, ready for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedUtterance {
    pub session: SessionKey,
    pub text: String,
}

struct PendingTranscript {
    text: String,
    buffered_at: Instant,
    was_incomplete: bool,
    generation: u64,
    timer: JoinHandle<()>,
}

impl PendingTranscript {
    /// Disarm the continuation timer and hand back the buffered text.
    ///
    /// Never called from inside the timer task itself — the generation
    /// check there makes a fired timer and a concurrent removal agree.
    fn cancel(self) -> String {
        self.timer.abort();
        self.text
    }
}

/// The transcript completeness filter.
///
/// Cheap to clone — all clones share the pending table and settings.
#[derive(Clone)]
pub struct TranscriptFilter {
    pending: Arc<Mutex<HashMap<SessionKey, PendingTranscript>>>,
    settings: Arc<RwLock<TranscriptConfig>>,
    generation: Arc<AtomicU64>,
    out: mpsc::Sender<CompletedUtterance>,
}

impl TranscriptFilter {
    /// Create a filter and the receiver of completed utterances.
    pub fn new(settings: TranscriptConfig) -> (Self, mpsc::Receiver<CompletedUtterance>) {
        let (out, rx) = mpsc::channel(64);
        let filter = Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(RwLock::new(settings)),
            generation: Arc::new(AtomicU64::new(0)),
            out,
        };
        (filter, rx)
    }

    /// Feed one speech-to-text fragment into the filter.
    ///
    /// Complete fragments (possibly merged with a buffered predecessor)
    /// come out on the utterance channel; incomplete ones are buffered
    /// until a continuation arrives or the continuation timer fires.
    pub async fn process(&self, session: SessionKey, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let settings = *self.settings.read().await;
        let mut pending = self.pending.lock().await;

        // Emitted only after the lock is released — a slow utterance
        // consumer must never stall other sessions or the timer tasks.
        let mut stale_flush = None;

        if let Some(entry) = pending.remove(&session) {
            let elapsed = entry.buffered_at.elapsed();
            let within_window = elapsed < Duration::from_millis(settings.merge_window_ms);
            let was_incomplete = entry.was_incomplete;
            let buffered_text = entry.cancel();

            if within_window && (was_incomplete || looks_continuation(text)) {
                let merged = format!("{buffered_text} {text}");
                if looks_incomplete(&merged, settings.min_words_for_complete) {
                    trace!(session = %session, "Merged fragment still incomplete, re-buffering");
                    let rearmed = self.arm(&session, merged, true, &settings);
                    pending.insert(session, rearmed);
                    return;
                }
                drop(pending);
                debug!(session = %session, "Merged fragment complete");
                self.emit(session, merged).await;
                return;
            }

            // Stale or unrelated — flush the buffered text as-is and treat
            // the new fragment as fresh input.
            trace!(session = %session, "Flushing stale pending fragment");
            stale_flush = Some(buffered_text);
        }

        if looks_incomplete(text, settings.min_words_for_complete) {
            let entry = self.arm(&session, text.to_string(), true, &settings);
            pending.insert(session.clone(), entry);
            drop(pending);
            if let Some(stale) = stale_flush {
                self.emit(session, stale).await;
            }
        } else {
            drop(pending);
            if let Some(stale) = stale_flush {
                self.emit(session.clone(), stale).await;
            }
            self.emit(session, text.to_string()).await;
        }
    }

    /// Build a pending entry with a fresh continuation timer.
    fn arm(
        &self,
        session: &SessionKey,
        text: String,
        was_incomplete: bool,
        settings: &TranscriptConfig,
    ) -> PendingTranscript {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = Duration::from_millis(settings.continuation_timeout_ms);

        let pending = self.pending.clone();
        let out = self.out.clone();
        let timer_session = session.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut map = pending.lock().await;
            let flush = match map.get(&timer_session) {
                Some(entry) if entry.generation == generation => {
                    map.remove(&timer_session)
                }
                _ => None, // Superseded or already flushed
            };
            drop(map);
            if let Some(entry) = flush {
                debug!(session = %timer_session, "Continuation timeout, flushing fragment");
                send_utterance(&out, timer_session, entry.text).await;
            }
        });

        PendingTranscript {
            text,
            buffered_at: Instant::now(),
            was_incomplete,
            generation,
            timer,
        }
    }

    async fn emit(&self, session: SessionKey, text: String) {
        send_utterance(&self.out, session, text).await;
    }

    /// Flush a session's pending fragment immediately, if any.
    pub async fn flush_session(&self, session: &SessionKey) {
        let entry = self.pending.lock().await.remove(session);
        if let Some(entry) = entry {
            let text = entry.cancel();
            self.emit(session.clone(), text).await;
        }
    }

    /// Discard a session's pending fragment without emitting it.
    pub async fn clear_session(&self, session: &SessionKey) {
        if let Some(entry) = self.pending.lock().await.remove(session) {
            entry.cancel();
        }
    }

    /// Discard all pending fragments whose session belongs to `scope`.
    pub async fn clear_scope(&self, scope: &str) {
        let mut pending = self.pending.lock().await;
        let keys: Vec<SessionKey> = pending
            .keys()
            .filter(|key| key.scope == scope)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = pending.remove(key) {
                entry.cancel();
            }
        }
        if !keys.is_empty() {
            debug!(scope, removed = keys.len(), "Cleared pending fragments for scope");
        }
    }

    /// Replace the runtime-adjustable settings.
    pub async fn update_settings(&self, settings: TranscriptConfig) {
        *self.settings.write().await = settings;
    }

    /// Current settings snapshot.
    pub async fn settings(&self) -> TranscriptConfig {
        *self.settings.read().await
    }

    /// Number of sessions with a buffered fragment (observability).
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

async fn send_utterance(
    out: &mpsc::Sender<CompletedUtterance>,
    session: SessionKey,
    text: String,
) {
    if out
        .send(CompletedUtterance { session: session.clone(), text })
        .await
        .is_err()
    {
        warn!(session = %session, "Utterance receiver dropped, discarding fragment");
    }
}
