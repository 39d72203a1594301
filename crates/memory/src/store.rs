//! The conversational memory store implementation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use voxrelay_config::MemoryConfig;
use voxrelay_core::error::MemoryError;
use voxrelay_core::message::{ConversationTurn, Message, Role, SessionKey};

/// Per-session ordered turn buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBuffer {
    #[serde(rename = "messages")]
    pub turns: Vec<ConversationTurn>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl SessionBuffer {
    fn new() -> Self {
        Self {
            turns: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// The conversational memory store.
///
/// Cheap to clone — all clones share the same session table. Construct
/// one at startup, inject it into the pipeline, and call [`flush`] on
/// shutdown.
///
/// Snapshot writes are whole-file overwrites, not crash-atomic: a restart
/// mid-write can lose the file's prior content. Accepted risk for this
/// data (recoverable conversation context, not a system of record).
///
/// [`flush`]: MemoryStore::flush
#[derive(Clone)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<SessionKey, SessionBuffer>>>,
    config: MemoryConfig,
}

impl MemoryStore {
    /// Create a store, loading the snapshot file if one exists.
    ///
    /// Entries that expired while the process was down are filtered out
    /// during load so stale context never resurfaces.
    pub fn new(config: MemoryConfig) -> Self {
        let mut sessions = match &config.snapshot_path {
            Some(path) => Self::load_snapshot(path),
            None => HashMap::new(),
        };

        let now = Utc::now();
        let expiry_ms = config.expiry_secs as i64 * 1000;
        for buffer in sessions.values_mut() {
            buffer.turns.retain(|t| is_live(t, now, expiry_ms));
        }
        sessions.retain(|_, buffer| !buffer.turns.is_empty());

        debug!(sessions = sessions.len(), "Memory store loaded");
        Self {
            sessions: Arc::new(RwLock::new(sessions)),
            config,
        }
    }

    fn load_snapshot(path: &std::path::Path) -> HashMap<SessionKey, SessionBuffer> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return HashMap::new(), // No snapshot yet — start empty
        };

        let raw: HashMap<String, SessionBuffer> = match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "Snapshot unreadable, starting empty");
                return HashMap::new();
            }
        };

        raw.into_iter()
            .filter_map(|(key, buffer)| match key.parse::<SessionKey>() {
                Ok(key) => Some((key, buffer)),
                Err(e) => {
                    warn!(error = %e, "Skipping snapshot entry with bad key");
                    None
                }
            })
            .collect()
    }

    /// Serialize the whole store to the snapshot file.
    fn persist(&self, sessions: &HashMap<SessionKey, SessionBuffer>) -> Result<(), MemoryError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemoryError::Storage(format!("Failed to create snapshot directory: {e}"))
            })?;
        }

        let keyed: HashMap<String, &SessionBuffer> = sessions
            .iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let content = serde_json::to_string(&keyed)
            .map_err(|e| MemoryError::Snapshot(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| MemoryError::Storage(format!("Failed to write snapshot: {e}")))
    }

    /// Append a turn, enforce the size cap, and snapshot.
    ///
    /// Oldest non-permanent turns are evicted until the cap holds. If
    /// permanent turns alone meet or exceed the cap, only they remain and
    /// a capacity warning is logged.
    pub async fn add_turn(
        &self,
        key: &SessionKey,
        turn: ConversationTurn,
    ) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let buffer = sessions.entry(key.clone()).or_insert_with(SessionBuffer::new);

        buffer.turns.push(turn);
        buffer.last_updated = Utc::now();

        while buffer.turns.len() > self.config.max_messages {
            match buffer.turns.iter().position(|t| !t.permanent) {
                Some(idx) => {
                    buffer.turns.remove(idx);
                }
                None => {
                    warn!(
                        session = %key,
                        count = buffer.turns.len(),
                        max = self.config.max_messages,
                        "Permanent turns alone exceed the session cap"
                    );
                    break;
                }
            }
        }

        self.persist(&sessions)
    }

    /// Live turns for a session: permanent, or younger than the expiry.
    ///
    /// Lazily drops expired turns from the stored buffer; the snapshot is
    /// rewritten only when something was actually dropped.
    pub async fn history(&self, key: &SessionKey) -> Result<Vec<ConversationTurn>, MemoryError> {
        let mut sessions = self.sessions.write().await;
        let Some(buffer) = sessions.get_mut(key) else {
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let expiry_ms = self.config.expiry_secs as i64 * 1000;
        let before = buffer.turns.len();
        buffer.turns.retain(|t| is_live(t, now, expiry_ms));
        let dropped = before - buffer.turns.len();

        let turns = buffer.turns.clone();
        if dropped > 0 {
            debug!(session = %key, dropped, "Expired turns dropped on read");
            self.persist(&sessions)?;
        }
        Ok(turns)
    }

    /// Build the ordered prompt message list for a completion request:
    /// `[system, ...history, current user message]`.
    ///
    /// If the most recent history turn is a user turn identical to
    /// `new_content` it is excluded — callers record the turn before
    /// building the prompt, and it must not appear twice. When history is
    /// non-empty, the system prompt gains a short continuity note.
    pub async fn build_prompt_messages(
        &self,
        key: &SessionKey,
        system_prompt: &str,
        speaker_name: Option<&str>,
        new_content: &str,
    ) -> Result<Vec<Message>, MemoryError> {
        let mut history = self.history(key).await?;

        if history
            .last()
            .is_some_and(|t| t.role == Role::User && t.content == new_content)
        {
            history.pop();
        }

        let system_text = if history.is_empty() {
            system_prompt.to_string()
        } else {
            format!(
                "{system_prompt}\n\nYou have context from earlier in this conversation; \
                 use it for continuity."
            )
        };

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system_text));

        for turn in &history {
            messages.push(match turn.role {
                Role::User => Message::user(format_user_content(
                    turn.speaker_name.as_deref(),
                    &turn.content,
                )),
                _ => Message::assistant(turn.content.clone()),
            });
        }

        messages.push(Message::user(format_user_content(speaker_name, new_content)));
        Ok(messages)
    }

    /// Drop a session unconditionally.
    pub async fn clear_session(&self, key: &SessionKey) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(key).is_some() {
            self.persist(&sessions)?;
        }
        Ok(())
    }

    /// Remove expired turns store-wide and drop empty sessions.
    pub async fn sweep_now(&self) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        let expiry_ms = self.config.expiry_secs as i64 * 1000;

        let mut changed = false;
        for buffer in sessions.values_mut() {
            let before = buffer.turns.len();
            buffer.turns.retain(|t| is_live(t, now, expiry_ms));
            changed |= buffer.turns.len() != before;
        }
        let before_sessions = sessions.len();
        sessions.retain(|_, buffer| !buffer.turns.is_empty());
        changed |= sessions.len() != before_sessions;

        if changed {
            debug!(sessions = sessions.len(), "Expiry sweep completed");
            self.persist(&sessions)?;
        }
        Ok(())
    }

    /// Spawn the periodic expiry sweep task.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.clone();
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // First tick fires immediately — skip it
            loop {
                ticker.tick().await;
                if let Err(e) = store.sweep_now().await {
                    warn!(error = %e, "Expiry sweep failed to persist");
                }
            }
        })
    }

    /// Write the current state to the snapshot file (shutdown hook).
    pub async fn flush(&self) -> Result<(), MemoryError> {
        let sessions = self.sessions.read().await;
        self.persist(&sessions)
    }

    /// Number of sessions with at least one turn.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn is_live(turn: &ConversationTurn, now: DateTime<Utc>, expiry_ms: i64) -> bool {
    turn.permanent || turn.age_ms(now) < expiry_ms
}

fn format_user_content(speaker_name: Option<&str>, content: &str) -> String {
    match speaker_name {
        Some(name) => format!("{name}: {content}"),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store_with(max_messages: usize, expiry_secs: u64) -> MemoryStore {
        MemoryStore::new(MemoryConfig {
            max_messages,
            expiry_secs,
            sweep_interval_secs: 60,
            snapshot_path: None,
        })
    }

    fn aged_turn(role: Role, content: &str, age_secs: i64) -> ConversationTurn {
        let mut turn = ConversationTurn::new(role, content);
        turn.timestamp = Utc::now() - Duration::seconds(age_secs);
        turn
    }

    fn key() -> SessionKey {
        SessionKey::new("guild-1", "chan-1")
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest() {
        let store = store_with(100, 3600);
        for i in 0..101 {
            store
                .add_turn(&key(), ConversationTurn::new(Role::User, format!("msg {i}")))
                .await
                .unwrap();
        }

        let turns = store.history(&key()).await.unwrap();
        assert_eq!(turns.len(), 100);
        assert_eq!(turns[0].content, "msg 1"); // msg 0 evicted
        assert_eq!(turns[99].content, "msg 100");
    }

    #[tokio::test]
    async fn permanent_turns_survive_eviction() {
        let store = store_with(3, 3600);
        store
            .add_turn(&key(), ConversationTurn::new(Role::User, "keep").permanent())
            .await
            .unwrap();
        for i in 0..5 {
            store
                .add_turn(&key(), ConversationTurn::new(Role::User, format!("drop {i}")))
                .await
                .unwrap();
        }

        let turns = store.history(&key()).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "keep");
    }

    #[tokio::test]
    async fn expired_turns_excluded_from_history() {
        let store = store_with(100, 60);
        store
            .add_turn(&key(), aged_turn(Role::User, "stale", 120))
            .await
            .unwrap();
        store
            .add_turn(&key(), aged_turn(Role::User, "ancient but permanent", 9999).permanent())
            .await
            .unwrap();
        store
            .add_turn(&key(), ConversationTurn::new(Role::User, "fresh"))
            .await
            .unwrap();

        let turns = store.history(&key()).await.unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["ancient but permanent", "fresh"]);
    }

    #[tokio::test]
    async fn sweep_drops_empty_sessions() {
        let store = store_with(100, 60);
        store
            .add_turn(&key(), aged_turn(Role::User, "stale", 120))
            .await
            .unwrap();
        assert_eq!(store.session_count().await, 1);

        store.sweep_now().await.unwrap();
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn prompt_excludes_duplicate_tail() {
        let store = store_with(100, 3600);
        store
            .add_turn(
                &key(),
                ConversationTurn::new(Role::User, "what time is it")
                    .with_speaker("u1", "Alice"),
            )
            .await
            .unwrap();

        let messages = store
            .build_prompt_messages(&key(), "You are helpful.", Some("Alice"), "what time is it")
            .await
            .unwrap();

        // system + current user only — recorded turn not repeated
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "Alice: what time is it");
    }

    #[tokio::test]
    async fn prompt_includes_history_and_continuity_note() {
        let store = store_with(100, 3600);
        store
            .add_turn(
                &key(),
                ConversationTurn::new(Role::User, "hi").with_speaker("u1", "Bob"),
            )
            .await
            .unwrap();
        store
            .add_turn(&key(), ConversationTurn::new(Role::Assistant, "hello!"))
            .await
            .unwrap();

        let messages = store
            .build_prompt_messages(&key(), "Base prompt.", Some("Bob"), "how are you")
            .await
            .unwrap();

        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("continuity"));
        assert_eq!(messages[1].content, "Bob: hi");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].content, "Bob: how are you");
    }

    #[tokio::test]
    async fn first_prompt_has_plain_system_text() {
        let store = store_with(100, 3600);
        let messages = store
            .build_prompt_messages(&key(), "Base prompt.", None, "hello")
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Base prompt.");
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn snapshot_roundtrip_filters_expired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let config = MemoryConfig {
            max_messages: 100,
            expiry_secs: 60,
            sweep_interval_secs: 60,
            snapshot_path: Some(path.clone()),
        };

        let store = MemoryStore::new(config.clone());
        store
            .add_turn(&key(), aged_turn(Role::User, "too old", 120))
            .await
            .unwrap();
        store
            .add_turn(&key(), aged_turn(Role::User, "old but permanent", 120).permanent())
            .await
            .unwrap();
        store
            .add_turn(&key(), ConversationTurn::new(Role::Assistant, "fresh reply"))
            .await
            .unwrap();

        // Reload from the snapshot file
        let reloaded = MemoryStore::new(config);
        let turns = reloaded.history(&key()).await.unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["old but permanent", "fresh reply"]);
    }

    #[tokio::test]
    async fn clear_session_removes_everything() {
        let store = store_with(100, 3600);
        store
            .add_turn(&key(), ConversationTurn::new(Role::User, "hi"))
            .await
            .unwrap();
        store.clear_session(&key()).await.unwrap();
        assert!(store.history(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = MemoryStore::new(MemoryConfig {
            snapshot_path: Some(path),
            ..MemoryConfig::default()
        });
        assert_eq!(store.session_count().await, 0);
    }
}
