//! Chat store: the ordered list of sessions plus the active selection.
//!
//! This is the system of record for conversations. Every mutation is a closure applied
//! under the write lock, so concurrent tasks only interleave between mutations. Snapshots
//! are persisted through a [`KeyValueStore`] as `{ "version": N, "state": {...} }`, and
//! older versions are migrated step by step on load.

use crate::persist::KeyValueStore;
use crate::session::{
    default_compress_threshold, default_history_message_count, Message, ModelConfig, Session,
    SessionId,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Key the store snapshot is persisted under.
pub const STORE_KEY: &str = "parley-chat-store";

/// Current schema version of the persisted snapshot.
pub const STORE_VERSION: u32 = 3;

/// How long a deleted session can be restored.
pub const UNDO_WINDOW: Duration = Duration::from_secs(5);

/// Sessions and the index of the active one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub current_session_index: usize,
}

impl StoreState {
    fn fresh(defaults: &ModelConfig) -> Self {
        Self {
            sessions: vec![Session::new(defaults.clone())],
            current_session_index: 0,
        }
    }

    /// Active index, clamped into range.
    pub fn current_index(&self) -> usize {
        self.current_session_index
            .min(self.sessions.len().saturating_sub(1))
    }

    fn ensure_session(&mut self, defaults: &ModelConfig) {
        if self.sessions.is_empty() {
            self.sessions.push(Session::new(defaults.clone()));
        }
        self.current_session_index = self.current_index();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    version: u32,
    state: Value,
}

struct DeletedSnapshot {
    state: StoreState,
    deleted_at: Instant,
}

struct Inner {
    state: StoreState,
    undo: Option<DeletedSnapshot>,
}

/// Shared handle to the chat store. Clones refer to the same state.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<RwLock<Inner>>,
    storage: Arc<dyn KeyValueStore>,
    defaults: ModelConfig,
}

impl ChatStore {
    /// Empty store (one fresh session) backed by `storage`. Nothing is read.
    pub fn new(storage: Arc<dyn KeyValueStore>, defaults: ModelConfig) -> Self {
        let state = StoreState::fresh(&defaults);
        Self::with_state(storage, defaults, state)
    }

    fn with_state(storage: Arc<dyn KeyValueStore>, defaults: ModelConfig, state: StoreState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner { state, undo: None })),
            storage,
            defaults,
        }
    }

    /// Load the persisted snapshot (migrating older versions), or start fresh when none exists.
    pub async fn load(storage: Arc<dyn KeyValueStore>, defaults: ModelConfig) -> Result<Self> {
        let state = match storage.get(STORE_KEY).await? {
            None => {
                log::debug!("store: no persisted state, starting fresh");
                StoreState::fresh(&defaults)
            }
            Some(raw) => {
                let persisted: PersistedState =
                    serde_json::from_str(&raw).context("parsing persisted chat store")?;
                let value = migrate(persisted.version, persisted.state, &defaults)?;
                let mut state: StoreState =
                    serde_json::from_value(value).context("decoding chat store state")?;
                state.ensure_session(&defaults);
                for s in &mut state.sessions {
                    s.last_summarize_index = s.last_summarize_index.min(s.messages.len());
                }
                log::info!("store: loaded {} session(s)", state.sessions.len());
                state
            }
        };
        Ok(Self::with_state(storage, defaults, state))
    }

    /// Persist the current state.
    pub async fn save(&self) -> Result<()> {
        let state = self.inner.read().await.state.clone();
        let doc = PersistedState {
            version: STORE_VERSION,
            state: serde_json::to_value(&state).context("serializing chat store")?,
        };
        let s = serde_json::to_string(&doc).context("serializing chat store")?;
        self.storage.set(STORE_KEY, &s).await
    }

    /// Model configuration given to new sessions.
    pub fn defaults(&self) -> &ModelConfig {
        &self.defaults
    }

    pub async fn snapshot(&self) -> StoreState {
        self.inner.read().await.state.clone()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.inner.read().await.state.sessions.clone()
    }

    pub async fn current_index(&self) -> usize {
        self.inner.read().await.state.current_index()
    }

    pub async fn current_session(&self) -> Session {
        let g = self.inner.read().await;
        g.state.sessions[g.state.current_index()].clone()
    }

    pub async fn session(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .state
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Create an empty session at the front and make it active.
    pub async fn new_session(&self) -> Result<SessionId> {
        self.new_session_with_context(Vec::new()).await
    }

    /// Like [`new_session`](Self::new_session) with always-include context messages.
    pub async fn new_session_with_context(&self, context: Vec<Message>) -> Result<SessionId> {
        let mut session = Session::new(self.defaults.clone());
        session.context = context;
        let id = session.id.clone();
        {
            let mut g = self.inner.write().await;
            g.state.sessions.insert(0, session);
            g.state.current_session_index = 0;
        }
        self.save().await?;
        Ok(id)
    }

    /// Make the session at `index` active (clamped into range).
    pub async fn select_session(&self, index: usize) -> Result<()> {
        {
            let mut g = self.inner.write().await;
            g.state.current_session_index = index;
            g.state.current_session_index = g.state.current_index();
        }
        self.save().await
    }

    /// Delete the session at `index`. Deleting the only session replaces it with a fresh one.
    /// The previous state can be restored with [`undo_delete`](Self::undo_delete) for
    /// [`UNDO_WINDOW`]. Returns false when `index` is out of range.
    pub async fn delete_session(&self, index: usize) -> Result<bool> {
        {
            let mut g = self.inner.write().await;
            if index >= g.state.sessions.len() {
                return Ok(false);
            }
            let mut before = g.state.clone();
            // The deleted session's in-flight replies are being stopped; restore them finished.
            for m in before.sessions[index].messages.iter_mut().filter(|m| m.streaming) {
                m.streaming = false;
            }
            let current = g.state.current_index();
            let deleting_last = g.state.sessions.len() == 1;
            let removed = g.state.sessions.remove(index);
            let mut next = if index < current { current - 1 } else { current };
            if deleting_last {
                next = 0;
                g.state.sessions.push(Session::new(self.defaults.clone()));
            }
            g.state.current_session_index = next.min(g.state.sessions.len() - 1);
            g.undo = Some(DeletedSnapshot {
                state: before,
                deleted_at: Instant::now(),
            });
            log::debug!("store: deleted session {} ({})", removed.id, removed.topic);
        }
        self.save().await?;
        Ok(true)
    }

    /// Restore the state from before the last delete, if still within [`UNDO_WINDOW`].
    pub async fn undo_delete(&self) -> Result<bool> {
        {
            let mut g = self.inner.write().await;
            match g.undo.take() {
                Some(snap) if snap.deleted_at.elapsed() <= UNDO_WINDOW => {
                    g.state = snap.state;
                }
                _ => return Ok(false),
            }
        }
        self.save().await?;
        Ok(true)
    }

    /// Move a session from `from` to `to`, keeping the same session active.
    pub async fn move_session(&self, from: usize, to: usize) -> Result<bool> {
        {
            let mut g = self.inner.write().await;
            let len = g.state.sessions.len();
            if from >= len || to >= len {
                return Ok(false);
            }
            let old = g.state.current_index();
            let session = g.state.sessions.remove(from);
            g.state.sessions.insert(to, session);
            let mut new_index = if old == from { to } else { old };
            if old > from && old <= to {
                new_index -= 1;
            } else if old < from && old >= to {
                new_index += 1;
            }
            g.state.current_session_index = new_index;
        }
        self.save().await?;
        Ok(true)
    }

    /// Clear messages and memory of the active session.
    pub async fn reset_session(&self) -> Result<()> {
        self.update_current_session(|s| s.reset()).await;
        self.save().await
    }

    /// Apply an in-place edit to the active session.
    pub async fn update_current_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut g = self.inner.write().await;
        let i = g.state.current_index();
        f(&mut g.state.sessions[i])
    }

    /// Apply an in-place edit to the session with `id`. None when it no longer exists.
    pub async fn update_session<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut g = self.inner.write().await;
        g.state.sessions.iter_mut().find(|s| s.id == id).map(f)
    }

    /// Wipe persisted state and start over with one empty session. Irreversible.
    pub async fn clear_all_data(&self) -> Result<()> {
        self.storage.remove(STORE_KEY).await?;
        let mut g = self.inner.write().await;
        g.state = StoreState::fresh(&self.defaults);
        g.undo = None;
        log::info!("store: cleared all data");
        Ok(())
    }
}

type Migration = fn(Value, &ModelConfig) -> Result<Value>;

/// Migrations indexed by the version they upgrade from.
const MIGRATIONS: [(u32, Migration); 2] = [(1, migrate_v1_to_v2), (2, migrate_v2_to_v3)];

/// Upgrade a persisted state from `version` to [`STORE_VERSION`].
fn migrate(version: u32, mut state: Value, defaults: &ModelConfig) -> Result<Value> {
    let mut version = version.max(1);
    if version > STORE_VERSION {
        anyhow::bail!(
            "persisted chat store has version {}, newer than supported {}",
            version,
            STORE_VERSION
        );
    }
    for (from, step) in MIGRATIONS {
        if version == from {
            log::info!("store: migrating state v{} -> v{}", from, from + 1);
            state = step(state, defaults)?;
            version = from + 1;
        }
    }
    Ok(state)
}

fn sessions_mut(state: &mut Value) -> Result<&mut Vec<Value>> {
    state
        .get_mut("sessions")
        .and_then(|s| s.as_array_mut())
        .context("persisted state has no sessions array")
}

/// v1 -> v2: rebuild every session through the current constructor, keeping topic and messages.
fn migrate_v1_to_v2(mut state: Value, defaults: &ModelConfig) -> Result<Value> {
    for old in sessions_mut(&mut state)?.iter_mut() {
        let mut fresh = serde_json::to_value(Session::new(defaults.clone()))?;
        if let Some(topic) = old.get("topic").and_then(|t| t.as_str()) {
            fresh["topic"] = json!(topic);
        }
        let mut messages = old.get("messages").cloned().unwrap_or_else(|| json!([]));
        let next_id = normalize_messages(&mut messages);
        fresh["messages"] = messages;
        fresh["nextMessageId"] = json!(next_id);
        *old = fresh;
    }
    Ok(state)
}

/// v2 -> v3: backfill memory configuration and give every message an id.
fn migrate_v2_to_v3(mut state: Value, defaults: &ModelConfig) -> Result<Value> {
    let default_config = serde_json::to_value(defaults)?;
    for session in sessions_mut(&mut state)?.iter_mut() {
        let Some(obj) = session.as_object_mut() else {
            continue;
        };
        let mut config = obj
            .get("modelConfig")
            .filter(|c| c.is_object())
            .cloned()
            .unwrap_or_else(|| default_config.clone());
        config["sendMemory"] = json!(true);
        if config.get("historyMessageCount").and_then(|v| v.as_u64()).is_none() {
            config["historyMessageCount"] = json!(default_history_message_count());
        }
        if config
            .get("compressMessageLengthThreshold")
            .and_then(|v| v.as_u64())
            .is_none()
        {
            config["compressMessageLengthThreshold"] = json!(default_compress_threshold());
        }
        obj.insert("modelConfig".to_string(), config);

        let mut messages = obj.remove("messages").unwrap_or_else(|| json!([]));
        let next_id = normalize_messages(&mut messages);
        let len = messages.as_array().map(|m| m.len()).unwrap_or(0);
        obj.insert("messages".to_string(), messages);
        let known = obj.get("nextMessageId").and_then(|v| v.as_u64()).unwrap_or(0);
        obj.insert("nextMessageId".to_string(), json!(known.max(next_id)));

        let index = obj
            .get("lastSummarizeIndex")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            .min(len as u64);
        obj.insert("lastSummarizeIndex".to_string(), json!(index));
        normalize_date(obj, "lastUpdate");
        if !obj.contains_key("id") {
            obj.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        }
        if !obj.contains_key("topic") {
            obj.insert("topic".to_string(), json!(crate::session::DEFAULT_TOPIC));
        }
    }
    Ok(state)
}

/// Fill missing message fields (id, date, content). Returns the next free id.
fn normalize_messages(messages: &mut Value) -> u64 {
    let Some(list) = messages.as_array_mut() else {
        *messages = json!([]);
        return 0;
    };
    list.retain(|m| m.is_object());
    let mut next_id = list
        .iter()
        .filter_map(|m| m.get("id").and_then(|v| v.as_u64()))
        .max()
        .map(|m| m + 1)
        .unwrap_or(0);
    for m in list.iter_mut() {
        let Some(obj) = m.as_object_mut() else {
            continue;
        };
        if obj.get("id").and_then(|v| v.as_u64()).is_none() {
            obj.insert("id".to_string(), json!(next_id));
            next_id += 1;
        }
        if !obj.get("content").map(|c| c.is_string()).unwrap_or(false) {
            obj.insert("content".to_string(), json!(""));
        }
        let role_ok = matches!(
            obj.get("role").and_then(|r| r.as_str()),
            Some("system" | "user" | "assistant")
        );
        if !role_ok {
            obj.insert("role".to_string(), json!("user"));
        }
        obj.insert("streaming".to_string(), json!(false));
        normalize_date(obj, "date");
    }
    next_id
}

/// Replace a missing or non-RFC 3339 timestamp (numbers are read as epoch millis).
fn normalize_date(obj: &mut serde_json::Map<String, Value>, key: &str) {
    let parsed = match obj.get(key) {
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&chrono::Utc)),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis),
        _ => None,
    };
    let date = parsed.unwrap_or_else(chrono::Utc::now);
    obj.insert(key.to_string(), json!(date.to_rfc3339()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;

    fn store() -> ChatStore {
        ChatStore::new(Arc::new(MemoryStore::new()), ModelConfig::default())
    }

    async fn topics(store: &ChatStore) -> Vec<String> {
        store.sessions().await.into_iter().map(|s| s.topic).collect()
    }

    async fn named_store(names: &[&str]) -> ChatStore {
        let store = store();
        for _ in 1..names.len() {
            store.new_session().await.unwrap();
        }
        let mut g = store.inner.write().await;
        for (s, name) in g.state.sessions.iter_mut().zip(names) {
            s.topic = name.to_string();
        }
        drop(g);
        store
    }

    #[tokio::test]
    async fn new_session_is_prepended_and_active() {
        let store = store();
        let first = store.current_session().await.id;
        let second = store.new_session().await.unwrap();
        let sessions = store.sessions().await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, second);
        assert_eq!(sessions[1].id, first);
        assert_eq!(store.current_index().await, 0);
    }

    #[tokio::test]
    async fn deleting_only_session_leaves_fresh_one() {
        let store = store();
        let old = store.current_session().await;
        assert!(store.delete_session(0).await.unwrap());
        let sessions = store.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_ne!(sessions[0].id, old.id);
        assert!(sessions[0].messages.is_empty());
        assert_eq!(store.current_index().await, 0);
    }

    #[tokio::test]
    async fn delete_before_active_shifts_index() {
        let store = named_store(&["a", "b", "c"]).await;
        store.select_session(2).await.unwrap();
        store.delete_session(0).await.unwrap();
        assert_eq!(topics(&store).await, vec!["b", "c"]);
        assert_eq!(store.current_session().await.topic, "c");
    }

    #[tokio::test]
    async fn delete_active_last_clamps() {
        let store = named_store(&["a", "b", "c"]).await;
        store.select_session(2).await.unwrap();
        store.delete_session(2).await.unwrap();
        assert_eq!(store.current_index().await, 1);
        assert!(!store.delete_session(9).await.unwrap());
    }

    #[tokio::test]
    async fn undo_restores_streaming_reply_as_finished() {
        let store = store();
        store
            .update_current_session(|s| {
                s.push_message(Message::user("q"));
                let mut reply = Message::assistant("partial");
                reply.streaming = true;
                s.push_message(reply);
            })
            .await;
        store.delete_session(0).await.unwrap();
        assert!(store.undo_delete().await.unwrap());
        let restored = store.current_session().await;
        assert_eq!(restored.messages[1].content, "partial");
        assert!(!restored.messages[1].streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn undo_restores_within_window_only() {
        let store = named_store(&["a", "b"]).await;
        store.delete_session(1).await.unwrap();
        assert!(store.undo_delete().await.unwrap());
        assert_eq!(topics(&store).await, vec!["a", "b"]);
        assert!(!store.undo_delete().await.unwrap());

        store.delete_session(0).await.unwrap();
        tokio::time::advance(UNDO_WINDOW + Duration::from_millis(1)).await;
        assert!(!store.undo_delete().await.unwrap());
        assert_eq!(topics(&store).await, vec!["b"]);
    }

    #[tokio::test]
    async fn move_keeps_active_session_selected() {
        let store = named_store(&["a", "b", "c", "d"]).await;
        store.select_session(1).await.unwrap();
        store.move_session(0, 3).await.unwrap();
        assert_eq!(topics(&store).await, vec!["b", "c", "d", "a"]);
        assert_eq!(store.current_session().await.topic, "b");
        store.move_session(3, 0).await.unwrap();
        assert_eq!(topics(&store).await, vec!["a", "b", "c", "d"]);
        assert_eq!(store.current_session().await.topic, "b");
        store.move_session(1, 2).await.unwrap();
        assert_eq!(store.current_session().await.topic, "b");
        assert_eq!(store.current_index().await, 2);
    }

    #[tokio::test]
    async fn out_of_range_index_is_clamped_on_read() {
        let store = named_store(&["a", "b"]).await;
        store.inner.write().await.state.current_session_index = 7;
        assert_eq!(store.current_index().await, 1);
        assert_eq!(store.current_session().await.topic, "b");
    }

    #[tokio::test]
    async fn reset_clears_active_session() {
        let store = store();
        store
            .update_current_session(|s| {
                s.push_message(Message::user("hi"));
                s.memory_prompt = "memo".into();
            })
            .await;
        store.reset_session().await.unwrap();
        let s = store.current_session().await;
        assert!(s.messages.is_empty());
        assert!(s.memory_prompt.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let kv = Arc::new(MemoryStore::new());
        let store = ChatStore::new(kv.clone(), ModelConfig::default());
        store.update_current_session(|s| s.push_message(Message::user("hi"))).await;
        store.save().await.unwrap();
        let loaded = ChatStore::load(kv, ModelConfig::default()).await.unwrap();
        assert_eq!(loaded.snapshot().await, store.snapshot().await);
    }

    #[tokio::test]
    async fn clear_all_data_wipes_storage() {
        let kv = Arc::new(MemoryStore::new());
        let store = ChatStore::new(kv.clone(), ModelConfig::default());
        store.new_session().await.unwrap();
        store.clear_all_data().await.unwrap();
        assert!(kv.get(STORE_KEY).await.unwrap().is_none());
        assert_eq!(store.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn v1_state_is_migrated() {
        let kv = Arc::new(MemoryStore::new());
        let v1 = json!({
            "version": 1,
            "state": {
                "currentSessionIndex": 0,
                "sessions": [{
                    "id": 1680000000000u64,
                    "topic": "Old chat",
                    "memoryPrompt": "stale",
                    "messages": [
                        { "role": "user", "content": "hello", "date": "2023/4/1 10:00:00" },
                        { "role": "assistant", "content": "hi", "date": "", "streaming": true }
                    ],
                    "lastUpdate": "2023/4/1 10:00:01"
                }]
            }
        });
        kv.set(STORE_KEY, &v1.to_string()).await.unwrap();
        let store = ChatStore::load(kv, ModelConfig::default()).await.unwrap();
        let s = store.current_session().await;
        assert_eq!(s.topic, "Old chat");
        assert!(s.memory_prompt.is_empty());
        assert_eq!(s.messages.len(), 2);
        assert_eq!(s.messages[1].id, 1);
        assert!(!s.messages[1].streaming);
        assert_eq!(s.next_message_id, 2);
        assert_eq!(s.model_config.history_message_count, 4);
        assert!(s.model_config.send_memory);
    }

    #[tokio::test]
    async fn v2_state_gets_memory_defaults() {
        let kv = Arc::new(MemoryStore::new());
        let v2 = json!({
            "version": 2,
            "state": {
                "currentSessionIndex": 3,
                "sessions": [{
                    "id": "abc",
                    "topic": "Kept",
                    "memoryPrompt": "summary so far",
                    "messages": [{ "role": "user", "content": "x", "date": "2023-04-01T10:00:00Z" }],
                    "lastUpdate": 1680000000000u64,
                    "lastSummarizeIndex": 9,
                    "modelConfig": { "model": "gpt-4", "sendMemory": false }
                }]
            }
        });
        kv.set(STORE_KEY, &v2.to_string()).await.unwrap();
        let store = ChatStore::load(kv, ModelConfig::default()).await.unwrap();
        let s = store.current_session().await;
        assert_eq!(store.current_index().await, 0);
        assert_eq!(s.id, "abc");
        assert_eq!(s.memory_prompt, "summary so far");
        assert_eq!(s.model_config.model, "gpt-4");
        assert!(s.model_config.send_memory);
        assert_eq!(s.model_config.compress_message_length_threshold, 1000);
        assert_eq!(s.last_summarize_index, 1);
        assert_eq!(s.last_update.timestamp_millis(), 1680000000000);
    }

    #[tokio::test]
    async fn newer_version_is_rejected() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(STORE_KEY, &json!({ "version": 99, "state": { "sessions": [] } }).to_string())
            .await
            .unwrap();
        assert!(ChatStore::load(kv, ModelConfig::default()).await.is_err());
    }
}
