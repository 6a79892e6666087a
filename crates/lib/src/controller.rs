//! Registry of cancellation handles for in-flight requests, keyed by (session, message).
//!
//! Each chat turn registers the handle of its stream under its own key and removes it
//! when the stream finishes, errors, or is stopped. Stop-all is used on reset and clear.

use crate::session::{MessageId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Key of a registry entry: the session and the assistant message being generated.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ControllerKey {
    pub session_id: SessionId,
    pub message_id: MessageId,
}

impl ControllerKey {
    pub fn new(session_id: impl Into<SessionId>, message_id: MessageId) -> Self {
        Self {
            session_id: session_id.into(),
            message_id,
        }
    }
}

/// Identifies one registration, so a finished request only removes its own entry even
/// when a newer request has taken over the same key.
pub type Registration = u64;

struct Entry {
    registration: Registration,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ControllerKey, Entry>,
    next_registration: Registration,
}

/// Cancellation handles for in-flight streams. Shared across the chat service.
#[derive(Clone)]
pub struct ControllerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Register a handle. An existing entry under the same key is cancelled first.
    /// Pass the returned registration to [`remove`](Self::remove) when the request settles.
    pub async fn register(&self, key: ControllerKey, token: CancellationToken) -> Registration {
        let mut g = self.inner.write().await;
        let registration = g.next_registration;
        g.next_registration += 1;
        let entry = Entry {
            registration,
            token,
        };
        if let Some(old) = g.entries.insert(key.clone(), entry) {
            log::warn!(
                "controller: replacing live handle for session {} message {}",
                key.session_id,
                key.message_id
            );
            old.token.cancel();
        }
        registration
    }

    /// Drop the entry without cancelling it (the request already settled). An entry that
    /// belongs to a later registration under the same key is left alone.
    pub async fn remove(&self, key: &ControllerKey, registration: Registration) {
        let mut g = self.inner.write().await;
        if g.entries.get(key).map(|e| e.registration) == Some(registration) {
            g.entries.remove(key);
        }
    }

    /// Cancel and remove one entry. Returns false when nothing was registered under the key.
    pub async fn stop(&self, key: &ControllerKey) -> bool {
        match self.inner.write().await.entries.remove(key) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and remove every entry. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut g = self.inner.write().await;
        let n = g.entries.len();
        for (_, entry) in g.entries.drain() {
            entry.token.cancel();
        }
        if n > 0 {
            log::debug!("controller: stopped {} in-flight request(s)", n);
        }
        n
    }

    pub async fn has_pending(&self) -> bool {
        !self.inner.read().await.entries.is_empty()
    }

    pub async fn is_pending(&self, key: &ControllerKey) -> bool {
        self.inner.read().await.entries.contains_key(key)
    }

    /// Keys of in-flight requests for one session.
    pub async fn pending_for_session(&self, session_id: &str) -> Vec<ControllerKey> {
        self.inner
            .read()
            .await
            .entries
            .keys()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect()
    }
}
