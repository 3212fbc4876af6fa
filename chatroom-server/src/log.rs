//! The room's message log: a bounded in-memory cache in front of a durable
//! [`MessageStore`].
//!
//! Appends hit the cache synchronously and are persisted by a spawned task,
//! so callers can broadcast straight away. The store may lag or fail without
//! retracting anything already broadcast; [`MessageLog::resync`] on each
//! login is the reconciliation path back to the durable view.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{ChatError, StoreError};
use crate::store::MessageStore;

/// Snapshot of the message being replied to, frozen at reply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub id: String,
    pub username: String,
    pub message: String,
}

/// A message in the room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// Author display name. Edits and deletes must match it exactly.
    pub username: String,
    pub message: String,
    pub color: String,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<ReplySnapshot>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_admin: bool,
    pub is_system: bool,
    pub is_command_result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

/// A message before it has an id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub username: String,
    pub message: String,
    pub color: String,
    pub reply_to: Option<ReplySnapshot>,
    pub is_admin: bool,
    pub is_system: bool,
    pub is_command_result: bool,
    pub status_text: Option<String>,
}

impl MessageDraft {
    pub fn chat(username: &str, message: &str, color: &str) -> Self {
        Self {
            username: username.to_string(),
            message: message.to_string(),
            color: color.to_string(),
            ..Self::default()
        }
    }

    /// Stamp the draft with a fresh id and the current time.
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            id: crate::msgid::generate(),
            username: self.username,
            message: self.message,
            color: self.color,
            timestamp: Utc::now(),
            reply_to: self.reply_to,
            edited: false,
            edited_at: None,
            is_admin: self.is_admin,
            is_system: self.is_system,
            is_command_result: self.is_command_result,
            status_text: self.status_text,
        }
    }
}

/// Result of [`MessageLog::append`].
pub struct Appended {
    /// The message as cached, ready to broadcast.
    pub message: ChatMessage,
    /// Completes once the durable write and trim have been attempted.
    pub persisted: JoinHandle<()>,
}

pub struct MessageLog {
    cache: Mutex<VecDeque<ChatMessage>>,
    capacity: usize,
    store: Arc<dyn MessageStore>,
}

impl MessageLog {
    pub fn new(capacity: usize, store: Arc<dyn MessageStore>) -> Self {
        Self {
            cache: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            store,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replace the cache wholesale (startup load).
    pub fn seed(&self, messages: Vec<ChatMessage>) {
        let mut cache = self.cache.lock();
        *cache = messages.into_iter().collect();
        while cache.len() > self.capacity {
            cache.pop_front();
        }
    }

    /// Cached history, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.cache.lock().iter().cloned().collect()
    }

    /// Append to the cache and persist in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn append(&self, draft: MessageDraft) -> Appended {
        let message = draft.into_message();
        {
            let mut cache = self.cache.lock();
            cache.push_back(message.clone());
            while cache.len() > self.capacity {
                cache.pop_front();
            }
        }

        let store = Arc::clone(&self.store);
        let keep = self.capacity;
        let row = message.clone();
        let persisted = tokio::spawn(async move {
            if let Err(e) = store.append(&row).await {
                tracing::warn!(id = %row.id, "Failed to persist message: {e}");
                return;
            }
            match store.trim(keep).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(removed = n, "Trimmed message store"),
                Err(e) => tracing::warn!("Failed to trim message store: {e}"),
            }
        });

        Appended { message, persisted }
    }

    /// Edit a message owned by `requester`. The store decides ownership;
    /// if it is unreachable the cached copy decides instead.
    pub async fn edit(
        &self,
        id: &str,
        requester: &str,
        body: &str,
    ) -> Result<ChatMessage, ChatError> {
        match self.store.update(id, requester, body).await {
            Ok(Some(stored)) => {
                let mut cache = self.cache.lock();
                if let Some(cached) = cache.iter_mut().find(|m| m.id == id) {
                    cached.message = stored.message.clone();
                    cached.edited = true;
                    cached.edited_at = stored.edited_at;
                }
                Ok(stored)
            }
            Ok(None) => Err(not_found_or_not_yours()),
            Err(e) => {
                warn_degraded("edit", id, &e);
                let mut cache = self.cache.lock();
                match cache.iter_mut().find(|m| m.id == id && m.username == requester) {
                    Some(cached) => {
                        cached.message = body.to_string();
                        cached.edited = true;
                        cached.edited_at = Some(Utc::now());
                        Ok(cached.clone())
                    }
                    None => Err(not_found_or_not_yours()),
                }
            }
        }
    }

    /// Delete a message owned by `requester`.
    pub async fn delete(&self, id: &str, requester: &str) -> Result<(), ChatError> {
        let owned = match self.store.delete(id, requester).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn_degraded("delete", id, &e);
                self.cache
                    .lock()
                    .iter()
                    .any(|m| m.id == id && m.username == requester)
            }
        };
        if !owned {
            return Err(not_found_or_not_yours());
        }
        self.cache.lock().retain(|m| m.id != id);
        Ok(())
    }

    /// Clear store and cache. Authorization is the caller's job.
    pub async fn delete_all(&self) {
        if let Err(e) = self.store.delete_all().await {
            tracing::warn!("Failed to clear message store: {e}");
        }
        self.cache.lock().clear();
    }

    /// Refresh the cache from the store if reachable; otherwise keep it.
    /// Returns the history to hand to a newly authenticated connection.
    pub async fn resync(&self) -> Vec<ChatMessage> {
        match self.store.list(self.capacity).await {
            Ok(messages) => {
                self.seed(messages);
            }
            Err(e) => {
                tracing::warn!("History resync failed, serving cached history: {e}");
            }
        }
        self.snapshot()
    }
}

fn not_found_or_not_yours() -> ChatError {
    ChatError::state("Message not found or you are not its author")
}

fn warn_degraded(op: &str, id: &str, e: &StoreError) {
    tracing::warn!(%id, "Store unavailable for {op}, falling back to cache: {e}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::AdminPolicy;
    use crate::db::SqliteBackend;
    use crate::store::OfflineBackend;

    fn sqlite_log(capacity: usize) -> (MessageLog, SqliteBackend) {
        let backend = SqliteBackend::open_memory(AdminPolicy::default()).unwrap();
        (MessageLog::new(capacity, Arc::new(backend.clone())), backend)
    }

    fn offline_log(capacity: usize) -> MessageLog {
        MessageLog::new(capacity, Arc::new(OfflineBackend::new(StoreError::not_configured())))
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_in_cache_and_store() {
        let (log, backend) = sqlite_log(3);
        for i in 0..5 {
            let appended = log.append(MessageDraft::chat("alice#1", &format!("m{i}"), "#000"));
            appended.persisted.await.unwrap();
        }

        let cached: Vec<String> = log.snapshot().into_iter().map(|m| m.message).collect();
        assert_eq!(cached, vec!["m2", "m3", "m4"]);

        let stored: Vec<String> = backend.list(10).await.unwrap().into_iter().map(|m| m.message).collect();
        assert_eq!(stored, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn edit_is_ownership_scoped() {
        let (log, _backend) = sqlite_log(10);
        let appended = log.append(MessageDraft::chat("alice#1", "helo", "#000"));
        appended.persisted.await.unwrap();
        let id = appended.message.id;

        let err = log.edit(&id, "bob#1", "pwned").await.unwrap_err();
        assert!(matches!(err, ChatError::State(_)));
        assert_eq!(log.snapshot()[0].message, "helo");

        let edited = log.edit(&id, "alice#1", "hello").await.unwrap();
        assert!(edited.edited);
        let cached = &log.snapshot()[0];
        assert_eq!(cached.message, "hello");
        assert!(cached.edited);
    }

    #[tokio::test]
    async fn delete_is_ownership_scoped() {
        let (log, backend) = sqlite_log(10);
        let appended = log.append(MessageDraft::chat("alice#1", "bye", "#000"));
        appended.persisted.await.unwrap();
        let id = appended.message.id;

        assert!(log.delete(&id, "alice#1 ").await.is_err());
        assert_eq!(log.snapshot().len(), 1);

        log.delete(&id, "alice#1").await.unwrap();
        assert!(log.snapshot().is_empty());
        assert!(backend.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_clears_both_sides() {
        let (log, backend) = sqlite_log(10);
        for i in 0..3 {
            log.append(MessageDraft::chat("a#1", &i.to_string(), "#000")).persisted.await.unwrap();
        }
        log.delete_all().await;
        assert!(log.snapshot().is_empty());
        assert!(backend.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resync_replaces_cache_from_store() {
        let (log, backend) = sqlite_log(10);
        let stale = MessageDraft::chat("ghost#1", "only cached", "#000").into_message();
        log.seed(vec![stale]);
        let durable = MessageDraft::chat("alice#1", "durable", "#000").into_message();
        backend.append(&durable).await.unwrap();

        let history = log.resync().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "durable");
    }

    #[tokio::test]
    async fn offline_store_keeps_cache_and_degrades_edits() {
        let log = offline_log(10);
        let appended = log.append(MessageDraft::chat("alice#1", "typo", "#000"));
        appended.persisted.await.unwrap();

        let history = log.resync().await;
        assert_eq!(history.len(), 1);

        let id = appended.message.id;
        assert!(log.edit(&id, "bob#1", "x").await.is_err());
        let edited = log.edit(&id, "alice#1", "fixed").await.unwrap();
        assert_eq!(edited.message, "fixed");
        log.delete(&id, "alice#1").await.unwrap();
        assert!(log.snapshot().is_empty());
    }
}
