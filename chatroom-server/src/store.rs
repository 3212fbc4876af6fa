//! Durable message storage and ban persistence.
//!
//! Both traits are fallible independently of the real-time path: callers
//! log failures and carry on with the in-memory view.

use async_trait::async_trait;
use chrono::Utc;

use crate::db::{BanRow, SqliteBackend};
use crate::error::{StoreError, StoreResult};
use crate::log::ChatMessage;

/// Durable side of the message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The most recent `limit` messages, oldest first.
    async fn list(&self, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    async fn append(&self, msg: &ChatMessage) -> StoreResult<()>;

    /// Rewrite the body of message `id` if `author` wrote it.
    /// `Ok(None)` means no row matched both.
    async fn update(&self, id: &str, author: &str, body: &str) -> StoreResult<Option<ChatMessage>>;

    /// Delete message `id` if `author` wrote it.
    async fn delete(&self, id: &str, author: &str) -> StoreResult<bool>;

    async fn delete_all(&self) -> StoreResult<()>;

    /// Keep only the newest `keep` messages by timestamp.
    async fn trim(&self, keep: usize) -> StoreResult<usize>;
}

/// Durable side of the ban set.
#[async_trait]
pub trait BanStore: Send + Sync {
    async fn load_bans(&self) -> StoreResult<Vec<BanRow>>;
    async fn save_ban(&self, ban: &BanRow) -> StoreResult<()>;
    async fn remove_ban(&self, display_name: &str) -> StoreResult<()>;
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn list(&self, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.run(move |db| db.list_messages(limit)).await
    }

    async fn append(&self, msg: &ChatMessage) -> StoreResult<()> {
        let msg = msg.clone();
        self.run(move |db| db.insert_message(&msg)).await
    }

    async fn update(&self, id: &str, author: &str, body: &str) -> StoreResult<Option<ChatMessage>> {
        let (id, author, body) = (id.to_string(), author.to_string(), body.to_string());
        self.run(move |db| db.update_message(&id, &author, &body, Utc::now()))
            .await
    }

    async fn delete(&self, id: &str, author: &str) -> StoreResult<bool> {
        let (id, author) = (id.to_string(), author.to_string());
        self.run(move |db| db.delete_message(&id, &author)).await
    }

    async fn delete_all(&self) -> StoreResult<()> {
        self.run(|db| db.delete_all_messages().map(|_| ())).await
    }

    async fn trim(&self, keep: usize) -> StoreResult<usize> {
        self.run(move |db| db.trim_messages(keep)).await
    }
}

#[async_trait]
impl BanStore for SqliteBackend {
    async fn load_bans(&self) -> StoreResult<Vec<BanRow>> {
        self.run(|db| db.load_bans()).await
    }

    async fn save_ban(&self, ban: &BanRow) -> StoreResult<()> {
        let ban = ban.clone();
        self.run(move |db| db.save_ban(&ban)).await
    }

    async fn remove_ban(&self, display_name: &str) -> StoreResult<()> {
        let name = display_name.to_string();
        self.run(move |db| db.remove_ban(&name)).await
    }
}

/// Stand-in used when no database could be opened. Every call fails with
/// the diagnostic captured at startup.
#[derive(Clone)]
pub struct OfflineBackend {
    reason: std::sync::Arc<crate::error::Diagnostic>,
}

impl OfflineBackend {
    pub fn new(reason: StoreError) -> Self {
        let diag = match reason {
            StoreError::Unavailable(d) => d,
            other => crate::error::Diagnostic {
                kind: "CONNECTION_ERROR",
                message: "Database connection error".to_string(),
                solution: other.to_string(),
            },
        };
        Self { reason: std::sync::Arc::new(diag) }
    }

    pub(crate) fn error(&self) -> StoreError {
        StoreError::Unavailable((*self.reason).clone())
    }
}

#[async_trait]
impl MessageStore for OfflineBackend {
    async fn list(&self, _limit: usize) -> StoreResult<Vec<ChatMessage>> {
        Err(self.error())
    }
    async fn append(&self, _msg: &ChatMessage) -> StoreResult<()> {
        Err(self.error())
    }
    async fn update(&self, _id: &str, _author: &str, _body: &str) -> StoreResult<Option<ChatMessage>> {
        Err(self.error())
    }
    async fn delete(&self, _id: &str, _author: &str) -> StoreResult<bool> {
        Err(self.error())
    }
    async fn delete_all(&self) -> StoreResult<()> {
        Err(self.error())
    }
    async fn trim(&self, _keep: usize) -> StoreResult<usize> {
        Err(self.error())
    }
}

#[async_trait]
impl BanStore for OfflineBackend {
    async fn load_bans(&self) -> StoreResult<Vec<BanRow>> {
        Err(self.error())
    }
    async fn save_ban(&self, _ban: &BanRow) -> StoreResult<()> {
        Err(self.error())
    }
    async fn remove_ban(&self, _display_name: &str) -> StoreResult<()> {
        Err(self.error())
    }
}
