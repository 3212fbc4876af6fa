//! SQLite persistence layer.
//!
//! Stores accounts, the room's message log, and the ban list.
//! Uses WAL mode for concurrent reads during writes.
//!
//! [`Db`] is synchronous; async callers go through [`SqliteBackend`], which
//! runs each closure on the blocking pool with the connection locked.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use crate::directory::{AdminPolicy, ProfileUpdate};
use crate::error::StoreResult;
use crate::log::{ChatMessage, ReplySnapshot};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted account row.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: i64,
    pub username: String,
    /// `None` for reserved admin names, which carry no `#N` suffix.
    pub suffix: Option<i64>,
    pub display_name: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub status_text: String,
    pub login_token: Option<String>,
    pub color: String,
    pub theme: String,
}

/// A persisted ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRow {
    pub display_name: String,
    pub set_by: String,
    pub set_at: u64,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                username      TEXT NOT NULL,
                suffix        INTEGER,
                display_name  TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                is_admin      INTEGER NOT NULL DEFAULT 0,
                status_text   TEXT NOT NULL DEFAULT '',
                login_token   TEXT,
                color         TEXT NOT NULL DEFAULT '#000000',
                theme         TEXT NOT NULL DEFAULT 'default',
                created_at    INTEGER NOT NULL,
                last_login    INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_username_suffix
                ON accounts(username, suffix) WHERE suffix IS NOT NULL;

            CREATE INDEX IF NOT EXISTS idx_accounts_token
                ON accounts(login_token);

            CREATE TABLE IF NOT EXISTS messages (
                id                TEXT PRIMARY KEY,
                username          TEXT NOT NULL,
                message           TEXT NOT NULL,
                color             TEXT NOT NULL DEFAULT '#000000',
                timestamp         INTEGER NOT NULL,
                reply_to_id       TEXT,
                reply_to_username TEXT,
                reply_to_message  TEXT,
                edited            INTEGER NOT NULL DEFAULT 0,
                edited_at         INTEGER,
                is_admin          INTEGER NOT NULL DEFAULT 0,
                is_system         INTEGER NOT NULL DEFAULT 0,
                is_command_result INTEGER NOT NULL DEFAULT 0,
                status_text       TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_timestamp
                ON messages(timestamp DESC);

            CREATE TABLE IF NOT EXISTS bans (
                display_name TEXT PRIMARY KEY,
                set_by       TEXT NOT NULL,
                set_at       INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Accounts ───────────────────────────────────────────────────────

    /// Next free `#N` suffix for a username.
    pub fn next_suffix(&self, username: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(suffix), 0) + 1 FROM accounts WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
    }

    /// Insert a new account. The row's `id` is ignored and the stored row returned.
    pub fn insert_account(&self, row: &AccountRow) -> SqlResult<AccountRow> {
        self.conn.execute(
            "INSERT INTO accounts (username, suffix, display_name, password_hash, is_admin,
                                   status_text, login_token, color, theme, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.username,
                row.suffix,
                row.display_name,
                row.password_hash,
                row.is_admin as i32,
                row.status_text,
                row.login_token,
                row.color,
                row.theme,
                now_millis(),
            ],
        )?;
        Ok(AccountRow {
            id: self.conn.last_insert_rowid(),
            ..row.clone()
        })
    }

    /// All accounts sharing a base username (one per `#N` suffix).
    pub fn accounts_by_username(&self, username: &str) -> SqlResult<Vec<AccountRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = ?1 ORDER BY suffix"
        ))?;
        let rows = stmt.query_map(params![username], map_account_row)?;
        rows.collect()
    }

    pub fn account_by_display_name(&self, display_name: &str) -> SqlResult<Option<AccountRow>> {
        self.conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE display_name = ?1"),
                params![display_name],
                map_account_row,
            )
            .optional()
    }

    pub fn account_by_token(&self, token: &str) -> SqlResult<Option<AccountRow>> {
        self.conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE login_token = ?1"),
                params![token],
                map_account_row,
            )
            .optional()
    }

    /// Store a fresh login token and stamp the login time.
    pub fn record_login(&self, id: i64, token: Option<&str>) -> SqlResult<()> {
        match token {
            Some(token) => self.conn.execute(
                "UPDATE accounts SET login_token = ?1, last_login = ?2 WHERE id = ?3",
                params![token, now_millis(), id],
            )?,
            None => self.conn.execute(
                "UPDATE accounts SET last_login = ?1 WHERE id = ?2",
                params![now_millis(), id],
            )?,
        };
        Ok(())
    }

    /// Invalidate a login token. Returns whether any account held it.
    pub fn clear_token(&self, token: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE accounts SET login_token = NULL WHERE login_token = ?1",
            params![token],
        )?;
        Ok(changed > 0)
    }

    /// Apply the present fields of `update`. Returns the updated row, or
    /// `None` if no such account exists.
    pub fn update_profile(
        &self,
        display_name: &str,
        update: &ProfileUpdate,
    ) -> SqlResult<Option<AccountRow>> {
        if let Some(ref color) = update.color {
            self.conn.execute(
                "UPDATE accounts SET color = ?1 WHERE display_name = ?2",
                params![color, display_name],
            )?;
        }
        if let Some(ref theme) = update.theme {
            self.conn.execute(
                "UPDATE accounts SET theme = ?1 WHERE display_name = ?2",
                params![theme, display_name],
            )?;
        }
        if let Some(ref status) = update.status_text {
            self.conn.execute(
                "UPDATE accounts SET status_text = ?1 WHERE display_name = ?2",
                params![status, display_name],
            )?;
        }
        self.account_by_display_name(display_name)
    }

    // ── Messages ───────────────────────────────────────────────────────

    pub fn insert_message(&self, msg: &ChatMessage) -> SqlResult<()> {
        let reply = msg.reply_to.as_ref();
        self.conn.execute(
            "INSERT INTO messages (id, username, message, color, timestamp,
                                   reply_to_id, reply_to_username, reply_to_message,
                                   edited, edited_at, is_admin, is_system, is_command_result, status_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                msg.id,
                msg.username,
                msg.message,
                msg.color,
                msg.timestamp.timestamp_millis(),
                reply.map(|r| &r.id),
                reply.map(|r| &r.username),
                reply.map(|r| &r.message),
                msg.edited as i32,
                msg.edited_at.map(|t| t.timestamp_millis()),
                msg.is_admin as i32,
                msg.is_system as i32,
                msg.is_command_result as i32,
                msg.status_text,
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages, oldest first.
    pub fn list_messages(&self, limit: usize) -> SqlResult<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_message_row)?;
        let mut messages = rows.collect::<SqlResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Rewrite a message body if `author` wrote it. Returns the updated
    /// message, or `None` when no row matches both id and author.
    pub fn update_message(
        &self,
        id: &str,
        author: &str,
        body: &str,
        edited_at: DateTime<Utc>,
    ) -> SqlResult<Option<ChatMessage>> {
        let changed = self.conn.execute(
            "UPDATE messages SET message = ?1, edited = 1, edited_at = ?2
             WHERE id = ?3 AND username = ?4",
            params![body, edited_at.timestamp_millis(), id, author],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                map_message_row,
            )
            .optional()
    }

    /// Delete a message if `author` wrote it.
    pub fn delete_message(&self, id: &str, author: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM messages WHERE id = ?1 AND username = ?2",
            params![id, author],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_all_messages(&self) -> SqlResult<usize> {
        self.conn.execute("DELETE FROM messages", [])
    }

    /// Keep only the most recent `keep` messages by timestamp. Returns the
    /// number of rows removed.
    pub fn trim_messages(&self, keep: usize) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM messages WHERE id NOT IN (
                SELECT id FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1
            )",
            params![keep as i64],
        )
    }

    // ── Bans ───────────────────────────────────────────────────────────

    pub fn load_bans(&self) -> SqlResult<Vec<BanRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT display_name, set_by, set_at FROM bans ORDER BY set_at")?;
        let rows = stmt.query_map([], |row| {
            Ok(BanRow {
                display_name: row.get(0)?,
                set_by: row.get(1)?,
                set_at: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect()
    }

    pub fn save_ban(&self, ban: &BanRow) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO bans (display_name, set_by, set_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(display_name) DO UPDATE SET set_by=excluded.set_by, set_at=excluded.set_at",
            params![ban.display_name, ban.set_by, ban.set_at as i64],
        )?;
        Ok(())
    }

    pub fn remove_ban(&self, display_name: &str) -> SqlResult<()> {
        self.conn
            .execute("DELETE FROM bans WHERE display_name = ?1", params![display_name])?;
        Ok(())
    }
}

const ACCOUNT_COLUMNS: &str = "id, username, suffix, display_name, password_hash, is_admin, \
                               status_text, login_token, color, theme";

const MESSAGE_COLUMNS: &str = "id, username, message, color, timestamp, reply_to_id, \
                               reply_to_username, reply_to_message, edited, edited_at, \
                               is_admin, is_system, is_command_result, status_text";

fn map_account_row(row: &rusqlite::Row) -> SqlResult<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        username: row.get(1)?,
        suffix: row.get(2)?,
        display_name: row.get(3)?,
        password_hash: row.get(4)?,
        is_admin: row.get::<_, i32>(5)? != 0,
        status_text: row.get(6)?,
        login_token: row.get(7)?,
        color: row.get(8)?,
        theme: row.get(9)?,
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<ChatMessage> {
    let reply_id: Option<String> = row.get(5)?;
    let reply_to = match reply_id {
        Some(id) => Some(ReplySnapshot {
            id,
            username: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            message: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(ChatMessage {
        id: row.get(0)?,
        username: row.get(1)?,
        message: row.get(2)?,
        color: row.get(3)?,
        timestamp: from_millis(row.get(4)?),
        reply_to,
        edited: row.get::<_, i32>(8)? != 0,
        edited_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        is_admin: row.get::<_, i32>(10)? != 0,
        is_system: row.get::<_, i32>(11)? != 0,
        is_command_result: row.get::<_, i32>(12)? != 0,
        status_text: row.get(13)?,
    })
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Async handle to a [`Db`], shared by the directory, store and ban-store
/// implementations.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Mutex<Db>>,
    pub(crate) admins: Arc<AdminPolicy>,
}

impl SqliteBackend {
    pub fn new(db: Db, admins: AdminPolicy) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            admins: Arc::new(admins),
        }
    }

    /// In-memory backend (for testing).
    pub fn open_memory(admins: AdminPolicy) -> SqlResult<Self> {
        Ok(Self::new(Db::open_memory()?, admins))
    }

    /// Run a closure against the database on the blocking pool.
    pub async fn run<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&Db) -> SqlResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let out = tokio::task::spawn_blocking(move || {
            let db = db.lock();
            f(&db)
        })
        .await??;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, author: &str, text: &str, ts_ms: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            username: author.to_string(),
            message: text.to_string(),
            color: "#000000".to_string(),
            timestamp: from_millis(ts_ms),
            reply_to: None,
            edited: false,
            edited_at: None,
            is_admin: false,
            is_system: false,
            is_command_result: false,
            status_text: None,
        }
    }

    fn account(username: &str, suffix: Option<i64>, display: &str) -> AccountRow {
        AccountRow {
            id: 0,
            username: username.to_string(),
            suffix,
            display_name: display.to_string(),
            password_hash: "salt$hash".to_string(),
            is_admin: false,
            status_text: String::new(),
            login_token: Some(format!("tok-{display}")),
            color: "#000000".to_string(),
            theme: "default".to_string(),
        }
    }

    #[test]
    fn suffixes_increment_per_username() {
        let db = Db::open_memory().unwrap();
        assert_eq!(db.next_suffix("alice").unwrap(), 1);
        db.insert_account(&account("alice", Some(1), "alice#1")).unwrap();
        assert_eq!(db.next_suffix("alice").unwrap(), 2);
        assert_eq!(db.next_suffix("bob").unwrap(), 1);

        db.insert_account(&account("alice", Some(2), "alice#2")).unwrap();
        let all = db.accounts_by_username("alice").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].display_name, "alice#1");
    }

    #[test]
    fn duplicate_display_name_rejected() {
        let db = Db::open_memory().unwrap();
        db.insert_account(&account("root", None, "root")).unwrap();
        assert!(db.insert_account(&account("root", None, "root")).is_err());
    }

    #[test]
    fn token_lookup_and_clear() {
        let db = Db::open_memory().unwrap();
        let row = db.insert_account(&account("bob", Some(1), "bob#1")).unwrap();
        assert_eq!(db.account_by_token("tok-bob#1").unwrap().unwrap().id, row.id);

        db.record_login(row.id, Some("fresh")).unwrap();
        assert!(db.account_by_token("tok-bob#1").unwrap().is_none());
        assert!(db.clear_token("fresh").unwrap());
        assert!(db.account_by_token("fresh").unwrap().is_none());
        assert!(!db.clear_token("fresh").unwrap());
    }

    #[test]
    fn profile_update_applies_present_fields_only() {
        let db = Db::open_memory().unwrap();
        db.insert_account(&account("eve", Some(1), "eve#1")).unwrap();
        let update = ProfileUpdate {
            color: Some("#ff0000".to_string()),
            theme: None,
            status_text: Some("away".to_string()),
        };
        let row = db.update_profile("eve#1", &update).unwrap().unwrap();
        assert_eq!(row.color, "#ff0000");
        assert_eq!(row.theme, "default");
        assert_eq!(row.status_text, "away");
        assert!(db.update_profile("ghost#1", &update).unwrap().is_none());
    }

    #[test]
    fn list_returns_most_recent_oldest_first() {
        let db = Db::open_memory().unwrap();
        db.insert_message(&message("a", "u", "first", 1000)).unwrap();
        db.insert_message(&message("b", "u", "second", 2000)).unwrap();
        db.insert_message(&message("c", "u", "third", 3000)).unwrap();

        let msgs = db.list_messages(2).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message, "second");
        assert_eq!(msgs[1].message, "third");
    }

    #[test]
    fn reply_snapshot_survives_storage() {
        let db = Db::open_memory().unwrap();
        let mut msg = message("r", "bob#1", "agreed", 1000);
        msg.reply_to = Some(ReplySnapshot {
            id: "a".to_string(),
            username: "alice#1".to_string(),
            message: "lunch?".to_string(),
        });
        db.insert_message(&msg).unwrap();
        let loaded = db.list_messages(10).unwrap();
        assert_eq!(loaded[0].reply_to, msg.reply_to);
    }

    #[test]
    fn update_requires_matching_author() {
        let db = Db::open_memory().unwrap();
        db.insert_message(&message("a", "alice#1", "helo", 1000)).unwrap();

        assert!(db.update_message("a", "bob#1", "hijacked", Utc::now()).unwrap().is_none());
        let edited = db.update_message("a", "alice#1", "hello", Utc::now()).unwrap().unwrap();
        assert_eq!(edited.message, "hello");
        assert!(edited.edited);
        assert!(edited.edited_at.is_some());
    }

    #[test]
    fn delete_requires_matching_author() {
        let db = Db::open_memory().unwrap();
        db.insert_message(&message("a", "alice#1", "oops", 1000)).unwrap();
        assert!(!db.delete_message("a", "Alice#1").unwrap());
        assert!(db.delete_message("a", "alice#1").unwrap());
        assert!(db.list_messages(10).unwrap().is_empty());
    }

    #[test]
    fn trim_keeps_newest_by_timestamp() {
        let db = Db::open_memory().unwrap();
        // Inserted out of timestamp order on purpose.
        db.insert_message(&message("c", "u", "3", 3000)).unwrap();
        db.insert_message(&message("a", "u", "1", 1000)).unwrap();
        db.insert_message(&message("d", "u", "4", 4000)).unwrap();
        db.insert_message(&message("b", "u", "2", 2000)).unwrap();

        assert_eq!(db.trim_messages(2).unwrap(), 2);
        let left: Vec<String> = db.list_messages(10).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(left, vec!["c", "d"]);
    }

    #[test]
    fn bans_roundtrip() {
        let db = Db::open_memory().unwrap();
        let ban = BanRow { display_name: "eve#1".to_string(), set_by: "root".to_string(), set_at: 1 };
        db.save_ban(&ban).unwrap();
        db.save_ban(&ban).unwrap();
        assert_eq!(db.load_bans().unwrap(), vec![ban]);
        db.remove_ban("eve#1").unwrap();
        assert!(db.load_bans().unwrap().is_empty());
    }

    #[test]
    fn reopen_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        {
            let db = Db::open(&path).unwrap();
            db.insert_message(&message("a", "u", "persisted", 1000)).unwrap();
        }
        let db = Db::open(&path).unwrap();
        assert_eq!(db.list_messages(10).unwrap()[0].message, "persisted");
    }
}
