//! Account directory: signup, login, token login, logout and profile edits.
//!
//! The connection layer only sees the [`AccountDirectory`] trait. The SQLite
//! implementation lives here alongside the credential helpers; the offline
//! implementation answers every auth call with the startup diagnostic.

use std::sync::OnceLock;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::{AccountRow, SqliteBackend};
use crate::error::{ChatError, StoreError};
use crate::store::OfflineBackend;

pub const USERNAME_MAX_LEN: usize = 20;
pub const PASSWORD_MIN_LEN: usize = 4;
pub const THEME_MAX_LEN: usize = 20;
pub const STATUS_MAX_LEN: usize = 100;

/// Substring no ordinary account may carry in its username.
const RESERVED_WORD: &str = "admin";

const DEFAULT_COLOR: &str = "#000000";
const DEFAULT_THEME: &str = "default";

/// Account as seen by the rest of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub display_name: String,
    pub is_admin: bool,
    pub color: String,
    pub theme: String,
    pub status_text: String,
    /// Present on signup and login replies only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Account {
    fn from_row(row: AccountRow, token: Option<String>) -> Self {
        Self {
            display_name: row.display_name,
            is_admin: row.is_admin,
            color: row.color,
            theme: row.theme,
            status_text: row.status_text,
            token,
        }
    }
}

/// Partial profile edit. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfileUpdate {
    pub color: Option<String>,
    pub theme: Option<String>,
    pub status_text: Option<String>,
}

impl ProfileUpdate {
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.color.as_deref().is_some_and(|c| !is_valid_color(c)) {
            return Err(ChatError::validation("Color must be # followed by 3 to 6 hex digits"));
        }
        if self.theme.as_deref().is_some_and(|t| t.chars().count() > THEME_MAX_LEN) {
            return Err(ChatError::validation(format!(
                "Theme must be at most {THEME_MAX_LEN} characters"
            )));
        }
        if self.status_text.as_deref().is_some_and(|s| s.chars().count() > STATUS_MAX_LEN) {
            return Err(ChatError::validation(format!(
                "Status must be at most {STATUS_MAX_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Reserved admin names and the password that unlocks them.
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    pub names: Vec<String>,
    pub password: Option<String>,
}

impl AdminPolicy {
    /// Exact, case-sensitive match against a configured admin name.
    pub fn is_admin_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Whether `name` is unavailable to ordinary signups: it contains the
    /// reserved word, or equals an admin name ignoring case.
    pub fn is_reserved(&self, name: &str) -> bool {
        name.to_lowercase().contains(RESERVED_WORD)
            || self.names.iter().any(|n| n.to_lowercase() == name.to_lowercase())
    }
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn signup(&self, username: &str, password: &str) -> Result<Account, ChatError>;

    /// Check credentials against every account sharing `username` and rotate
    /// the token of the first match.
    async fn login(&self, username: &str, password: &str) -> Result<Account, ChatError>;

    async fn login_by_token(&self, token: &str) -> Result<Account, ChatError>;

    async fn logout(&self, token: &str) -> Result<(), ChatError>;

    async fn update_profile(
        &self,
        display_name: &str,
        update: ProfileUpdate,
    ) -> Result<Account, ChatError>;

    async fn lookup(&self, display_name: &str) -> Result<Option<Account>, ChatError>;
}

// ── Credentials ────────────────────────────────────────────────────────

static COLOR_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// `#` followed by 3 to 6 hex digits.
pub fn is_valid_color(color: &str) -> bool {
    COLOR_RE
        .get_or_init(|| Regex::new(r"^#[0-9A-Fa-f]{3,6}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(color))
}

/// `salt$sha256(salt || password)`, both hex.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::thread_rng().r#gen();
    let salt = hex::encode(salt);
    format!("{salt}${}", salted_digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => salted_digest(salt, password) == digest,
        None => false,
    }
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// 32 random bytes, hex-encoded.
pub fn new_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

fn validate_credentials(username: &str, password: &str) -> Result<(), ChatError> {
    let len = username.chars().count();
    if len == 0 || len > USERNAME_MAX_LEN {
        return Err(ChatError::validation(format!(
            "Username must be 1 to {USERNAME_MAX_LEN} characters"
        )));
    }
    if password.chars().count() < PASSWORD_MIN_LEN {
        return Err(ChatError::validation(format!(
            "Password must be at least {PASSWORD_MIN_LEN} characters"
        )));
    }
    Ok(())
}

// ── SQLite directory ───────────────────────────────────────────────────

impl SqliteBackend {
    /// Create any configured admin account that does not exist yet.
    /// Returns how many were created.
    pub async fn seed_admins(&self) -> Result<usize, StoreError> {
        let Some(ref password) = self.admins.password else {
            return Ok(0);
        };
        let names = self.admins.names.clone();
        let hash = hash_password(password);
        self.run(move |db| {
            let mut created = 0;
            for name in names {
                if db.account_by_display_name(&name)?.is_some() {
                    continue;
                }
                db.insert_account(&admin_row(&name, &hash, None))?;
                tracing::info!(username = %name, "Admin account created");
                created += 1;
            }
            Ok(created)
        })
        .await
    }
}

fn admin_row(name: &str, password_hash: &str, token: Option<String>) -> AccountRow {
    AccountRow {
        id: 0,
        username: name.to_string(),
        suffix: None,
        display_name: name.to_string(),
        password_hash: password_hash.to_string(),
        is_admin: true,
        status_text: String::new(),
        login_token: token,
        color: DEFAULT_COLOR.to_string(),
        theme: DEFAULT_THEME.to_string(),
    }
}

#[async_trait]
impl AccountDirectory for SqliteBackend {
    async fn signup(&self, username: &str, password: &str) -> Result<Account, ChatError> {
        validate_credentials(username, password)?;

        let token = new_token();
        let hash = hash_password(password);
        let username = username.to_string();

        if self.admins.is_admin_name(&username) {
            if self.admins.password.as_deref() != Some(password) {
                return Err(ChatError::validation("This name is not available"));
            }
            let row = admin_row(&username, &hash, Some(token.clone()));
            let inserted = self
                .run(move |db| {
                    if db.account_by_display_name(&row.display_name)?.is_some() {
                        return Ok(None);
                    }
                    db.insert_account(&row).map(Some)
                })
                .await?;
            return match inserted {
                Some(row) => Ok(Account::from_row(row, Some(token))),
                None => Err(ChatError::state("This account already exists")),
            };
        }

        if self.admins.is_reserved(&username) {
            return Err(ChatError::validation("This name is not available"));
        }

        let row = self
            .run(move |db| {
                let suffix = db.next_suffix(&username)?;
                db.insert_account(&AccountRow {
                    id: 0,
                    display_name: format!("{username}#{suffix}"),
                    username,
                    suffix: Some(suffix),
                    password_hash: hash,
                    is_admin: false,
                    status_text: String::new(),
                    login_token: Some(token),
                    color: DEFAULT_COLOR.to_string(),
                    theme: DEFAULT_THEME.to_string(),
                })
            })
            .await?;
        tracing::info!(display_name = %row.display_name, "Account created");
        let token = row.login_token.clone();
        Ok(Account::from_row(row, token))
    }

    async fn login(&self, username: &str, password: &str) -> Result<Account, ChatError> {
        if username.is_empty() {
            return Err(ChatError::validation("Enter a username"));
        }
        if password.is_empty() {
            return Err(ChatError::validation("Enter a password"));
        }

        let (username, password) = (username.to_string(), password.to_string());
        let token = new_token();
        self.run(move |db| {
                let candidates = db.accounts_by_username(&username)?;
                if candidates.is_empty() {
                    return Ok(Err(ChatError::state("Account not found")));
                }
                let Some(row) = candidates
                    .into_iter()
                    .find(|row| verify_password(&password, &row.password_hash))
                else {
                    return Ok(Err(ChatError::state("Wrong password")));
                };
                db.record_login(row.id, Some(&token))?;
                Ok(Ok(Account::from_row(row, Some(token))))
            })
            .await?
    }

    async fn login_by_token(&self, token: &str) -> Result<Account, ChatError> {
        if token.is_empty() {
            return Err(ChatError::validation("A token is required"));
        }
        let token = token.to_string();
        let row = self
            .run(move |db| {
                let row = db.account_by_token(&token)?;
                if let Some(ref row) = row {
                    db.record_login(row.id, None)?;
                }
                Ok(row)
            })
            .await?;
        match row {
            Some(row) => {
                let token = row.login_token.clone();
                Ok(Account::from_row(row, token))
            }
            None => Err(ChatError::state("Session is no longer valid")),
        }
    }

    async fn logout(&self, token: &str) -> Result<(), ChatError> {
        let token = token.to_string();
        self.run(move |db| db.clear_token(&token)).await?;
        Ok(())
    }

    async fn update_profile(
        &self,
        display_name: &str,
        update: ProfileUpdate,
    ) -> Result<Account, ChatError> {
        update.validate()?;
        let name = display_name.to_string();
        let row = self
            .run(move |db| db.update_profile(&name, &update))
            .await?;
        row.map(|row| Account::from_row(row, None))
            .ok_or_else(|| ChatError::state("Account not found"))
    }

    async fn lookup(&self, display_name: &str) -> Result<Option<Account>, ChatError> {
        let name = display_name.to_string();
        let row = self.run(move |db| db.account_by_display_name(&name)).await?;
        Ok(row.map(|row| Account::from_row(row, None)))
    }
}

// ── Offline directory ──────────────────────────────────────────────────

#[async_trait]
impl AccountDirectory for OfflineBackend {
    async fn signup(&self, _username: &str, _password: &str) -> Result<Account, ChatError> {
        Err(self.error().into())
    }

    async fn login(&self, _username: &str, _password: &str) -> Result<Account, ChatError> {
        Err(self.error().into())
    }

    async fn login_by_token(&self, _token: &str) -> Result<Account, ChatError> {
        Err(self.error().into())
    }

    async fn logout(&self, _token: &str) -> Result<(), ChatError> {
        Err(self.error().into())
    }

    async fn update_profile(
        &self,
        _display_name: &str,
        _update: ProfileUpdate,
    ) -> Result<Account, ChatError> {
        Err(self.error().into())
    }

    async fn lookup(&self, _display_name: &str) -> Result<Option<Account>, ChatError> {
        Err(self.error().into())
    }
}
