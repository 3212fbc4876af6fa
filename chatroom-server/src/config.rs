use clap::Parser;

use crate::directory::AdminPolicy;

/// Upper bound for `--idle-timeout-secs`: one year.
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(name = "chatroom-server", about = "Single-room WebSocket chat server")]
pub struct ServerConfig {
    /// Address to listen on for WebSocket connections
    #[arg(long, env = "CHAT_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// Path to the SQLite database file. Without it, accounts and durable
    /// history are unavailable and the room runs from memory only.
    #[arg(long, env = "CHAT_DB_PATH")]
    pub db_path: Option<String>,

    /// Messages kept in the cache and the durable log
    #[arg(long, env = "CHAT_MAX_HISTORY", default_value = "500")]
    pub max_history: usize,

    /// Reserved admin display names (comma separated)
    #[arg(long, env = "CHAT_ADMIN_NAMES", value_delimiter = ',')]
    pub admin_names: Vec<String>,

    /// Password unlocking the admin names; admin accounts are seeded with it
    #[arg(long, env = "CHAT_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// Close connections that send nothing for this many seconds
    #[arg(long, env = "CHAT_IDLE_TIMEOUT_SECS", default_value = "120")]
    pub idle_timeout_secs: u64,

    /// Longest accepted chat message, in characters
    #[arg(long, env = "CHAT_MAX_MESSAGE_LEN", default_value = "2000")]
    pub max_message_len: usize,
}

impl ServerConfig {
    pub fn admin_policy(&self) -> AdminPolicy {
        AdminPolicy {
            names: self
                .admin_names
                .iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
            password: self.admin_password.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            db_path: None,
            max_history: 500,
            admin_names: Vec::new(),
            admin_password: None,
            idle_timeout_secs: 120,
            max_message_len: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let config = ServerConfig::parse_from([
            "chatroom-server",
            "--listen-addr",
            "127.0.0.1:4000",
            "--admin-names",
            "root, mod ,",
            "--max-history",
            "50",
        ]);
        assert_eq!(config.listen_addr, "127.0.0.1:4000");
        assert_eq!(config.max_history, 50);
        assert_eq!(config.admin_policy().names, vec!["root", "mod"]);
        assert!(config.db_path.is_none());
    }
}
