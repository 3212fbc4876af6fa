//! Server state and WebSocket listener.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{MAX_IDLE_TIMEOUT_SECS, ServerConfig};
use crate::db::{Db, SqliteBackend};
use crate::directory::AccountDirectory;
use crate::error::{ChatError, StoreError};
use crate::log::MessageLog;
use crate::moderation::Moderation;
use crate::protocol::{Event, Outbound};
use crate::registry::{ConnId, SessionRegistry};
use crate::store::{BanStore, MessageStore, OfflineBackend};

/// Outbound queue depth per connection. A client that falls this far behind
/// starts losing frames rather than stalling everyone else.
pub const OUTBOUND_QUEUE: usize = 256;

/// All mutable room state. Every lock is held briefly and never across an
/// `.await`. When `sessions` and `moderation` are both needed, `sessions`
/// is taken first.
pub struct SharedState {
    /// conn -> sender feeding that connection's writer
    pub connections: Mutex<HashMap<ConnId, mpsc::Sender<Outbound>>>,
    pub sessions: Mutex<SessionRegistry>,
    /// identity -> status text, for online identities only
    pub statuses: Mutex<BTreeMap<String, String>>,
    pub moderation: Mutex<Moderation>,
    pub log: MessageLog,
    pub directory: Arc<dyn AccountDirectory>,
    pub bans: Arc<dyn BanStore>,
    pub config: ServerConfig,
}

impl SharedState {
    /// Queue a frame for one connection. Drops it if the queue is full or
    /// the connection is gone.
    pub fn send_to(&self, conn: ConnId, frame: Outbound) {
        let Some(tx) = self.connections.lock().get(&conn).cloned() else {
            return;
        };
        if let Err(e) = tx.try_send(frame) {
            tracing::debug!(%conn, "Dropped outbound frame: {e}");
        }
    }

    /// Queue an event for every connection, authenticated or not.
    pub fn broadcast(&self, event: Event) {
        self.broadcast_filtered(event, |_| true);
    }

    pub fn broadcast_except(&self, skip: ConnId, event: Event) {
        self.broadcast_filtered(event, |c| c != skip);
    }

    /// Queue an event for every live connection of `identity`.
    pub fn send_to_identity(&self, identity: &str, event: Event) {
        let conns = self.sessions.lock().connections_of(identity);
        for conn in conns {
            self.send_to(conn, Outbound::Event(event.clone()));
        }
    }

    fn broadcast_filtered(&self, event: Event, keep: impl Fn(ConnId) -> bool) {
        let targets: Vec<(ConnId, mpsc::Sender<Outbound>)> = self
            .connections
            .lock()
            .iter()
            .filter(|(c, _)| keep(**c))
            .map(|(c, tx)| (*c, tx.clone()))
            .collect();
        for (conn, tx) in targets {
            if let Err(e) = tx.try_send(Outbound::Event(event.clone())) {
                tracing::debug!(%conn, "Dropped broadcast frame: {e}");
            }
        }
    }

    /// Bind `conn` to `identity` unless the identity is banned. Returns true
    /// if this is the identity's first live connection.
    ///
    /// The ban check and the registration happen under the sessions lock,
    /// the same lock [`SharedState::ban_and_unbind`] holds while it bans.
    pub fn bind_session(&self, identity: &str, conn: ConnId, admin: bool) -> Result<bool, ChatError> {
        let mut sessions = self.sessions.lock();
        if self.moderation.lock().is_banned(identity) {
            return Err(ChatError::state("You are banned from the chat"));
        }
        Ok(sessions.register(identity, conn, admin))
    }

    /// Ban an online, non-admin identity and unbind every connection it
    /// holds. Returns the evicted connections.
    pub fn ban_and_unbind(&self, identity: &str) -> Result<Vec<ConnId>, ChatError> {
        let mut sessions = self.sessions.lock();
        if !sessions.is_online(identity) {
            return Err(ChatError::state(format!("{identity} is not online")));
        }
        if sessions.has_admin_connection(identity) {
            return Err(ChatError::state("Admins cannot be banned"));
        }
        self.moderation.lock().ban(identity);
        let conns = sessions.connections_of(identity);
        for c in &conns {
            sessions.deregister(identity, *c);
        }
        Ok(conns)
    }

    /// Forget a connection whose handler died without closing cleanly.
    pub fn cleanup_connection(&self, conn: ConnId) {
        self.connections.lock().remove(&conn);
        let removed = self.sessions.lock().remove_connection(conn);
        if let Some((identity, true)) = removed {
            self.statuses.lock().remove(&identity);
            crate::presence::announce_leave(self, &identity);
        }
    }
}

/// Storage collaborators the room runs on.
#[derive(Clone)]
pub enum Backend {
    Sqlite(SqliteBackend),
    Offline(OfflineBackend),
}

impl Backend {
    /// Open the configured database, or fall back to offline mode with a
    /// diagnostic that auth requests will report.
    pub fn from_config(config: &ServerConfig) -> Self {
        let Some(ref path) = config.db_path else {
            tracing::warn!("No database configured; accounts and durable history are unavailable");
            return Backend::Offline(OfflineBackend::new(StoreError::not_configured()));
        };
        tracing::info!("Opening database: {path}");
        match Db::open(path) {
            Ok(db) => Backend::Sqlite(SqliteBackend::new(db, config.admin_policy())),
            Err(e) => {
                tracing::error!("Failed to open database {path}: {e}");
                Backend::Offline(OfflineBackend::new(StoreError::open_failed(path, &e)))
            }
        }
    }

    fn parts(&self) -> (Arc<dyn AccountDirectory>, Arc<dyn MessageStore>, Arc<dyn BanStore>) {
        match self {
            Backend::Sqlite(b) => (Arc::new(b.clone()), Arc::new(b.clone()), Arc::new(b.clone())),
            Backend::Offline(b) => (Arc::new(b.clone()), Arc::new(b.clone()), Arc::new(b.clone())),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    backend: Option<Backend>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            backend: None,
        }
    }

    /// Create a server over an already-open backend (for testing).
    pub fn with_backend(config: ServerConfig, backend: Backend) -> Self {
        Self {
            config,
            backend: Some(backend),
        }
    }

    /// Build SharedState, loading persisted bans and history.
    pub async fn build_state(&self) -> Result<Arc<SharedState>> {
        anyhow::ensure!(self.config.max_history > 0, "max_history must be at least 1");
        anyhow::ensure!(
            (1..=MAX_IDLE_TIMEOUT_SECS).contains(&self.config.idle_timeout_secs),
            "idle_timeout_secs must be between 1 and {MAX_IDLE_TIMEOUT_SECS}"
        );

        let backend = match self.backend {
            Some(ref b) => b.clone(),
            None => Backend::from_config(&self.config),
        };

        if let Backend::Sqlite(ref sqlite) = backend {
            let created = sqlite
                .seed_admins()
                .await
                .context("Failed to seed admin accounts")?;
            if created > 0 {
                tracing::info!("Seeded {created} admin account(s)");
            }
        }

        let (directory, store, bans) = backend.parts();

        let mut moderation = Moderation::new();
        match bans.load_bans().await {
            Ok(rows) => {
                tracing::info!("Loaded {} ban(s)", rows.len());
                moderation.load_bans(rows.into_iter().map(|r| r.display_name));
            }
            Err(e) => tracing::warn!("Could not load bans: {e}"),
        }

        let log = MessageLog::new(self.config.max_history, store);
        let history = log.resync().await;
        tracing::info!("Loaded {} message(s) into history", history.len());

        Ok(Arc::new(SharedState {
            connections: Mutex::new(HashMap::new()),
            sessions: Mutex::new(SessionRegistry::new()),
            statuses: Mutex::new(BTreeMap::new()),
            moderation: Mutex::new(moderation),
            log,
            directory,
            bans,
            config: self.config.clone(),
        }))
    }

    /// Run the server until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state().await?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("WebSocket listener on {}", self.config.listen_addr);

        axum::serve(listener, crate::web::router(state))
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {e}");
                }
                tracing::info!("Shutting down");
            })
            .await?;
        Ok(())
    }

    /// Start the server and return the bound address, state and task
    /// handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state().await?;
        let router = crate::web::router(Arc::clone(&state));
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await?;
            Ok(())
        });

        Ok((addr, state, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn offline_state(config: ServerConfig) -> Result<Arc<SharedState>> {
        let backend = Backend::Offline(OfflineBackend::new(StoreError::not_configured()));
        Server::with_backend(config, backend).build_state().await
    }

    #[tokio::test]
    async fn idle_timeout_must_be_bounded() {
        for secs in [0, MAX_IDLE_TIMEOUT_SECS + 1, u64::MAX] {
            let config = ServerConfig {
                idle_timeout_secs: secs,
                ..Default::default()
            };
            assert!(offline_state(config).await.is_err(), "{secs} should be rejected");
        }
        let config = ServerConfig {
            idle_timeout_secs: MAX_IDLE_TIMEOUT_SECS,
            ..Default::default()
        };
        assert!(offline_state(config).await.is_ok());
    }

    #[tokio::test]
    async fn banned_identity_cannot_bind() {
        let state = offline_state(ServerConfig::default()).await.unwrap();
        let (a, b) = (ConnId::next(), ConnId::next());

        assert!(state.bind_session("eve#1", a, false).unwrap());
        assert_eq!(state.ban_and_unbind("eve#1").unwrap(), vec![a]);
        assert!(state.moderation.lock().is_banned("eve#1"));
        assert!(!state.sessions.lock().is_online("eve#1"));

        assert!(matches!(state.bind_session("eve#1", b, false), Err(ChatError::State(_))));
        assert!(state.sessions.lock().binding(b).is_none());
    }

    #[tokio::test]
    async fn ban_refuses_admins_and_offline_identities() {
        let state = offline_state(ServerConfig::default()).await.unwrap();
        assert!(state.ban_and_unbind("nobody#1").is_err());

        state.bind_session("root", ConnId::next(), true).unwrap();
        assert!(matches!(state.ban_and_unbind("root"), Err(ChatError::State(_))));
        assert!(!state.moderation.lock().is_banned("root"));
        assert!(state.sessions.lock().is_online("root"));
    }

    /// A login racing a ban either lands first and is evicted, or sees the
    /// ban and is refused. The identity never ends up banned and online.
    #[tokio::test]
    async fn concurrent_login_and_ban_leave_no_banned_session() {
        for _ in 0..200 {
            let state = offline_state(ServerConfig::default()).await.unwrap();
            let (a, b) = (ConnId::next(), ConnId::next());
            state.bind_session("eve#1", a, false).unwrap();

            std::thread::scope(|s| {
                s.spawn(|| state.ban_and_unbind("eve#1").map(|_| ()));
                s.spawn(|| state.bind_session("eve#1", b, false).map(|_| ()));
            });

            assert!(state.moderation.lock().is_banned("eve#1"));
            assert!(!state.sessions.lock().is_online("eve#1"));
            assert!(state.sessions.lock().binding(b).is_none());
        }
    }
}
