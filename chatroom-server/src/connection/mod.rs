//! Per-client connection handler.
//!
//! Each WebSocket gets a [`Connection`], a small state machine:
//! `Unauthenticated -> Authenticated -> Closed`. Closed is terminal and is
//! entered once, by whichever of logout, transport disconnect or ban comes
//! first.
//!
//! The handler is split into submodules:
//! - [`auth`] — signup, login, token login, logout
//! - [`messaging`] — send, edit, delete, typing, slash commands
//! - [`profile`] — profile updates and status broadcasts

mod auth;
mod messaging;
mod profile;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::directory::Account;
use crate::error::ChatError;
use crate::protocol::{Envelope, Event, Outbound, Reply, Request};
use crate::registry::ConnId;
use crate::server::SharedState;

/// What an authenticated connection knows about its identity.
#[derive(Debug, Clone)]
pub struct Session {
    /// Snapshot taken at login, refreshed on profile edits.
    pub account: Account,
    /// Captured from the account at bind time.
    pub admin: bool,
}

#[derive(Debug)]
enum Phase {
    Unauthenticated,
    Authenticated(Session),
    Closed,
}

/// State of a single client connection.
pub struct Connection {
    id: ConnId,
    state: Arc<SharedState>,
    phase: Phase,
}

impl Connection {
    /// Register a new connection whose frames go out through `tx`.
    pub fn open(state: Arc<SharedState>, tx: mpsc::Sender<Outbound>) -> Self {
        let id = ConnId::next();
        state.connections.lock().insert(id, tx);
        tracing::debug!(%id, "Connection opened");
        Self {
            id,
            state,
            phase: Phase::Unauthenticated,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Display name, once authenticated.
    pub fn identity(&self) -> Option<&str> {
        match self.phase {
            Phase::Authenticated(ref s) => Some(&s.account.display_name),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Handle one inbound request.
    pub async fn handle(&mut self, envelope: Envelope) {
        let Envelope { seq, request } = envelope;
        let op = request.name();

        if matches!(request, Request::Heartbeat) {
            if !self.is_closed() {
                self.push(Event::HeartbeatAck);
            }
            return;
        }

        match self.phase {
            Phase::Closed => {
                tracing::debug!(conn = %self.id, op, "Ignoring request on closed connection");
            }
            Phase::Unauthenticated => match request {
                Request::Signup { username, password } => {
                    auth::handle_signup(self, seq, &username, &password).await
                }
                Request::Login { username, password } => {
                    auth::handle_login(self, seq, &username, &password).await
                }
                Request::TokenLogin { token } => auth::handle_token_login(self, seq, &token).await,
                _ => tracing::debug!(conn = %self.id, op, "Ignoring request before login"),
            },
            Phase::Authenticated(_) => {
                if !self.still_bound() {
                    tracing::info!(conn = %self.id, op, "Session was revoked; closing");
                    self.close();
                    return;
                }
                match request {
                    Request::Logout => auth::handle_logout(self, seq).await,
                    Request::UpdateProfile(update) => {
                        profile::handle_update_profile(self, seq, update).await
                    }
                    Request::SendMessage { message, reply_to } => {
                        messaging::handle_send(self, seq, message, reply_to).await
                    }
                    Request::EditMessage { id, message } => {
                        messaging::handle_edit(self, seq, &id, &message).await
                    }
                    Request::DeleteMessage { id } => messaging::handle_delete(self, seq, &id).await,
                    Request::Typing => messaging::handle_typing(self, true),
                    Request::StopTyping => messaging::handle_typing(self, false),
                    Request::Signup { .. } | Request::Login { .. } | Request::TokenLogin { .. } => {
                        self.reply_err(seq, &ChatError::state("Already logged in"));
                    }
                    Request::Heartbeat => {}
                }
            }
        }
    }

    /// Move to Closed. Deregisters the session and announces the leave if
    /// this was the identity's last connection. Later calls do nothing but
    /// make sure the outbound sender is released.
    pub fn close(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Closed);
        if let Phase::Authenticated(session) = previous {
            let name = session.account.display_name;
            let last = self.state.sessions.lock().deregister(&name, self.id);
            if last {
                self.state.statuses.lock().remove(&name);
                crate::presence::announce_leave(&self.state, &name);
            }
            tracing::info!(conn = %self.id, username = %name, last, "Session closed");
        }
        self.state.connections.lock().remove(&self.id);
    }

    /// Whether the registry still binds this connection to its session.
    /// A ban unbinds every connection of the target.
    fn still_bound(&self) -> bool {
        let Phase::Authenticated(ref session) = self.phase else {
            return false;
        };
        self.state
            .sessions
            .lock()
            .binding(self.id)
            .is_some_and(|b| b.identity == session.account.display_name)
    }

    fn session(&self) -> Option<&Session> {
        match self.phase {
            Phase::Authenticated(ref s) => Some(s),
            _ => None,
        }
    }

    fn push(&self, event: Event) {
        self.state.send_to(self.id, Outbound::Event(event));
    }

    fn reply_ok(&self, seq: Option<u64>) {
        self.state.send_to(self.id, Outbound::Reply(Reply::ok(seq)));
    }

    fn reply_with<T: Serialize>(&self, seq: Option<u64>, payload: &T) {
        self.state
            .send_to(self.id, Outbound::Reply(Reply::ok_with(seq, payload)));
    }

    fn reply_err(&self, seq: Option<u64>, error: &ChatError) {
        tracing::debug!(conn = %self.id, "Request failed: {error}");
        self.state.send_to(self.id, Outbound::Reply(Reply::err(seq, error)));
    }
}
