//! Signup, login and logout.

use serde_json::json;

use super::{Connection, Phase, Session};
use crate::directory::Account;
use crate::error::ChatError;
use crate::protocol::{LoginPayload, Outbound};

/// Create an account. The connection stays unauthenticated; the client logs
/// in with the returned token.
pub(super) async fn handle_signup(
    conn: &mut Connection,
    seq: Option<u64>,
    username: &str,
    password: &str,
) {
    match conn.state.directory.signup(username, password).await {
        Ok(account) => {
            tracing::info!(conn = %conn.id, display_name = %account.display_name, "Signup");
            conn.reply_with(seq, &json!({ "account": account }));
        }
        Err(e) => {
            tracing::info!(conn = %conn.id, %username, "Signup rejected: {e}");
            conn.reply_err(seq, &e);
        }
    }
}

pub(super) async fn handle_login(
    conn: &mut Connection,
    seq: Option<u64>,
    username: &str,
    password: &str,
) {
    let result = conn.state.directory.login(username, password).await;
    complete_login(conn, seq, result).await;
}

pub(super) async fn handle_token_login(conn: &mut Connection, seq: Option<u64>, token: &str) {
    let result = conn.state.directory.login_by_token(token).await;
    complete_login(conn, seq, result).await;
}

/// Bind an authenticated account to this connection and hand it the room.
///
/// Order matters: the ban check and registration are one step, the roster
/// is read after registration so the joiner sees itself, and the join
/// announcement goes out only after the reply.
async fn complete_login(conn: &mut Connection, seq: Option<u64>, result: Result<Account, ChatError>) {
    let account = match result {
        Ok(account) => account,
        Err(e) => {
            tracing::info!(conn = %conn.id, "Login rejected: {e}");
            conn.reply_err(seq, &e);
            return;
        }
    };
    if conn.is_closed() || conn.session().is_some() {
        return;
    }

    let name = account.display_name.clone();
    let state = std::sync::Arc::clone(&conn.state);

    let admin = account.is_admin;
    let first = match state.bind_session(&name, conn.id, admin) {
        Ok(first) => first,
        Err(e) => {
            tracing::info!(conn = %conn.id, username = %name, "Banned identity tried to log in");
            conn.reply_err(seq, &e);
            return;
        }
    };
    if !account.status_text.is_empty() {
        state
            .statuses
            .lock()
            .insert(name.clone(), account.status_text.clone());
    }
    conn.phase = Phase::Authenticated(Session {
        account: account.clone(),
        admin,
    });

    let history = state.log.resync().await;

    if !conn.still_bound() {
        // Banned while history was loading.
        conn.close();
        return;
    }

    let (online_users, user_statuses) = crate::presence::roster(&state);
    tracing::info!(
        conn = %conn.id,
        username = %name,
        admin,
        online = online_users.len(),
        "Login"
    );
    conn.reply_with(
        seq,
        &LoginPayload {
            account,
            history,
            online_users,
            user_statuses,
        },
    );

    if first {
        crate::presence::announce_join(&state, conn.id, &name);
    }
}

/// Invalidate the token and close the connection.
pub(super) async fn handle_logout(conn: &mut Connection, seq: Option<u64>) {
    let token = conn.session().and_then(|s| s.account.token.clone());
    if let Some(token) = token {
        if let Err(e) = conn.state.directory.logout(&token).await {
            tracing::warn!(conn = %conn.id, "Token invalidation failed: {e}");
        }
    }
    conn.reply_ok(seq);
    conn.state.send_to(conn.id, Outbound::Close);
    conn.close();
}
