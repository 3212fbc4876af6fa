//! Sending, editing and deleting messages; typing indicators; slash commands.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Connection, Phase};
use crate::command::{self, CommandOutcome};
use crate::error::ChatError;
use crate::log::{MessageDraft, ReplySnapshot};
use crate::protocol::Event;

pub(super) async fn handle_send(
    conn: &mut Connection,
    seq: Option<u64>,
    text: String,
    reply_to: Option<ReplySnapshot>,
) {
    let Some(session) = conn.session() else {
        return;
    };
    let me = session.account.display_name.clone();

    let muted = conn.state.moderation.lock().check_mute(&me, Instant::now());
    if let Err(secs) = muted {
        conn.push(Event::notice(format!(
            "You are muted. {secs} second(s) remaining."
        )));
        conn.reply_err(seq, &ChatError::state(format!("You are muted ({secs}s remaining)")));
        return;
    }

    if let Err(e) = validate_body(&text, conn.state.config.max_message_len) {
        conn.reply_err(seq, &e);
        return;
    }

    if text.starts_with('/') {
        handle_command(conn, seq, &text).await;
        return;
    }

    let draft = MessageDraft {
        reply_to,
        ..chat_draft(conn, text)
    };
    let appended = conn.state.log.append(draft);
    let id = appended.message.id.clone();
    conn.state.broadcast(Event::Message {
        message: appended.message,
    });
    // The room already has it; ack once the row is durable so the sender's
    // next edit or delete finds it in the store.
    settle(appended.persisted).await;
    conn.reply_with(seq, &json!({ "id": id }));
}

async fn handle_command(conn: &mut Connection, seq: Option<u64>, text: &str) {
    let cmd = match command::parse(text) {
        None => {
            let name = text.split_whitespace().next().unwrap_or(text);
            conn.reply_err(seq, &ChatError::validation(format!("Unknown command: {name}")));
            return;
        }
        Some(Err(e)) => {
            conn.reply_err(seq, &e);
            return;
        }
        Some(Ok(cmd)) => cmd,
    };

    let state = Arc::clone(&conn.state);
    let Phase::Authenticated(ref mut session) = conn.phase else {
        return;
    };
    tracing::debug!(conn = %conn.id, username = %session.account.display_name, ?cmd, "Command");
    let outcome = command::execute(&state, conn.id, session, cmd).await;

    match outcome {
        CommandOutcome::Error(e) => conn.reply_err(seq, &e),
        CommandOutcome::System(text) => {
            state.broadcast(Event::notice(text));
            conn.reply_ok(seq);
        }
        CommandOutcome::Private(event) => {
            conn.push(event);
            conn.reply_ok(seq);
        }
        CommandOutcome::CommandResult {
            user_message,
            result_sender,
            result_color,
            result_message,
        } => {
            let invocation = state.log.append(chat_draft(conn, user_message));
            state.broadcast(Event::Message {
                message: invocation.message,
            });
            let answer = state.log.append(MessageDraft {
                username: result_sender,
                message: result_message,
                color: result_color,
                is_command_result: true,
                ..Default::default()
            });
            state.broadcast(Event::Message {
                message: answer.message,
            });
            settle(invocation.persisted).await;
            settle(answer.persisted).await;
            conn.reply_ok(seq);
        }
    }
}

pub(super) async fn handle_edit(conn: &mut Connection, seq: Option<u64>, id: &str, body: &str) {
    let Some(session) = conn.session() else {
        return;
    };
    let me = session.account.display_name.clone();

    if let Err(e) = validate_body(body, conn.state.config.max_message_len) {
        conn.reply_err(seq, &e);
        return;
    }

    match conn.state.log.edit(id, &me, body).await {
        Ok(message) => {
            tracing::debug!(conn = %conn.id, %id, "Message edited");
            conn.state.broadcast(Event::MessageEdited { message });
            conn.reply_ok(seq);
        }
        Err(e) => conn.reply_err(seq, &e),
    }
}

pub(super) async fn handle_delete(conn: &mut Connection, seq: Option<u64>, id: &str) {
    let Some(session) = conn.session() else {
        return;
    };
    let me = session.account.display_name.clone();

    match conn.state.log.delete(id, &me).await {
        Ok(()) => {
            tracing::debug!(conn = %conn.id, %id, "Message deleted");
            conn.state.broadcast(Event::MessageDeleted { id: id.to_string() });
            conn.reply_ok(seq);
        }
        Err(e) => conn.reply_err(seq, &e),
    }
}

pub(super) fn handle_typing(conn: &Connection, started: bool) {
    let Some(session) = conn.session() else {
        return;
    };
    let username = session.account.display_name.clone();
    let event = if started {
        Event::TypingStart { username }
    } else {
        Event::TypingStop { username }
    };
    conn.state.broadcast_except(conn.id, event);
}

async fn settle(persisted: JoinHandle<()>) {
    if let Err(e) = persisted.await {
        tracing::warn!("Persist task failed: {e}");
    }
}

/// A plain chat draft authored by this connection's identity.
fn chat_draft(conn: &Connection, message: String) -> MessageDraft {
    let Some(session) = conn.session() else {
        return MessageDraft::default();
    };
    let name = &session.account.display_name;
    let status_text = conn.state.statuses.lock().get(name).cloned();
    MessageDraft {
        username: name.clone(),
        message,
        color: session.account.color.clone(),
        is_admin: session.admin,
        status_text,
        ..Default::default()
    }
}

fn validate_body(body: &str, max_len: usize) -> Result<(), ChatError> {
    if body.trim().is_empty() {
        return Err(ChatError::validation("Message cannot be empty"));
    }
    if body.chars().count() > max_len {
        return Err(ChatError::validation(format!(
            "Message must be at most {max_len} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limits() {
        assert!(validate_body("hi", 5).is_ok());
        assert!(validate_body("   ", 5).is_err());
        assert!(validate_body("", 5).is_err());
        assert!(validate_body("héllo", 5).is_ok());
        assert!(validate_body("hello!", 5).is_err());
    }
}
