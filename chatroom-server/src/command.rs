//! Slash commands typed into the message box.
//!
//! [`parse`] turns text into a [`Command`]; [`execute`] applies it and
//! reports a [`CommandOutcome`] the caller turns into replies and
//! broadcasts. Privileged commands re-check the caller's registry binding
//! on every invocation rather than trusting the session snapshot.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::connection::Session;
use crate::db::BanRow;
use crate::directory::{Account, ProfileUpdate, is_valid_color};
use crate::error::ChatError;
use crate::protocol::{Event, Outbound};
use crate::registry::ConnId;
use crate::server::SharedState;

/// Longest accepted mute: one year.
pub const MAX_MUTE_SECS: u64 = 365 * 24 * 60 * 60;

pub const OMIKUJI_PERSONA: (&str, &str) = ("Omikuji", "#e74c3c");
pub const DICE_PERSONA: (&str, &str) = ("Dice", "#3498db");
pub const COIN_PERSONA: (&str, &str) = ("Coin", "#f39c12");

const FORTUNES: &[(&str, &str)] = &[
    ("Great blessing", "Everything you try today will work out!"),
    ("Middle blessing", "Something good is on its way."),
    ("Small blessing", "Not bad. Keep at it steadily."),
    ("Blessing", "An ordinary, peaceful day."),
    ("Future blessing", "Your luck opens up later. Be patient."),
    ("Curse", "Take care and act cautiously."),
    ("Great curse", "Maybe lie low today..."),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    DeleteAll,
    Mute { target: String, secs: u64 },
    Unmute { target: String },
    Ban { target: String },
    Unban { target: String },
    PrivateMessage { target: String, body: String },
    Omikuji,
    Color { color: String },
    Dice,
    Coin,
    Help,
}

impl Command {
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::DeleteAll
                | Command::Mute { .. }
                | Command::Unmute { .. }
                | Command::Ban { .. }
                | Command::Unban { .. }
        )
    }
}

/// What the connection should do with a command's result.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Shown to the invoker only.
    Error(ChatError),
    /// Broadcast to everyone as a system notice.
    System(String),
    /// Sent to the invoking connection only.
    Private(Event),
    /// Two log entries: the invocation by the user, then the persona's answer.
    CommandResult {
        user_message: String,
        result_sender: String,
        result_color: String,
        result_message: String,
    },
}

/// Parse `text` as a command. `None` means the first word is not a known
/// command; `Some(Err(_))` means it is, but the arguments are wrong.
pub fn parse(text: &str) -> Option<Result<Command, ChatError>> {
    let mut words = text.split_whitespace();
    let name = words.next()?.to_lowercase();
    let args: Vec<&str> = words.collect();

    let cmd = match name.as_str() {
        "/delete" => Ok(Command::DeleteAll),
        "/mute" => match args.as_slice() {
            [target, secs] => parse_positive(secs).map(|secs| Command::Mute {
                target: target.to_string(),
                secs,
            }),
            _ => Err(usage("/mute <user> <seconds>")),
        },
        "/unmute" => one_target(&args, "/unmute <user>").map(|target| Command::Unmute { target }),
        "/ban" => one_target(&args, "/ban <user>").map(|target| Command::Ban { target }),
        "/unban" => one_target(&args, "/unban <user>").map(|target| Command::Unban { target }),
        "/prm" => match args.split_first() {
            Some((target, rest)) if !rest.is_empty() => Ok(Command::PrivateMessage {
                target: target.to_string(),
                body: rest.join(" "),
            }),
            _ => Err(usage("/prm <user> <message>")),
        },
        "/omi" | "/omikuji" => Ok(Command::Omikuji),
        "/color" => match args.as_slice() {
            [color] if is_valid_color(color) => Ok(Command::Color {
                color: color.to_string(),
            }),
            [_] => Err(ChatError::validation(
                "Color must be # followed by 3 to 6 hex digits (e.g. /color #ff0000)",
            )),
            _ => Err(usage("/color #hex (e.g. /color #ff0000)")),
        },
        "/dice" => Ok(Command::Dice),
        "/coin" => Ok(Command::Coin),
        "/help" => Ok(Command::Help),
        _ => return None,
    };
    Some(cmd)
}

fn usage(form: &str) -> ChatError {
    ChatError::validation(format!("Usage: {form}"))
}

fn one_target(args: &[&str], form: &str) -> Result<String, ChatError> {
    match args {
        [target] => Ok(target.to_string()),
        _ => Err(usage(form)),
    }
}

fn parse_positive(arg: &str) -> Result<u64, ChatError> {
    match arg.parse::<u64>() {
        Ok(n) if n > MAX_MUTE_SECS => Err(ChatError::validation(format!(
            "Duration must be at most {MAX_MUTE_SECS} seconds"
        ))),
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ChatError::validation("Duration must be a positive whole number of seconds")),
    }
}

/// Run a parsed command on behalf of `conn`.
pub async fn execute(
    state: &SharedState,
    conn: ConnId,
    session: &mut Session,
    cmd: Command,
) -> CommandOutcome {
    let me = session.account.display_name.clone();

    if cmd.requires_admin() {
        let still_admin = state
            .sessions
            .lock()
            .binding(conn)
            .is_some_and(|b| b.identity == me && b.admin);
        if !still_admin {
            return CommandOutcome::Error(ChatError::permission("This command is for admins only"));
        }
    }

    match cmd {
        Command::DeleteAll => {
            state.log.delete_all().await;
            state.broadcast(Event::AllDeleted);
            tracing::info!(admin = %me, "All messages deleted");
            CommandOutcome::System(format!("{me} deleted all messages"))
        }

        Command::Mute { target, secs } => {
            if !state.sessions.lock().is_online(&target) {
                return not_online(&target);
            }
            let applied = state
                .moderation
                .lock()
                .mute(&target, Duration::from_secs(secs), Instant::now());
            if !applied {
                return CommandOutcome::Error(ChatError::validation("Mute duration is too long"));
            }
            tracing::info!(admin = %me, %target, secs, "User muted");
            CommandOutcome::System(format!("{target} has been muted for {secs} seconds"))
        }

        Command::Unmute { target } => {
            if state.moderation.lock().unmute(&target, Instant::now()) {
                tracing::info!(admin = %me, %target, "User unmuted");
                CommandOutcome::System(format!("{target} has been unmuted"))
            } else {
                CommandOutcome::Error(ChatError::state(format!("{target} is not muted")))
            }
        }

        Command::Ban { target } => ban(state, &me, &target).await,

        Command::Unban { target } => {
            if !state.moderation.lock().unban(&target) {
                return CommandOutcome::Error(ChatError::state(format!("{target} is not banned")));
            }
            if let Err(e) = state.bans.remove_ban(&target).await {
                tracing::warn!(%target, "Failed to persist unban: {e}");
            }
            tracing::info!(admin = %me, %target, "User unbanned");
            CommandOutcome::System(format!("{target} has been unbanned"))
        }

        Command::PrivateMessage { target, body } => {
            if target == me {
                return CommandOutcome::Error(ChatError::state(
                    "You cannot send a private message to yourself",
                ));
            }
            if !state.sessions.lock().is_online(&target) {
                return not_online(&target);
            }
            state.send_to_identity(
                &target,
                Event::PrivateMessage {
                    from: me.clone(),
                    message: body.clone(),
                    color: session.account.color.clone(),
                },
            );
            CommandOutcome::Private(Event::PrivateMessageSent { to: target, message: body })
        }

        Command::Omikuji => {
            let (result, message) = FORTUNES[rand::thread_rng().gen_range(0..FORTUNES.len())];
            persona_result(OMIKUJI_PERSONA, "drew an omikuji 🎴", format!("[{result}] {message}"))
        }

        Command::Dice => {
            let roll: u8 = rand::thread_rng().gen_range(1..=6);
            persona_result(DICE_PERSONA, "rolled a die 🎲", format!("🎲 rolled a {roll}!"))
        }

        Command::Coin => {
            let face = if rand::thread_rng().gen_bool(0.5) { "heads" } else { "tails" };
            persona_result(COIN_PERSONA, "tossed a coin 🪙", format!("🪙 {face}!"))
        }

        Command::Color { color } => {
            let update = ProfileUpdate {
                color: Some(color.clone()),
                ..Default::default()
            };
            match state.directory.update_profile(&me, update).await {
                Ok(account) => {
                    session.account = Account {
                        token: session.account.token.take(),
                        ..account.clone()
                    };
                    state.send_to(conn, Outbound::Event(Event::ProfileUpdated { account }));
                    CommandOutcome::System(format!("{me} changed their name color to {color}"))
                }
                Err(e) => {
                    tracing::warn!(username = %me, "Color change failed: {e}");
                    CommandOutcome::Error(e)
                }
            }
        }

        Command::Help => CommandOutcome::Private(Event::notice(help_text(session.admin))),
    }
}

async fn ban(state: &SharedState, me: &str, target: &str) -> CommandOutcome {
    let evicted = match state.ban_and_unbind(target) {
        Ok(conns) => conns,
        Err(e) => return CommandOutcome::Error(e),
    };

    let notice = Event::Banned {
        message: "You have been banned from the chat by an admin".to_string(),
    };
    for c in &evicted {
        state.send_to(*c, Outbound::Event(notice.clone()));
        state.send_to(*c, Outbound::Close);
        state.connections.lock().remove(c);
    }
    state.statuses.lock().remove(target);
    crate::presence::announce_leave(state, target);
    tracing::info!(admin = %me, %target, connections = evicted.len(), "User banned");

    let row = BanRow {
        display_name: target.to_string(),
        set_by: me.to_string(),
        set_at: chrono::Utc::now().timestamp() as u64,
    };
    if let Err(e) = state.bans.save_ban(&row).await {
        tracing::warn!(%target, "Failed to persist ban: {e}");
    }

    CommandOutcome::System(format!("{target} has been banned from the chat"))
}

fn not_online(target: &str) -> CommandOutcome {
    CommandOutcome::Error(ChatError::state(format!("{target} is not online")))
}

fn persona_result(persona: (&str, &str), user_message: &str, result: String) -> CommandOutcome {
    CommandOutcome::CommandResult {
        user_message: user_message.to_string(),
        result_sender: persona.0.to_string(),
        result_color: persona.1.to_string(),
        result_message: result,
    }
}

fn help_text(admin: bool) -> String {
    let mut text = String::from(
        "Commands:\n\
         /omi - draw an omikuji fortune\n\
         /color #hex - change your name color\n\
         /dice - roll a die\n\
         /coin - toss a coin\n\
         /prm <user> <message> - send a private message\n\
         /help - show this help",
    );
    if admin {
        text.push_str(
            "\n\nAdmin only:\n\
             /delete - delete all messages\n\
             /mute <user> <seconds> - mute a user\n\
             /unmute <user> - lift a mute\n\
             /ban <user> - remove a user from the chat\n\
             /unban <user> - lift a ban",
        );
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(text: &str) -> Command {
        parse(text).unwrap().unwrap()
    }

    #[test]
    fn known_commands() {
        assert_eq!(parsed("/delete"), Command::DeleteAll);
        assert_eq!(parsed("/DICE"), Command::Dice);
        assert_eq!(parsed("/omi"), Command::Omikuji);
        assert_eq!(parsed("/omikuji"), Command::Omikuji);
        assert_eq!(parsed("/coin"), Command::Coin);
        assert_eq!(parsed("/help"), Command::Help);
        assert_eq!(
            parsed("/mute  bob#1   30"),
            Command::Mute { target: "bob#1".into(), secs: 30 }
        );
        assert_eq!(parsed("/color #FFF"), Command::Color { color: "#FFF".into() });
    }

    #[test]
    fn mute_duration_is_capped() {
        assert_eq!(
            parsed(&format!("/mute bob#1 {MAX_MUTE_SECS}")),
            Command::Mute { target: "bob#1".into(), secs: MAX_MUTE_SECS }
        );
        for secs in [MAX_MUTE_SECS + 1, u64::MAX] {
            assert!(matches!(
                parse(&format!("/mute bob#1 {secs}")),
                Some(Err(ChatError::Validation(_)))
            ));
        }
        assert!(matches!(
            parse("/mute bob#1 99999999999999999999999"),
            Some(Err(ChatError::Validation(_)))
        ));
    }

    #[test]
    fn private_message_body_is_rejoined() {
        assert_eq!(
            parsed("/prm bob#1  see   you\tsoon"),
            Command::PrivateMessage { target: "bob#1".into(), body: "see you soon".into() }
        );
    }

    #[test]
    fn unknown_command_is_none() {
        assert!(parse("/shrug").is_none());
        assert!(parse("   ").is_none());
    }

    #[test]
    fn bad_arguments() {
        for text in ["/mute bob#1", "/mute bob#1 0", "/mute bob#1 -5", "/mute bob#1 soon", "/ban", "/prm bob#1", "/color", "/color red"] {
            assert!(
                matches!(parse(text), Some(Err(ChatError::Validation(_)))),
                "{text} should be a validation error"
            );
        }
    }

    #[test]
    fn admin_commands() {
        assert!(parsed("/ban x").requires_admin());
        assert!(parsed("/unban x").requires_admin());
        assert!(!parsed("/prm x hi").requires_admin());
        assert!(!parsed("/color #000").requires_admin());
    }

    #[test]
    fn help_has_admin_section_only_for_admins() {
        assert!(!help_text(false).contains("/ban"));
        assert!(help_text(true).contains("/ban"));
    }
}
