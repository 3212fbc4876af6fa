//! Profile updates (color, theme, status text).

use serde_json::json;

use super::{Connection, Phase};
use crate::directory::{Account, ProfileUpdate};
use crate::protocol::Event;

pub(super) async fn handle_update_profile(
    conn: &mut Connection,
    seq: Option<u64>,
    update: ProfileUpdate,
) {
    let Some(session) = conn.session() else {
        return;
    };
    let me = session.account.display_name.clone();
    let new_status = update.status_text.clone();

    let account = match conn.state.directory.update_profile(&me, update).await {
        Ok(account) => account,
        Err(e) => {
            tracing::warn!(conn = %conn.id, username = %me, "Profile update failed: {e}");
            conn.reply_err(seq, &e);
            return;
        }
    };

    if let Phase::Authenticated(ref mut session) = conn.phase {
        session.account = Account {
            token: session.account.token.take(),
            ..account.clone()
        };
    }

    if let Some(status_text) = new_status {
        {
            let mut statuses = conn.state.statuses.lock();
            if status_text.is_empty() {
                statuses.remove(&me);
            } else {
                statuses.insert(me.clone(), status_text.clone());
            }
        }
        conn.state.broadcast(Event::StatusUpdate {
            username: me,
            status_text,
        });
    }

    conn.reply_with(seq, &json!({ "account": account }));
}
