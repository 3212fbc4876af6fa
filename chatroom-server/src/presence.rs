//! Join and leave announcements derived from registry transitions.

use std::collections::BTreeMap;

use crate::protocol::Event;
use crate::registry::ConnId;
use crate::server::SharedState;

/// Online roster and status texts, read after any registration in flight.
pub fn roster(state: &SharedState) -> (Vec<String>, BTreeMap<String, String>) {
    let users = state.sessions.lock().list_online();
    let statuses = state.statuses.lock();
    let user_statuses = users
        .iter()
        .filter_map(|u| statuses.get(u).map(|s| (u.clone(), s.clone())))
        .collect();
    (users, user_statuses)
}

/// Tell everyone except the joining connection that `identity` came online.
pub fn announce_join(state: &SharedState, joined_via: ConnId, identity: &str) {
    let users = state.sessions.lock().list_online();
    tracing::info!(username = %identity, online = users.len(), "User joined");
    state.broadcast_except(
        joined_via,
        Event::Join {
            username: identity.to_string(),
            user_count: users.len(),
            users,
        },
    );
}

/// Tell every connection that `identity` went offline.
pub fn announce_leave(state: &SharedState, identity: &str) {
    let users = state.sessions.lock().list_online();
    tracing::info!(username = %identity, online = users.len(), "User left");
    state.broadcast(Event::Leave {
        username: identity.to_string(),
        user_count: users.len(),
        users,
    });
}
