//! Mute and ban state.
//!
//! Mutes are timed and cleared lazily on the next send attempt after
//! expiry. Bans last until an explicit unban and do not depend on whether
//! the identity is online.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct Moderation {
    mutes: HashMap<String, Instant>,
    bans: HashSet<String>,
}

impl Moderation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ban set (startup load).
    pub fn load_bans<I: IntoIterator<Item = String>>(&mut self, names: I) {
        self.bans = names.into_iter().collect();
    }

    /// `Err(remaining_secs)` if `identity` is still muted at `now`, rounded
    /// up to whole seconds. An expired entry is removed.
    pub fn check_mute(&mut self, identity: &str, now: Instant) -> Result<(), u64> {
        let Some(&expiry) = self.mutes.get(identity) else {
            return Ok(());
        };
        if now >= expiry {
            self.mutes.remove(identity);
            return Ok(());
        }
        let left = expiry - now;
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        Err(secs)
    }

    /// Returns false, leaving any existing mute alone, if the expiry is not
    /// representable.
    pub fn mute(&mut self, identity: &str, duration: Duration, now: Instant) -> bool {
        let Some(expiry) = now.checked_add(duration) else {
            return false;
        };
        self.mutes.insert(identity.to_string(), expiry);
        true
    }

    /// Returns false if `identity` was not muted (or the mute had lapsed).
    pub fn unmute(&mut self, identity: &str, now: Instant) -> bool {
        match self.mutes.remove(identity) {
            Some(expiry) => expiry > now,
            None => false,
        }
    }

    /// Returns false if already banned.
    pub fn ban(&mut self, identity: &str) -> bool {
        self.bans.insert(identity.to_string())
    }

    /// Returns false if not banned.
    pub fn unban(&mut self, identity: &str) -> bool {
        self.bans.remove(identity)
    }

    pub fn is_banned(&self, identity: &str) -> bool {
        self.bans.contains(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_expires_lazily() {
        let mut m = Moderation::new();
        let t0 = Instant::now();
        assert!(m.mute("bob#1", Duration::from_secs(2), t0));

        assert_eq!(m.check_mute("bob#1", t0 + Duration::from_millis(500)), Err(2));
        assert_eq!(m.check_mute("bob#1", t0 + Duration::from_millis(1000)), Err(1));
        assert_eq!(m.check_mute("bob#1", t0 + Duration::from_millis(1001)), Err(1));
        assert_eq!(m.check_mute("bob#1", t0 + Duration::from_secs(2)), Ok(()));
        // Entry is gone; unmute now reports not muted.
        assert!(!m.unmute("bob#1", t0 + Duration::from_secs(2)));
    }

    #[test]
    fn unmute_only_when_muted() {
        let mut m = Moderation::new();
        let t0 = Instant::now();
        assert!(!m.unmute("carol#1", t0));
        assert!(m.mute("carol#1", Duration::from_secs(60), t0));
        assert!(m.unmute("carol#1", t0));
        assert_eq!(m.check_mute("carol#1", t0), Ok(()));
    }

    #[test]
    fn unrepresentable_expiry_is_refused() {
        let mut m = Moderation::new();
        let t0 = Instant::now();
        assert!(!m.mute("bob#1", Duration::from_secs(u64::MAX), t0));
        assert_eq!(m.check_mute("bob#1", t0), Ok(()));

        assert!(m.mute("bob#1", Duration::from_secs(5), t0));
        assert!(!m.mute("bob#1", Duration::MAX, t0));
        assert_eq!(m.check_mute("bob#1", t0), Err(5));
    }

    #[test]
    fn ban_is_independent_of_mute() {
        let mut m = Moderation::new();
        assert!(m.ban("eve#1"));
        assert!(!m.ban("eve#1"));
        assert!(m.is_banned("eve#1"));
        assert_eq!(m.check_mute("eve#1", Instant::now()), Ok(()));
        assert!(m.unban("eve#1"));
        assert!(!m.unban("eve#1"));
        assert!(!m.is_banned("eve#1"));
    }

    #[test]
    fn load_replaces_ban_set() {
        let mut m = Moderation::new();
        m.ban("old#1");
        m.load_bans(vec!["eve#1".to_string()]);
        assert!(m.is_banned("eve#1"));
        assert!(!m.is_banned("old#1"));
    }
}
