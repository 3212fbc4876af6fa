//! Session registry: which identities are online and through which connections.
//!
//! An identity is online iff it has at least one live connection. Empty
//! entries are removed eagerly so the roster never lists a ghost.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    pub fn next() -> Self {
        Self(CONN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub identity: String,
    /// Captured from the authenticated account at bind time.
    pub admin: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<String, BTreeSet<ConnId>>,
    bindings: HashMap<ConnId, Binding>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to `identity`. Returns true if this is the identity's
    /// first live connection. Re-registering the same pair is a no-op.
    pub fn register(&mut self, identity: &str, conn: ConnId, admin: bool) -> bool {
        // A connection belongs to one identity at a time.
        let rebound = self
            .bindings
            .get(&conn)
            .filter(|b| b.identity != identity)
            .map(|b| b.identity.clone());
        if let Some(old) = rebound {
            self.deregister(&old, conn);
        }

        let set = self.sessions.entry(identity.to_string()).or_default();
        let first = set.is_empty();
        set.insert(conn);
        self.bindings.insert(
            conn,
            Binding {
                identity: identity.to_string(),
                admin,
            },
        );
        first
    }

    /// Unbind `conn` from `identity`. Returns true if that was the identity's
    /// last connection. Unknown pairs return false.
    pub fn deregister(&mut self, identity: &str, conn: ConnId) -> bool {
        let Some(set) = self.sessions.get_mut(identity) else {
            return false;
        };
        if !set.remove(&conn) {
            return false;
        }
        if self.bindings.get(&conn).is_some_and(|b| b.identity == identity) {
            self.bindings.remove(&conn);
        }
        if set.is_empty() {
            self.sessions.remove(identity);
            true
        } else {
            false
        }
    }

    /// Drop whatever `conn` was bound to. Returns the identity and whether
    /// it just went offline.
    pub fn remove_connection(&mut self, conn: ConnId) -> Option<(String, bool)> {
        let identity = self.bindings.get(&conn)?.identity.clone();
        let last = self.deregister(&identity, conn);
        Some((identity, last))
    }

    /// Online identities in lexicographic order.
    pub fn list_online(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn connections_of(&self, identity: &str) -> Vec<ConnId> {
        self.sessions
            .get(identity)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn binding(&self, conn: ConnId) -> Option<&Binding> {
        self.bindings.get(&conn)
    }

    pub fn has_admin_connection(&self, identity: &str) -> bool {
        self.sessions.get(identity).is_some_and(|set| {
            set.iter()
                .any(|c| self.bindings.get(c).is_some_and(|b| b.admin))
        })
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn first_and_last_connection() {
        let mut reg = SessionRegistry::new();
        let (a, b) = (ConnId::next(), ConnId::next());

        assert!(reg.register("alice#1", a, false));
        assert!(!reg.register("alice#1", b, false));
        assert_eq!(reg.connections_of("alice#1").len(), 2);

        assert!(!reg.deregister("alice#1", a));
        assert!(reg.is_online("alice#1"));
        assert!(reg.deregister("alice#1", b));
        assert!(!reg.is_online("alice#1"));
        assert!(reg.list_online().is_empty());
    }

    #[test]
    fn duplicate_calls_are_idempotent() {
        let mut reg = SessionRegistry::new();
        let a = ConnId::next();
        assert!(reg.register("bob#1", a, false));
        assert!(!reg.register("bob#1", a, false));
        assert_eq!(reg.connections_of("bob#1"), vec![a]);

        assert!(reg.deregister("bob#1", a));
        assert!(!reg.deregister("bob#1", a));
        assert!(!reg.deregister("nobody", a));
    }

    #[test]
    fn roster_is_sorted() {
        let mut reg = SessionRegistry::new();
        reg.register("zed#1", ConnId::next(), false);
        reg.register("amy#1", ConnId::next(), false);
        reg.register("kim#1", ConnId::next(), false);
        assert_eq!(reg.list_online(), vec!["amy#1", "kim#1", "zed#1"]);
        assert_eq!(reg.online_count(), 3);
    }

    #[test]
    fn remove_connection_by_id() {
        let mut reg = SessionRegistry::new();
        let (a, b) = (ConnId::next(), ConnId::next());
        reg.register("carol#1", a, false);
        reg.register("carol#1", b, false);

        assert_eq!(reg.remove_connection(a), Some(("carol#1".to_string(), false)));
        assert_eq!(reg.remove_connection(a), None);
        assert_eq!(reg.remove_connection(b), Some(("carol#1".to_string(), true)));
    }

    #[test]
    fn admin_flag_is_per_connection() {
        let mut reg = SessionRegistry::new();
        let (a, b) = (ConnId::next(), ConnId::next());
        reg.register("root", a, true);
        reg.register("alice#1", b, false);

        assert!(reg.has_admin_connection("root"));
        assert!(!reg.has_admin_connection("alice#1"));
        assert!(reg.binding(a).unwrap().admin);

        reg.deregister("root", a);
        assert!(!reg.has_admin_connection("root"));
        assert!(reg.binding(a).is_none());
    }

    #[test]
    fn online_iff_nonempty_under_random_sequences() {
        let names = ["a", "b", "c", "d"];
        let conns: Vec<ConnId> = (0..8).map(|_| ConnId::next()).collect();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut reg = SessionRegistry::new();
            let mut model: HashMap<ConnId, &str> = HashMap::new();

            for _ in 0..200 {
                let conn = conns[rng.gen_range(0..conns.len())];
                if rng.gen_bool(0.5) {
                    let name = names[rng.gen_range(0..names.len())];
                    let was_online = model.values().any(|n| *n == name);
                    let first = reg.register(name, conn, false);
                    model.insert(conn, name);
                    assert_eq!(first, !was_online);
                } else if let Some(name) = model.get(&conn).copied() {
                    let last = reg.deregister(name, conn);
                    model.remove(&conn);
                    assert_eq!(last, !model.values().any(|n| *n == name));
                } else {
                    assert!(reg.remove_connection(conn).is_none());
                }

                for name in names {
                    let expected: usize = model.values().filter(|n| **n == name).count();
                    assert_eq!(reg.is_online(name), expected > 0);
                    assert_eq!(reg.connections_of(name).len(), expected);
                }
                let mut online: Vec<&str> = model.values().copied().collect();
                online.sort();
                online.dedup();
                assert_eq!(reg.list_online(), online);
            }
        }
    }
}
