//! Client/peer sessions and the capability model attached to them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{Value, json};

use ferrofs_proto::{Address, EntityName, Message};

use crate::subsystems::Connection;

/// One grant parsed from a capability string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapGrant {
    pub read: bool,
    pub write: bool,
    /// Restrict the grant to a path prefix; `None` grants everywhere.
    pub path: Option<String>,
}

/// Capabilities attached to an authenticated session.
///
/// `allow_all` additionally grants administrative `tell` access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdsAuthCaps {
    grants: Vec<CapGrant>,
    allow_all: bool,
}

impl MdsAuthCaps {
    /// Legacy caps for peers whose authorizer carried no capability
    /// string: every filesystem op is permitted, `tell` is not.
    pub fn legacy() -> Self {
        Self {
            grants: vec![CapGrant {
                read: true,
                write: true,
                path: None,
            }],
            allow_all: false,
        }
    }

    /// Parse a capability string such as `"allow *"`,
    /// `"allow rw"`, or `"allow r path=/archive, allow rw path=/home"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut caps = Self::default();
        for clause in s.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let mut tokens = clause.split_whitespace();
            if tokens.next() != Some("allow") {
                return Err(format!("expected 'allow' in clause '{}'", clause));
            }
            let spec = tokens
                .next()
                .ok_or_else(|| format!("missing spec in clause '{}'", clause))?;
            if spec == "*" {
                caps.allow_all = true;
                caps.grants.push(CapGrant {
                    read: true,
                    write: true,
                    path: None,
                });
                continue;
            }
            let read = spec.contains('r');
            let write = spec.contains('w');
            if !read && !write {
                return Err(format!("unknown spec '{}' in clause '{}'", spec, clause));
            }
            let mut path = None;
            for tok in tokens {
                match tok.split_once('=') {
                    Some(("path", p)) => path = Some(p.to_string()),
                    _ => return Err(format!("unknown token '{}' in clause '{}'", tok, clause)),
                }
            }
            caps.grants.push(CapGrant { read, write, path });
        }
        if caps.grants.is_empty() {
            return Err("empty capability string".into());
        }
        Ok(caps)
    }

    pub fn allow_all(&self) -> bool {
        self.allow_all
    }

    pub fn set_allow_all(&mut self) {
        self.allow_all = true;
    }

    fn grant_applies(grant: &CapGrant, path: &str) -> bool {
        match &grant.path {
            None => true,
            Some(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    pub fn may_read(&self, path: &str) -> bool {
        self.grants
            .iter()
            .any(|g| g.read && Self::grant_applies(g, path))
    }

    pub fn may_write(&self, path: &str) -> bool {
        self.grants
            .iter()
            .any(|g| g.write && Self::grant_applies(g, path))
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// A per-peer identity attached to a connection.
pub struct Session {
    pub name: EntityName,
    pub addr: Address,
    pub caps: MdsAuthCaps,
    /// Bound only by the connection attempt that wins the accept race.
    pub connection: Option<Arc<dyn Connection>>,
    /// Messages queued before the connection was fully accepted,
    /// delivered FIFO on accept.
    pub preopen_out_queue: VecDeque<Message>,
    pub state: SessionState,
    pub num_caps: usize,
    pub num_leases: usize,
    pub completed_requests: u64,
    pub request_count: u64,
    pub client_metadata: HashMap<String, String>,
}

impl Session {
    pub fn new(name: EntityName, addr: Address) -> Self {
        Self {
            name,
            addr,
            caps: MdsAuthCaps::legacy(),
            connection: None,
            preopen_out_queue: VecDeque::new(),
            state: SessionState::Open,
            num_caps: 0,
            num_leases: 0,
            completed_requests: 0,
            request_count: 0,
            client_metadata: HashMap::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Queue a message for delivery once the connection is accepted, or
    /// send immediately when one is already bound.
    pub fn send_message(&mut self, msg: Message) {
        match &self.connection {
            Some(con) => con.send_message(msg),
            None => self.preopen_out_queue.push_back(msg),
        }
    }

    /// JSON summary for `session ls`.
    pub fn dump(&self, in_clientreplay: bool, reconnecting: bool) -> Value {
        json!({
            "id": *self.name.global_id,
            "state": self.state.name(),
            "num_caps": self.num_caps,
            "num_leases": self.num_leases,
            "replay_requests": if in_clientreplay { self.request_count } else { 0 },
            "completed_requests": self.completed_requests,
            "reconnecting": reconnecting,
            "inst": format!("{} {}", self.name, self.addr),
            "client_metadata": &self.client_metadata,
        })
    }
}

/// The session table, keyed by `(peer_type, global_id)`. Mutated only
/// under the process-wide lock.
#[derive(Default)]
pub struct SessionMap {
    sessions: HashMap<EntityName, Session>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: EntityName) -> Option<&Session> {
        self.sessions.get(&name)
    }

    pub fn get_mut(&mut self, name: EntityName) -> Option<&mut Session> {
        self.sessions.get_mut(&name)
    }

    pub fn get_or_create(&mut self, name: EntityName, addr: Address) -> &mut Session {
        self.sessions
            .entry(name)
            .or_insert_with(|| Session::new(name, addr))
    }

    pub fn remove(&mut self, name: EntityName) -> Option<Session> {
        self.sessions.remove(&name)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, name: EntityName) -> bool {
        self.sessions.contains_key(&name)
    }

    pub fn client_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.name.is_client())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrofs_types::GlobalId;

    #[test]
    fn test_caps_allow_all() {
        let caps = MdsAuthCaps::parse("allow *").unwrap();
        assert!(caps.allow_all());
        assert!(caps.may_read("/anything"));
        assert!(caps.may_write("/anything"));
    }

    #[test]
    fn test_caps_rw() {
        let caps = MdsAuthCaps::parse("allow rw").unwrap();
        assert!(!caps.allow_all());
        assert!(caps.may_read("/x"));
        assert!(caps.may_write("/x"));
    }

    #[test]
    fn test_caps_path_restriction() {
        let caps = MdsAuthCaps::parse("allow r path=/archive, allow rw path=/home").unwrap();
        assert!(caps.may_read("/archive/old"));
        assert!(!caps.may_write("/archive/old"));
        assert!(caps.may_write("/home/alice"));
        assert!(!caps.may_read("/etc"));
        assert!(!caps.allow_all());
    }

    #[test]
    fn test_caps_parse_errors() {
        assert!(MdsAuthCaps::parse("").is_err());
        assert!(MdsAuthCaps::parse("deny rw").is_err());
        assert!(MdsAuthCaps::parse("allow").is_err());
        assert!(MdsAuthCaps::parse("allow x").is_err());
        assert!(MdsAuthCaps::parse("allow rw gibberish").is_err());
    }

    #[test]
    fn test_caps_legacy() {
        let caps = MdsAuthCaps::legacy();
        assert!(!caps.allow_all());
        assert!(caps.may_read("/"));
        assert!(caps.may_write("/"));
    }

    #[test]
    fn test_session_map_keys() {
        let mut map = SessionMap::new();
        let c1 = EntityName::client(GlobalId(1));
        let m1 = EntityName::mds(GlobalId(1));
        map.get_or_create(c1, Address::default());
        map.get_or_create(m1, Address::default());
        assert_eq!(map.len(), 2);
        assert_eq!(map.client_sessions().count(), 1);

        // Repeated lookup resolves to the same session.
        map.get_mut(c1).unwrap().num_caps = 7;
        assert_eq!(map.get_or_create(c1, Address::default()).num_caps, 7);
    }

    #[test]
    fn test_session_preopen_queue() {
        let mut s = Session::new(EntityName::client(GlobalId(9)), Address::default());
        s.send_message(Message::ClientSession { op: "open".into() });
        s.send_message(Message::ClientSession { op: "renew".into() });
        assert_eq!(s.preopen_out_queue.len(), 2);
        // FIFO order preserved.
        match s.preopen_out_queue.front().unwrap() {
            Message::ClientSession { op } => assert_eq!(op, "open"),
            other => panic!("unexpected message {:?}", other.type_name()),
        }
    }

    #[test]
    fn test_session_dump() {
        let mut s = Session::new(EntityName::client(GlobalId(42)), Address::default());
        s.num_caps = 3;
        s.request_count = 5;
        s.client_metadata.insert("hostname".into(), "box-1".into());

        let v = s.dump(true, false);
        assert_eq!(v["id"], 42);
        assert_eq!(v["state"], "open");
        assert_eq!(v["num_caps"], 3);
        assert_eq!(v["replay_requests"], 5);

        let v = s.dump(false, true);
        assert_eq!(v["replay_requests"], 0);
        assert_eq!(v["reconnecting"], true);
    }
}
