//! Inbound message envelope and the bodies the daemon core understands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ferrofs_types::{BeaconSeq, Epoch, GlobalId, Rank};

use crate::common::EntityName;
use crate::mds_map::{DaemonState, MdsMap};

/// A message together with its authenticated source.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub source: EntityName,
    pub msg: Message,
}

impl MessageEnvelope {
    pub fn new(source: EntityName, msg: Message) -> Self {
        Self { source, msg }
    }
}

/// Everything the dispatch router can receive.
///
/// The first five variants form the core message table handled by the
/// daemon itself; the rest are rank-local and forwarded to the rank
/// dispatcher.
#[derive(Debug, Clone)]
pub enum Message {
    /// Monitor membership update; consumed for subscription bookkeeping.
    MonMap { epoch: Epoch },
    /// A new cluster map.
    MdsMap { map: MdsMap },
    /// Legacy monitor command: a bare vector of words.
    MonCommand { args: Vec<String> },
    /// Structured command with a transaction id for the reply.
    Command { tid: u64, request: CommandRequest },
    /// Object-store map update notification.
    OsdMap { epoch: Epoch },
    /// Reply to a structured command, correlated by `tid`.
    CommandReply { tid: u64, result: CommandResult },

    /// Client metadata request, handled by the rank-local server.
    ClientRequest { op: String },
    /// Client session control (open/close/renew).
    ClientSession { op: String },
    /// Peer-MDS cache message (resolve, cache expire, lock, migration).
    PeerCache { op: String },
    /// Peer-MDS balancer traffic.
    PeerBalancer { op: String },
}

impl Message {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::MonMap { .. } => "mon_map",
            Message::MdsMap { .. } => "mds_map",
            Message::MonCommand { .. } => "mon_command",
            Message::Command { .. } => "command",
            Message::OsdMap { .. } => "osd_map",
            Message::CommandReply { .. } => "command_reply",
            Message::ClientRequest { .. } => "client_request",
            Message::ClientSession { .. } => "client_session",
            Message::PeerCache { .. } => "peer_cache",
            Message::PeerBalancer { .. } => "peer_balancer",
        }
    }
}

/// A structured administrative command: a prefix plus named arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    pub prefix: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

impl CommandRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            args: serde_json::Map::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.args.get(key).and_then(Value::as_i64)
    }
}

/// Outcome of a command: errno-style return code, human-readable
/// message, and structured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub return_code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            return_code: 0,
            message: String::new(),
            data,
        }
    }

    pub fn err(return_code: i32, message: impl Into<String>) -> Self {
        Self {
            return_code,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == 0
    }
}

/// One entry of the machine-readable command catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDescription {
    /// Signature with typed argument slots, e.g.
    /// `"session evict name=client_id,type=int"`.
    pub cmd: String,
    pub help: String,
    pub module: String,
    pub perm: String,
    pub availability: String,
}

/// A single health observation included in a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMetric {
    pub kind: String,
    pub message: String,
}

/// Health snapshot advertised to the monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub metrics: Vec<HealthMetric>,
}

/// Periodic liveness + desired-state message to the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconMsg {
    pub name: String,
    pub global_id: GlobalId,
    pub seq: BeaconSeq,
    pub want_state: DaemonState,
    pub map_epoch: Epoch,
    pub standby_for_rank: Rank,
    pub standby_for_name: String,
    pub health: HealthReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_request_args() {
        let req = CommandRequest::new("session evict").arg("client_id", "4100");
        assert_eq!(req.prefix, "session evict");
        assert_eq!(req.get_str("client_id"), Some("4100"));
        assert_eq!(req.get_i64("client_id"), None);

        let req = CommandRequest::new("osdmap barrier").arg("target_epoch", 42);
        assert_eq!(req.get_i64("target_epoch"), Some(42));
    }

    #[test]
    fn test_command_request_json_roundtrip() {
        let req = CommandRequest::new("export dir")
            .arg("path", "/a/b")
            .arg("rank", 2);
        let json = serde_json::to_string(&req).unwrap();
        let parsed: CommandRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.prefix, "export dir");
        assert_eq!(parsed.get_str("path"), Some("/a/b"));
        assert_eq!(parsed.get_i64("rank"), Some(2));
    }

    #[test]
    fn test_command_result() {
        let ok = CommandResult::ok(serde_json::json!({"state": "active"}));
        assert!(ok.is_ok());
        assert_eq!(ok.data["state"], "active");

        let err = CommandResult::err(-1, "permission denied");
        assert!(!err.is_ok());
        assert_eq!(err.message, "permission denied");
    }

    #[test]
    fn test_message_type_names() {
        let m = Message::OsdMap { epoch: Epoch(3) };
        assert_eq!(m.type_name(), "osd_map");
        let m = Message::MonCommand { args: vec![] };
        assert_eq!(m.type_name(), "mon_command");
    }
}
