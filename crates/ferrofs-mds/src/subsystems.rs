//! Named interfaces to the daemon's collaborators.
//!
//! The metadata cache, migrator, balancer, snap table client/server,
//! object-store client, monitor client, and messenger are their own
//! serialized domains; the daemon core drives them through these traits
//! while holding the process-wide lock. The in-memory implementations
//! used by the server binary and the tests live in [`crate::stubs`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use ferrofs_proto::{Address, BeaconMsg, EntityName, FeatureSet, Message, MessageEnvelope};
use ferrofs_types::{Epoch, Incarnation, Rank, Result, SegmentSeq};

/// Completion handed to a sub-system; fired with 0 on success or a
/// negative errno on failure.
pub type MdsWaiter = oneshot::Sender<i32>;

/// Fire a batch of waiters with the given code.
pub fn queue_waiters(waiters: Vec<MdsWaiter>, code: i32) {
    for w in waiters {
        // A dropped receiver just means nobody is listening any more.
        let _ = w.send(code);
    }
}

/// A directory fragment identifier, printed as `value/bits` with the
/// value in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FragId {
    pub value: u32,
    pub bits: u8,
}

impl FragId {
    pub const ROOT: FragId = FragId { value: 0, bits: 0 };
}

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{}", self.value, self.bits)
    }
}

impl FromStr for FragId {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let (value_str, bits_str) = s.split_once('/').ok_or(())?;
        let value = u32::from_str_radix(value_str, 16).map_err(|_| ())?;
        let bits: u8 = bits_str.parse().map_err(|_| ())?;
        Ok(FragId { value, bits })
    }
}

/// One authoritative subtree, as reported by `get subtrees`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtreeInfo {
    pub path: String,
    pub is_auth: bool,
    pub auth_first: Rank,
    pub auth_second: Rank,
}

/// The metadata cache: inode/dentry graph, subtree bookkeeping, and the
/// per-state entry actions of the recovery sequence.
pub trait MetadataCache: Send + Sync {
    fn is_readonly(&self) -> bool;
    fn force_readonly(&mut self);

    /// Whether the path resolves to a cached inode.
    fn path_in_cache(&self, path: &str) -> bool;

    /// Whether we are authoritative for the fragment; `None` when the
    /// fragment is not in cache.
    fn dir_is_auth(&self, path: &str, frag: FragId) -> Option<bool>;

    /// All fragments that may exist under the directory, per its
    /// fragment tree (not just those in cache).
    fn dir_frags(&self, path: &str) -> Option<Vec<FragId>>;

    fn split_dir(&mut self, path: &str, frag: FragId, bits: i32) -> Result<()>;
    fn merge_dir(&mut self, path: &str, frag: FragId) -> Result<()>;

    /// Scrub the subtree rooted at `path`; `done` fires on completion.
    fn scrub_path(&mut self, path: &str, done: MdsWaiter);

    /// Write back the dentry at `path`; `done` fires on completion.
    fn flush_path(&mut self, path: &str, done: MdsWaiter);

    fn list_subtrees(&self) -> Vec<SubtreeInfo>;

    /// Dump the in-memory cache, to the returned value or to `file`.
    fn dump(&self, file: Option<&str>) -> Value;

    // Entry actions, invoked once on entering the corresponding state.
    fn boot_create(&mut self);
    fn boot_start(&mut self);
    fn replay_start(&mut self);
    fn resolve_start(&mut self);
    fn reconnect_start(&mut self);
    fn rejoin_start(&mut self);
    fn clientreplay_start(&mut self);
    fn active_start(&mut self);
    fn stopping_start(&mut self);

    /// Called when recovery completes (entering Active or ClientReplay
    /// from Creating, Rejoin, or Reconnect).
    fn recovery_done(&mut self, oldstate: ferrofs_proto::DaemonState);

    // Peer transitions.
    fn handle_peer_failure(&mut self, rank: Rank);
    fn handle_peer_recovery(&mut self, rank: Rank);
    fn kick_discovers(&mut self, rank: Rank);
    fn send_resolves(&mut self);
    fn rejoin_joint_start(&mut self);
    fn notify_map_changed(&mut self, epoch: Epoch);

    // Periodic maintenance.
    fn trim(&mut self);
    fn trim_client_leases(&mut self);
    fn check_memory_usage(&mut self);
    fn find_stale_fragment_freeze(&mut self);

    /// Begin expiring a sealed journal segment. Returns `true` when the
    /// segment holds no dirty metadata and is expired immediately;
    /// otherwise the cache later reports completion through the daemon.
    fn start_segment_expiry(&mut self, seq: SegmentSeq) -> bool;

    fn shutdown(&mut self);
}

/// Subtree export machinery.
pub trait Migrator: Send + Sync {
    fn export_dir(&mut self, path: &str, target: Rank) -> Result<()>;
    fn handle_peer_stopped(&mut self, rank: Rank);
    fn find_stale_export_freeze(&mut self);
}

/// Workload balancer; load computation is out of scope.
pub trait Balancer: Send + Sync {
    fn tick(&mut self);
    fn try_rebalance(&mut self);
    fn get_load(&self) -> f64;
}

/// Snapshot table server (runs on the table-server rank).
pub trait SnapServer: Send + Sync {
    fn check_osd_map(&mut self, force: bool);
    fn handle_peer_recovery(&mut self, rank: Rank);
}

/// Snapshot table client.
pub trait SnapClient: Send + Sync {
    fn handle_peer_failure(&mut self, rank: Rank);
}

/// Metadata-lock manager.
pub trait Locker: Send + Sync {
    fn tick(&mut self);
}

/// Rank-local client-request server.
pub trait Server: Send + Sync {
    fn find_idle_sessions(&mut self);
    fn reconnect_tick(&mut self);
    fn waiting_for_reconnect(&self, name: EntityName) -> bool;
    fn handle_osd_map(&mut self, epoch: Epoch);
}

/// Fallback dispatcher for messages the daemon core does not handle.
pub trait RankDispatcher: Send + Sync {
    fn dispatch(&mut self, env: &MessageEnvelope) -> bool;
}

/// Client to the object store, mirroring the objecter surface the
/// daemon needs: map epochs, incarnation fencing, and map waits.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    fn init(&self);
    fn start(&self);

    fn get_osdmap_epoch(&self) -> Epoch;

    /// Wait until the client has observed a map of at least `epoch`.
    /// Must be called without the daemon lock held.
    async fn wait_for_map(&self, epoch: Epoch);

    /// Wait until any map at all has been observed.
    async fn wait_for_initial_map(&self);

    /// Ask for continuous map updates rather than on-use fetches.
    fn maybe_request_map(&self);

    fn up_osd_features(&self) -> FeatureSet;
    fn num_up_osds(&self) -> usize;

    fn set_client_incarnation(&self, inc: Incarnation);

    fn shutdown(&self);
}

/// One buffered operator-log line, flushed to the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClogEntry {
    pub level: String,
    pub message: String,
}

/// Client to the monitor cluster.
#[async_trait]
pub trait MonitorClient: Send + Sync {
    async fn authenticate(&self) -> Result<()>;

    /// Wait up to `secs` seconds for rotating service keys.
    async fn wait_auth_rotating(&self, secs: u64) -> Result<()>;

    fn subscribe(&self, what: &str, epoch: Epoch);

    /// Send a beacon. Returns once the monitor acknowledges it.
    async fn send_beacon(&self, msg: BeaconMsg) -> Result<()>;

    /// Push buffered operator-log entries.
    async fn send_log(&self, entries: Vec<ClogEntry>) -> Result<()>;

    /// Build an outbound authorizer for connecting to a peer of the
    /// given type. `None` when no credentials are available.
    fn build_authorizer(&self, peer_type: ferrofs_proto::PeerType) -> Option<crate::auth::Authorizer>;

    fn shutdown(&self);
}

/// A single connection managed by the messenger. The daemon attaches a
/// session identity to it once the authorizer verifies.
pub trait Connection: Send + Sync {
    fn peer_addr(&self) -> Address;
    fn peer_type(&self) -> ferrofs_proto::PeerType;

    fn send_message(&self, msg: Message);
    fn mark_down(&self);
    fn is_down(&self) -> bool;

    /// The session identity bound to this connection, if any.
    fn entity(&self) -> Option<EntityName>;
    fn set_entity(&self, name: Option<EntityName>);
}

/// The transport layer.
pub trait Messenger: Send + Sync {
    fn set_myname(&self, name: EntityName);
    fn mark_down(&self, addr: Address);
    fn local_addr(&self) -> Address;
    fn shutdown(&self);
}

/// On-disk journal persistence; the log encoding itself is out of scope.
#[async_trait]
pub trait JournalBackend: Send + Sync {
    /// Make everything up to `upto` durable; returns the safe position.
    async fn persist(&self, upto: u64) -> Result<u64>;

    /// Rewrite the journal head record.
    async fn write_head(&self, head: crate::mdlog::JournalHead) -> Result<()>;
}

/// Process-level actions. The production implementation of `respawn`
/// re-executes the original binary and never returns.
pub trait ProcessControl: Send + Sync {
    fn respawn(&self);
}

/// Re-executes the current binary with its original arguments,
/// preferring `/proc/self/exe` over argv[0].
pub struct ExecRespawn {
    pub argv: Vec<String>,
}

impl ProcessControl for ExecRespawn {
    fn respawn(&self) {
        use std::os::unix::process::CommandExt;

        let exe = std::fs::read_link("/proc/self/exe")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.argv[0].clone());
        tracing::info!(exe = %exe, "respawn");

        // exec inherits the signal mask; clear it so the new instance
        // starts with default signal handling.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
        }

        let err = std::process::Command::new(&exe)
            .args(self.argv.iter().skip(1))
            .exec();

        // exec only returns on failure; callers rely on respawn never
        // returning.
        panic!("respawn exec of {} failed: {}", exe, err);
    }
}

/// Boxed collaborator arena owned by the daemon core.
pub struct Subsystems {
    pub mdcache: Box<dyn MetadataCache>,
    pub migrator: Box<dyn Migrator>,
    pub balancer: Box<dyn Balancer>,
    pub snap_server: Box<dyn SnapServer>,
    pub snap_client: Box<dyn SnapClient>,
    pub locker: Box<dyn Locker>,
    pub server: Box<dyn Server>,
    pub rank_dispatcher: Box<dyn RankDispatcher>,
}

/// Shared handles that outlive the lock (used by spawned continuations).
#[derive(Clone)]
pub struct SharedClients {
    pub monc: Arc<dyn MonitorClient>,
    pub objecter: Arc<dyn ObjectClient>,
    pub messenger: Arc<dyn Messenger>,
    pub journal_backend: Arc<dyn JournalBackend>,
    pub process: Arc<dyn ProcessControl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frag_parse_display() {
        let f: FragId = "1a/4".parse().unwrap();
        assert_eq!(f.value, 0x1a);
        assert_eq!(f.bits, 4);
        assert_eq!(format!("{}", f), "1a/4");

        assert_eq!(format!("{}", FragId::ROOT), "0/0");
        let root: FragId = "0/0".parse().unwrap();
        assert_eq!(root, FragId::ROOT);
    }

    #[test]
    fn test_frag_parse_errors() {
        assert!("".parse::<FragId>().is_err());
        assert!("12".parse::<FragId>().is_err());
        assert!("zz/q".parse::<FragId>().is_err());
        assert!("1a/".parse::<FragId>().is_err());
    }

    #[tokio::test]
    async fn test_queue_waiters() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        // A dropped receiver must not panic the sender side.
        let (tx3, rx3) = oneshot::channel::<i32>();
        drop(rx3);

        queue_waiters(vec![tx1, tx2, tx3], 0);
        assert_eq!(rx1.await.unwrap(), 0);
        assert_eq!(rx2.await.unwrap(), 0);
    }
}
