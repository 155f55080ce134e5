//! In-memory implementations of the collaborator traits.
//!
//! These back the server binary until the real sub-systems are wired
//! in, and double as the recording mocks the test suite asserts
//! against. Shared state lives behind an `Arc` so a test can keep a
//! handle after moving the stub into the daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use ferrofs_proto::{
    Address, BeaconMsg, DaemonState, EntityName, FeatureSet, Message, MessageEnvelope, PeerType,
};
use ferrofs_types::{
    Epoch, Incarnation, JournalCode, Rank, Result, SegmentSeq, StatusCode, make_error_msg,
};

use crate::mdlog::JournalHead;
use crate::subsystems::{
    Balancer, ClogEntry, Connection, JournalBackend, Locker, MdsWaiter, Messenger, MetadataCache,
    Migrator, MonitorClient, ObjectClient, ProcessControl, RankDispatcher, Server, SnapClient,
    SnapServer, SubtreeInfo,
};
use crate::subsystems::FragId;

// ---------------------------------------------------------------------------
// Metadata cache
// ---------------------------------------------------------------------------

/// Directory known to the stub cache.
#[derive(Debug, Clone)]
pub struct StubDir {
    pub auth: bool,
    pub frags: Vec<FragId>,
}

#[derive(Default)]
pub struct CacheState {
    pub readonly: bool,
    pub dirs: HashMap<String, StubDir>,
    pub subtrees: Vec<SubtreeInfo>,
    pub entry_actions: Vec<String>,
    pub recovery_done_from: Vec<DaemonState>,
    pub peer_failures: Vec<Rank>,
    pub peer_recoveries: Vec<Rank>,
    pub kicked_discovers: Vec<Rank>,
    pub resolves_sent: usize,
    pub rejoin_joint_starts: usize,
    pub map_epochs: Vec<Epoch>,
    pub trims: usize,
    pub lease_trims: usize,
    pub memory_checks: usize,
    pub stale_frag_scans: usize,
    pub splits: Vec<(String, FragId, i32)>,
    pub merges: Vec<(String, FragId)>,
    pub scrubbed: Vec<String>,
    pub flushed_paths: Vec<String>,
    pub dumps: usize,
    pub shutdowns: usize,
    /// When set, dirty segments stay in `Expiring` until the test
    /// completes them through the daemon.
    pub hold_expiry: bool,
    pub pending_expiries: Vec<SegmentSeq>,
}

/// Recording metadata-cache stub.
#[derive(Clone, Default)]
pub struct StubCache {
    pub state: Arc<Mutex<CacheState>>,
}

impl StubCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, path: &str, auth: bool) {
        self.state.lock().dirs.insert(
            path.to_string(),
            StubDir {
                auth,
                frags: vec![FragId::ROOT],
            },
        );
    }

    pub fn set_hold_expiry(&self, hold: bool) {
        self.state.lock().hold_expiry = hold;
    }

    pub fn entry_actions(&self) -> Vec<String> {
        self.state.lock().entry_actions.clone()
    }

    fn record(&self, action: &str) {
        self.state.lock().entry_actions.push(action.to_string());
    }
}

impl MetadataCache for StubCache {
    fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    fn force_readonly(&mut self) {
        self.state.lock().readonly = true;
    }

    fn path_in_cache(&self, path: &str) -> bool {
        self.state.lock().dirs.contains_key(path)
    }

    fn dir_is_auth(&self, path: &str, frag: FragId) -> Option<bool> {
        let state = self.state.lock();
        let dir = state.dirs.get(path)?;
        if dir.frags.contains(&frag) {
            Some(dir.auth)
        } else {
            None
        }
    }

    fn dir_frags(&self, path: &str) -> Option<Vec<FragId>> {
        self.state.lock().dirs.get(path).map(|d| d.frags.clone())
    }

    fn split_dir(&mut self, path: &str, frag: FragId, bits: i32) -> Result<()> {
        let mut state = self.state.lock();
        let dir = state.dirs.get_mut(path).ok_or_else(|| {
            ferrofs_types::Status::with_message(
                ferrofs_types::MdsCode::PATH_NOT_IN_CACHE,
                format!("directory '{}' inode not in cache", path),
            )
        })?;
        let children: Vec<FragId> = (0..(1u32 << bits.min(8)))
            .map(|i| FragId {
                value: (frag.value << bits.min(8)) | i,
                bits: frag.bits + bits as u8,
            })
            .collect();
        dir.frags.retain(|f| *f != frag);
        dir.frags.extend(children);
        state.splits.push((path.to_string(), frag, bits));
        Ok(())
    }

    fn merge_dir(&mut self, path: &str, frag: FragId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dirs.contains_key(path) {
            return make_error_msg(
                ferrofs_types::MdsCode::PATH_NOT_IN_CACHE,
                format!("directory '{}' inode not in cache", path),
            );
        }
        state.merges.push((path.to_string(), frag));
        Ok(())
    }

    fn scrub_path(&mut self, path: &str, done: MdsWaiter) {
        self.state.lock().scrubbed.push(path.to_string());
        let _ = done.send(0);
    }

    fn flush_path(&mut self, path: &str, done: MdsWaiter) {
        self.state.lock().flushed_paths.push(path.to_string());
        let _ = done.send(0);
    }

    fn list_subtrees(&self) -> Vec<SubtreeInfo> {
        self.state.lock().subtrees.clone()
    }

    fn dump(&self, _file: Option<&str>) -> Value {
        let mut state = self.state.lock();
        state.dumps += 1;
        json!({
            "num_dirs": state.dirs.len(),
            "readonly": state.readonly,
        })
    }

    fn boot_create(&mut self) {
        self.record("boot_create");
    }
    fn boot_start(&mut self) {
        self.record("boot_start");
    }
    fn replay_start(&mut self) {
        self.record("replay_start");
    }
    fn resolve_start(&mut self) {
        self.record("resolve_start");
    }
    fn reconnect_start(&mut self) {
        self.record("reconnect_start");
    }
    fn rejoin_start(&mut self) {
        self.record("rejoin_start");
    }
    fn clientreplay_start(&mut self) {
        self.record("clientreplay_start");
    }
    fn active_start(&mut self) {
        self.record("active_start");
    }
    fn stopping_start(&mut self) {
        self.record("stopping_start");
    }

    fn recovery_done(&mut self, oldstate: DaemonState) {
        self.state.lock().recovery_done_from.push(oldstate);
    }

    fn handle_peer_failure(&mut self, rank: Rank) {
        self.state.lock().peer_failures.push(rank);
    }

    fn handle_peer_recovery(&mut self, rank: Rank) {
        self.state.lock().peer_recoveries.push(rank);
    }

    fn kick_discovers(&mut self, rank: Rank) {
        self.state.lock().kicked_discovers.push(rank);
    }

    fn send_resolves(&mut self) {
        self.state.lock().resolves_sent += 1;
    }

    fn rejoin_joint_start(&mut self) {
        self.state.lock().rejoin_joint_starts += 1;
    }

    fn notify_map_changed(&mut self, epoch: Epoch) {
        self.state.lock().map_epochs.push(epoch);
    }

    fn trim(&mut self) {
        self.state.lock().trims += 1;
    }

    fn trim_client_leases(&mut self) {
        self.state.lock().lease_trims += 1;
    }

    fn check_memory_usage(&mut self) {
        self.state.lock().memory_checks += 1;
    }

    fn find_stale_fragment_freeze(&mut self) {
        self.state.lock().stale_frag_scans += 1;
    }

    fn start_segment_expiry(&mut self, seq: SegmentSeq) -> bool {
        let mut state = self.state.lock();
        if state.hold_expiry {
            state.pending_expiries.push(seq);
            false
        } else {
            true
        }
    }

    fn shutdown(&mut self) {
        self.state.lock().shutdowns += 1;
    }
}

// ---------------------------------------------------------------------------
// Migrator / balancer / snap / locker / server / dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MigratorState {
    pub exports: Vec<(String, Rank)>,
    pub stopped_peers: Vec<Rank>,
    pub stale_scans: usize,
}

#[derive(Clone, Default)]
pub struct StubMigrator {
    pub state: Arc<Mutex<MigratorState>>,
}

impl StubMigrator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Migrator for StubMigrator {
    fn export_dir(&mut self, path: &str, target: Rank) -> Result<()> {
        self.state.lock().exports.push((path.to_string(), target));
        Ok(())
    }

    fn handle_peer_stopped(&mut self, rank: Rank) {
        self.state.lock().stopped_peers.push(rank);
    }

    fn find_stale_export_freeze(&mut self) {
        self.state.lock().stale_scans += 1;
    }
}

#[derive(Default)]
pub struct BalancerState {
    pub ticks: usize,
    pub rebalances: usize,
    pub load: f64,
}

#[derive(Clone, Default)]
pub struct StubBalancer {
    pub state: Arc<Mutex<BalancerState>>,
}

impl StubBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for StubBalancer {
    fn tick(&mut self) {
        self.state.lock().ticks += 1;
    }

    fn try_rebalance(&mut self) {
        self.state.lock().rebalances += 1;
    }

    fn get_load(&self) -> f64 {
        self.state.lock().load
    }
}

#[derive(Default)]
pub struct SnapServerState {
    pub osd_map_checks: Vec<bool>,
    pub peer_recoveries: Vec<Rank>,
}

#[derive(Clone, Default)]
pub struct StubSnapServer {
    pub state: Arc<Mutex<SnapServerState>>,
}

impl StubSnapServer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapServer for StubSnapServer {
    fn check_osd_map(&mut self, force: bool) {
        self.state.lock().osd_map_checks.push(force);
    }

    fn handle_peer_recovery(&mut self, rank: Rank) {
        self.state.lock().peer_recoveries.push(rank);
    }
}

#[derive(Clone, Default)]
pub struct StubSnapClient {
    pub peer_failures: Arc<Mutex<Vec<Rank>>>,
}

impl StubSnapClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapClient for StubSnapClient {
    fn handle_peer_failure(&mut self, rank: Rank) {
        self.peer_failures.lock().push(rank);
    }
}

#[derive(Clone, Default)]
pub struct StubLocker {
    pub ticks: Arc<AtomicUsize>,
}

impl StubLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for StubLocker {
    fn tick(&mut self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct ServerState {
    pub idle_scans: usize,
    pub reconnect_ticks: usize,
    pub reconnecting: Vec<EntityName>,
    pub osd_map_epochs: Vec<Epoch>,
}

#[derive(Clone, Default)]
pub struct StubServer {
    pub state: Arc<Mutex<ServerState>>,
}

impl StubServer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Server for StubServer {
    fn find_idle_sessions(&mut self) {
        self.state.lock().idle_scans += 1;
    }

    fn reconnect_tick(&mut self) {
        self.state.lock().reconnect_ticks += 1;
    }

    fn waiting_for_reconnect(&self, name: EntityName) -> bool {
        self.state.lock().reconnecting.contains(&name)
    }

    fn handle_osd_map(&mut self, epoch: Epoch) {
        self.state.lock().osd_map_epochs.push(epoch);
    }
}

#[derive(Clone, Default)]
pub struct StubRankDispatcher {
    pub handled: Arc<Mutex<Vec<String>>>,
}

impl StubRankDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RankDispatcher for StubRankDispatcher {
    fn dispatch(&mut self, env: &MessageEnvelope) -> bool {
        self.handled.lock().push(env.msg.type_name().to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// Object client
// ---------------------------------------------------------------------------

/// Object-store client stub with an externally settable map epoch.
pub struct StubObjectClient {
    epoch: AtomicU64,
    features: Mutex<FeatureSet>,
    num_up: AtomicUsize,
    incarnation: Mutex<Incarnation>,
    map_requests: AtomicUsize,
    shutdowns: AtomicUsize,
    epoch_changed: Notify,
}

impl StubObjectClient {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            features: Mutex::new(FeatureSet::supported()),
            num_up: AtomicUsize::new(1),
            incarnation: Mutex::new(Incarnation(0)),
            map_requests: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            epoch_changed: Notify::new(),
        }
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        self.epoch.store(*epoch, Ordering::SeqCst);
        self.epoch_changed.notify_waiters();
    }

    pub fn set_up_osd_features(&self, features: FeatureSet) {
        *self.features.lock() = features;
    }

    pub fn set_num_up_osds(&self, n: usize) {
        self.num_up.store(n, Ordering::SeqCst);
    }

    pub fn client_incarnation(&self) -> Incarnation {
        *self.incarnation.lock()
    }

    pub fn map_requests(&self) -> usize {
        self.map_requests.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Default for StubObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for StubObjectClient {
    fn init(&self) {}

    fn start(&self) {}

    fn get_osdmap_epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::SeqCst))
    }

    async fn wait_for_map(&self, epoch: Epoch) {
        loop {
            if self.get_osdmap_epoch() >= epoch {
                return;
            }
            self.epoch_changed.notified().await;
        }
    }

    async fn wait_for_initial_map(&self) {
        // Epoch 0 counts as "a map" for the stub.
    }

    fn maybe_request_map(&self) {
        self.map_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn up_osd_features(&self) -> FeatureSet {
        *self.features.lock()
    }

    fn num_up_osds(&self) -> usize {
        self.num_up.load(Ordering::SeqCst)
    }

    fn set_client_incarnation(&self, inc: Incarnation) {
        *self.incarnation.lock() = inc;
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Monitor client
// ---------------------------------------------------------------------------

/// Monitor-client stub that acknowledges beacons synchronously.
pub struct StubMonitorClient {
    beacons: Mutex<Vec<BeaconMsg>>,
    log_entries: Mutex<Vec<ClogEntry>>,
    subscriptions: Mutex<Vec<(String, Epoch)>>,
    fail_beacons: AtomicBool,
    fail_log: AtomicBool,
    beacon_delay_ms: AtomicU64,
    auth_failures_remaining: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl StubMonitorClient {
    pub fn new() -> Self {
        Self {
            beacons: Mutex::new(Vec::new()),
            log_entries: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_beacons: AtomicBool::new(false),
            fail_log: AtomicBool::new(false),
            beacon_delay_ms: AtomicU64::new(0),
            auth_failures_remaining: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn sent_beacons(&self) -> Vec<BeaconMsg> {
        self.beacons.lock().clone()
    }

    pub fn last_beacon(&self) -> Option<BeaconMsg> {
        self.beacons.lock().last().cloned()
    }

    pub fn sent_log_entries(&self) -> Vec<ClogEntry> {
        self.log_entries.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, Epoch)> {
        self.subscriptions.lock().clone()
    }

    pub fn fail_beacons(&self, fail: bool) {
        self.fail_beacons.store(fail, Ordering::SeqCst);
    }

    pub fn fail_log_sends(&self, fail: bool) {
        self.fail_log.store(fail, Ordering::SeqCst);
    }

    pub fn delay_beacons_ms(&self, ms: u64) {
        self.beacon_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Default for StubMonitorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitorClient for StubMonitorClient {
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_auth_rotating(&self, _secs: u64) -> Result<()> {
        if self
            .auth_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return make_error_msg(StatusCode::AUTHENTICATION_FAIL, "rotating keys not ready");
        }
        Ok(())
    }

    fn subscribe(&self, what: &str, epoch: Epoch) {
        self.subscriptions.lock().push((what.to_string(), epoch));
    }

    async fn send_beacon(&self, msg: BeaconMsg) -> Result<()> {
        let delay = self.beacon_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail_beacons.load(Ordering::SeqCst) {
            return make_error_msg(StatusCode::TIMEOUT, "monitor unreachable");
        }
        self.beacons.lock().push(msg);
        Ok(())
    }

    async fn send_log(&self, entries: Vec<ClogEntry>) -> Result<()> {
        if self.fail_log.load(Ordering::SeqCst) {
            return make_error_msg(StatusCode::TIMEOUT, "monitor unreachable");
        }
        self.log_entries.lock().extend(entries);
        Ok(())
    }

    fn build_authorizer(&self, peer_type: PeerType) -> Option<crate::auth::Authorizer> {
        Some(crate::auth::Authorizer {
            protocol: crate::auth::AUTH_PROTOCOL_NONE,
            entity: format!("mds.{}", peer_type),
            global_id: ferrofs_types::GlobalId(0),
            key: String::new(),
            caps: None,
            allow_all: false,
        })
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Messenger + connections
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MessengerState {
    pub myname: Option<EntityName>,
    pub marked_down: Vec<Address>,
    pub shutdowns: usize,
}

#[derive(Clone, Default)]
pub struct StubMessenger {
    pub state: Arc<Mutex<MessengerState>>,
}

impl StubMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn myname(&self) -> Option<EntityName> {
        self.state.lock().myname
    }

    pub fn marked_down(&self) -> Vec<Address> {
        self.state.lock().marked_down.clone()
    }
}

impl Messenger for StubMessenger {
    fn set_myname(&self, name: EntityName) {
        self.state.lock().myname = Some(name);
    }

    fn mark_down(&self, addr: Address) {
        self.state.lock().marked_down.push(addr);
    }

    fn local_addr(&self) -> Address {
        Address::from_octets(127, 0, 0, 1, 6800)
    }

    fn shutdown(&self) {
        self.state.lock().shutdowns += 1;
    }
}

/// Recording connection; `sent` captures everything delivered to it.
pub struct StubConnection {
    peer_addr: Address,
    peer_type: PeerType,
    pub sent: Mutex<Vec<Message>>,
    down: AtomicBool,
    entity: Mutex<Option<EntityName>>,
}

impl StubConnection {
    pub fn new(peer_type: PeerType, peer_addr: Address) -> Arc<Self> {
        Arc::new(Self {
            peer_addr,
            peer_type,
            sent: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
            entity: Mutex::new(None),
        })
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

impl Connection for StubConnection {
    fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    fn send_message(&self, msg: Message) {
        self.sent.lock().push(msg);
    }

    fn mark_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    fn entity(&self) -> Option<EntityName> {
        *self.entity.lock()
    }

    fn set_entity(&self, name: Option<EntityName>) {
        *self.entity.lock() = name;
    }
}

// ---------------------------------------------------------------------------
// Journal backend
// ---------------------------------------------------------------------------

/// Journal backend persisting into counters, with failure injection and
/// a hold gate for ordering-sensitive tests.
pub struct MemoryJournalBackend {
    persisted_upto: AtomicU64,
    heads: Mutex<Vec<JournalHead>>,
    fail_persist: AtomicBool,
    fail_head: AtomicBool,
    hold_persist: AtomicBool,
    released: Notify,
}

impl MemoryJournalBackend {
    pub fn new() -> Self {
        Self {
            persisted_upto: AtomicU64::new(0),
            heads: Mutex::new(Vec::new()),
            fail_persist: AtomicBool::new(false),
            fail_head: AtomicBool::new(false),
            hold_persist: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn persisted_upto(&self) -> u64 {
        self.persisted_upto.load(Ordering::SeqCst)
    }

    pub fn written_heads(&self) -> Vec<JournalHead> {
        self.heads.lock().clone()
    }

    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn fail_head(&self, fail: bool) {
        self.fail_head.store(fail, Ordering::SeqCst);
    }

    pub fn hold_persist(&self, hold: bool) {
        self.hold_persist.store(hold, Ordering::SeqCst);
        if !hold {
            self.released.notify_waiters();
        }
    }
}

impl Default for MemoryJournalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JournalBackend for MemoryJournalBackend {
    async fn persist(&self, upto: u64) -> Result<u64> {
        while self.hold_persist.load(Ordering::SeqCst) {
            self.released.notified().await;
        }
        if self.fail_persist.load(Ordering::SeqCst) {
            return make_error_msg(JournalCode::FLUSH_FAILED, "injected flush failure");
        }
        self.persisted_upto.fetch_max(upto, Ordering::SeqCst);
        Ok(upto)
    }

    async fn write_head(&self, head: JournalHead) -> Result<()> {
        if self.fail_head.load(Ordering::SeqCst) {
            return make_error_msg(JournalCode::WRITE_HEAD_FAILED, "injected head failure");
        }
        self.heads.lock().push(head);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

/// Records respawn requests instead of exec'ing.
#[derive(Clone, Default)]
pub struct RecordingProcessControl {
    pub respawns: Arc<AtomicUsize>,
}

impl RecordingProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respawn_count(&self) -> usize {
        self.respawns.load(Ordering::SeqCst)
    }
}

impl ProcessControl for RecordingProcessControl {
    fn respawn(&self) {
        self.respawns.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_object_client_wait_for_map() {
        let objecter = Arc::new(StubObjectClient::new());
        let waiter = {
            let objecter = objecter.clone();
            tokio::spawn(async move { objecter.wait_for_map(Epoch(5)).await })
        };
        objecter.set_epoch(Epoch(5));
        waiter.await.unwrap();
        assert_eq!(objecter.get_osdmap_epoch(), Epoch(5));
    }

    #[tokio::test]
    async fn test_journal_backend_failure_injection() {
        let backend = MemoryJournalBackend::new();
        backend.persist(100).await.unwrap();
        assert_eq!(backend.persisted_upto(), 100);

        backend.fail_persist(true);
        assert!(backend.persist(200).await.is_err());
        assert_eq!(backend.persisted_upto(), 100);

        backend.fail_head(true);
        assert!(backend.write_head(JournalHead::default()).await.is_err());
        assert!(backend.written_heads().is_empty());
    }

    #[tokio::test]
    async fn test_journal_backend_hold_gate() {
        let backend = Arc::new(MemoryJournalBackend::new());
        backend.hold_persist(true);

        let task = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.persist(50).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(backend.persisted_upto(), 0);

        backend.hold_persist(false);
        task.await.unwrap().unwrap();
        assert_eq!(backend.persisted_upto(), 50);
    }

    #[test]
    fn test_stub_cache_dirs() {
        let cache = StubCache::new();
        cache.add_dir("/a", true);
        assert!(cache.path_in_cache("/a"));
        assert!(!cache.path_in_cache("/b"));
        assert_eq!(cache.dir_is_auth("/a", FragId::ROOT), Some(true));
        assert_eq!(cache.dir_is_auth("/a", FragId { value: 1, bits: 1 }), None);
    }

    #[test]
    fn test_stub_cache_split_updates_frags() {
        let cache = StubCache::new();
        cache.add_dir("/a", true);
        let mut c = cache.clone();
        c.split_dir("/a", FragId::ROOT, 1).unwrap();
        let frags = cache.dir_frags("/a").unwrap();
        assert_eq!(frags.len(), 2);
        assert!(cache.state.lock().splits.len() == 1);
    }

    #[tokio::test]
    async fn test_monitor_auth_retry_countdown() {
        let monc = StubMonitorClient::new();
        monc.auth_failures_remaining.store(2, Ordering::SeqCst);
        assert!(monc.wait_auth_rotating(1).await.is_err());
        assert!(monc.wait_auth_rotating(1).await.is_err());
        assert!(monc.wait_auth_rotating(1).await.is_ok());
    }
}
