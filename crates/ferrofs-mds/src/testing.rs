//! Test harness: a daemon wired to recording stubs, plus a cluster-map
//! builder. Used by the unit tests here and the scenario tests under
//! `tests/`.

use std::sync::Arc;

use ferrofs_config::ConfigManager;
use ferrofs_proto::{Address, DaemonState, EntityName, FeatureSet, MdsInfo, MdsMap, PeerType};
use ferrofs_types::{Epoch, GlobalId, Incarnation, Rank};

use crate::config::MdsConfig;
use crate::daemon::Mds;
use crate::stubs::{
    MemoryJournalBackend, RecordingProcessControl, StubBalancer, StubCache, StubConnection,
    StubLocker, StubMessenger, StubMigrator, StubMonitorClient, StubObjectClient,
    StubRankDispatcher, StubServer, StubSnapClient, StubSnapServer,
};
use crate::subsystems::{SharedClients, Subsystems};

/// Incrementally build an [`MdsMap`] for tests.
pub struct MapBuilder {
    map: MdsMap,
}

impl MapBuilder {
    pub fn new() -> Self {
        Self {
            map: MdsMap::new(Epoch(1)),
        }
    }

    pub fn epoch(mut self, epoch: u64) -> Self {
        self.map.epoch = Epoch(epoch);
        self
    }

    pub fn required_features(mut self, features: FeatureSet) -> Self {
        self.map.required_features = features;
        self
    }

    fn push(&mut self, mut info: MdsInfo) {
        // Addresses derive from the gid, so the same instance keeps
        // its address across maps while a replacement gets a new one.
        let gid = info.global_id;
        info.addr = Address::from_octets(10, 0, (*gid >> 8) as u8, *gid as u8, 6800);
        self.map.infos.insert(gid, info);
    }

    /// Add a rank-holding daemon.
    pub fn up(mut self, gid: GlobalId, name: &str, rank: i32, state: DaemonState) -> Self {
        let mut info = MdsInfo::new(gid, name);
        info.rank = Rank(rank);
        info.state = state;
        info.incarnation = Incarnation(1);
        self.push(info);
        self
    }

    /// Same as [`MapBuilder::up`] with an explicit incarnation.
    pub fn up_inc(
        mut self,
        gid: GlobalId,
        name: &str,
        rank: i32,
        state: DaemonState,
        inc: u32,
    ) -> Self {
        let mut info = MdsInfo::new(gid, name);
        info.rank = Rank(rank);
        info.state = state;
        info.incarnation = Incarnation(inc);
        self.push(info);
        self
    }

    /// Add a standby daemon (no rank).
    pub fn standby(mut self, gid: GlobalId, name: &str) -> Self {
        self.push(MdsInfo::new(gid, name));
        self
    }

    pub fn build(self) -> MdsMap {
        self.map
    }
}

impl Default for MapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A daemon under test, with handles to every stub it was wired to.
pub struct TestMds {
    pub mds: Mds,
    pub gid: GlobalId,
    pub config: Arc<ConfigManager<MdsConfig>>,
    pub cache: StubCache,
    pub migrator: StubMigrator,
    pub balancer: StubBalancer,
    pub snap_server: StubSnapServer,
    pub snap_client: StubSnapClient,
    pub locker: StubLocker,
    pub server: StubServer,
    pub rank_dispatcher: StubRankDispatcher,
    pub monc: Arc<StubMonitorClient>,
    pub objecter: Arc<StubObjectClient>,
    pub messenger: StubMessenger,
    pub journal_backend: Arc<MemoryJournalBackend>,
    pub process: RecordingProcessControl,
}

impl TestMds {
    pub async fn new() -> Self {
        Self::with_config(MdsConfig::default()).await
    }

    pub async fn with_config(config: MdsConfig) -> Self {
        let gid = GlobalId(4400);
        let cache = StubCache::new();
        let migrator = StubMigrator::new();
        let balancer = StubBalancer::new();
        let snap_server = StubSnapServer::new();
        let snap_client = StubSnapClient::new();
        let locker = StubLocker::new();
        let server = StubServer::new();
        let rank_dispatcher = StubRankDispatcher::new();
        let monc = Arc::new(StubMonitorClient::new());
        let objecter = Arc::new(StubObjectClient::new());
        let messenger = StubMessenger::new();
        let journal_backend = Arc::new(MemoryJournalBackend::new());
        let process = RecordingProcessControl::new();

        let subsystems = Subsystems {
            mdcache: Box::new(cache.clone()),
            migrator: Box::new(migrator.clone()),
            balancer: Box::new(balancer.clone()),
            snap_server: Box::new(snap_server.clone()),
            snap_client: Box::new(snap_client.clone()),
            locker: Box::new(locker.clone()),
            server: Box::new(server.clone()),
            rank_dispatcher: Box::new(rank_dispatcher.clone()),
        };
        let clients = SharedClients {
            monc: monc.clone(),
            objecter: objecter.clone(),
            messenger: Arc::new(messenger.clone()),
            journal_backend: journal_backend.clone(),
            process: Arc::new(process.clone()),
        };

        let config = Arc::new(ConfigManager::new(config));
        let mds = Mds::new(gid, config.clone(), subsystems, clients);

        Self {
            mds,
            gid,
            config,
            cache,
            migrator,
            balancer,
            snap_server,
            snap_client,
            locker,
            server,
            rank_dispatcher,
            monc,
            objecter,
            messenger,
            journal_backend,
            process,
        }
    }

    pub fn map_builder(&self) -> MapBuilder {
        MapBuilder::new()
    }

    /// Feed a cluster map to the daemon as the monitor would.
    pub async fn accept_map(&self, map: MdsMap) {
        self.mds
            .handle_mds_map(map, EntityName::monitor(GlobalId(1)))
            .await;
    }

    /// Drive the daemon from nothing to Active at the given rank,
    /// stepping through the full recovery sequence. Returns the epoch
    /// of the final map.
    pub async fn boot_to_active(&self, rank: i32) -> u64 {
        let name = self.mds.name().to_string();
        let states = [
            DaemonState::Replay,
            DaemonState::Resolve,
            DaemonState::Reconnect,
            DaemonState::Rejoin,
            DaemonState::Active,
        ];
        let mut epoch = 0;
        for state in states {
            epoch += 1;
            self.accept_map(
                MapBuilder::new()
                    .epoch(epoch)
                    .up(self.gid, &name, rank, state)
                    .build(),
            )
            .await;
        }
        epoch
    }

    pub fn client_connection(&self) -> Arc<StubConnection> {
        StubConnection::new(PeerType::Client, Address::from_octets(10, 9, 9, 9, 40000))
    }
}
