//! The daemon controller: the process-wide lock, the cluster-map state
//! machine, message dispatch, and the terminal suicide/respawn paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{oneshot, watch};

use ferrofs_config::ConfigManager;
use ferrofs_proto::{
    DaemonState, EntityName, FeatureSet, HealthMetric, HealthReport, MdsMap, Message,
    MessageEnvelope, PeerType, features, mds_map,
};
use ferrofs_types::{
    Duration, Epoch, GlobalId, Incarnation, Rank, Result, Status, StatusCode, UtcTime,
    make_error_msg,
};

use crate::auth::{AUTH_PROTOCOL_NONE, AuthHandlerRegistry, Authorizer, NoneAuthHandler};
use crate::beacon::Beacon;
use crate::clog::OperatorLog;
use crate::config::MdsConfig;
use crate::mdlog::MdsLog;
use crate::op_tracker::OpTracker;
use crate::session::{MdsAuthCaps, SessionMap, SessionState};
use crate::subsystems::{
    Connection, MdsWaiter, SharedClients, Subsystems, queue_waiters,
};

/// All state mutated under the process-wide lock.
pub struct MdsCore {
    pub state: DaemonState,
    pub last_state: DaemonState,
    pub want_state: DaemonState,
    pub whoami: Rank,
    pub incarnation: Incarnation,
    /// Standby sub-type requested at boot, submitted once the monitor
    /// sends us to standby.
    pub standby_type: Option<DaemonState>,
    pub standby_for_rank: Rank,
    pub standby_for_name: String,
    pub mdsmap: Arc<MdsMap>,
    pub peer_map_epochs: HashMap<EntityName, Epoch>,
    pub stopping: bool,
    pub osd_epoch_barrier: Epoch,
    pub waiting_for_mdsmap: BTreeMap<Epoch, Vec<MdsWaiter>>,
    pub waiting_for_active_peer: HashMap<Rank, Vec<MdsWaiter>>,
    pub sessions: SessionMap,
    pub mdlog: MdsLog,
    pub subsystems: Subsystems,
}

impl MdsCore {
    fn new(subsystems: Subsystems) -> Self {
        Self {
            state: DaemonState::Boot,
            last_state: DaemonState::Boot,
            want_state: DaemonState::Boot,
            whoami: Rank::NONE,
            incarnation: Incarnation(0),
            standby_type: None,
            standby_for_rank: Rank::NONE,
            standby_for_name: String::new(),
            mdsmap: Arc::new(MdsMap::default()),
            peer_map_epochs: HashMap::new(),
            stopping: false,
            osd_epoch_barrier: Epoch::ZERO,
            waiting_for_mdsmap: BTreeMap::new(),
            waiting_for_active_peer: HashMap::new(),
            sessions: SessionMap::new(),
            mdlog: MdsLog::new(),
            subsystems,
        }
    }
}

pub(crate) struct MdsInner {
    pub(crate) name: String,
    pub(crate) global_id: GlobalId,
    pub(crate) config: Arc<ConfigManager<MdsConfig>>,
    pub(crate) lock: tokio::sync::Mutex<MdsCore>,
    pub(crate) beacon: Beacon,
    pub(crate) op_tracker: OpTracker,
    pub(crate) clog: Arc<OperatorLog>,
    pub(crate) clients: SharedClients,
    pub(crate) auth_cluster: AuthHandlerRegistry,
    pub(crate) auth_service: AuthHandlerRegistry,
    last_heartbeat_ms: AtomicI64,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl MdsInner {
    /// Start an asynchronous journal flush when there is undurable data
    /// and no flush already running. The completion re-takes the lock,
    /// advances the safe position, and re-kicks if writers appended
    /// more in the meantime.
    pub(crate) fn kick_journal_flush(inner: &Arc<MdsInner>, core: &mut MdsCore) {
        if !core.mdlog.needs_flush() || core.mdlog.flush_in_flight() {
            return;
        }
        core.mdlog.set_flush_in_flight();
        let upto = core.mdlog.write_pos();
        let inner = inner.clone();
        tokio::spawn(async move {
            let res = inner.clients.journal_backend.persist(upto).await;
            let mut core = inner.lock.lock().await;
            match res {
                Ok(pos) => {
                    core.mdlog.mark_safe(pos);
                    if core.mdlog.needs_flush() && core.mdlog.has_safe_waiters() {
                        MdsInner::kick_journal_flush(&inner, &mut core);
                    }
                }
                Err(status) => {
                    tracing::error!(%status, "journal flush failed");
                    let code = status.errno();
                    core.mdlog.fail_safe_waiters(code);
                }
            }
        });
    }
}

/// Handle to the daemon. Cheap to clone; all state lives behind the
/// process-wide lock in [`MdsCore`].
#[derive(Clone)]
pub struct Mds {
    pub(crate) inner: Arc<MdsInner>,
}

impl Mds {
    pub fn new(
        global_id: GlobalId,
        config: Arc<ConfigManager<MdsConfig>>,
        subsystems: Subsystems,
        clients: SharedClients,
    ) -> Self {
        let cfg = config.snapshot();
        let beacon = Beacon::new(
            cfg.name.clone(),
            clients.monc.clone(),
            global_id,
            DaemonState::Boot,
            Rank(cfg.standby_for_rank),
            cfg.standby_for_name.clone(),
            Duration::from_millis(cfg.beacon_grace_ms),
        );
        let op_tracker = OpTracker::new(
            Duration::from_millis(cfg.op_complaint_time_ms),
            cfg.op_history_size,
        );
        let clog = Arc::new(OperatorLog::new(clients.monc.clone()));
        clog.update_config(cfg.clog_routing());

        let make_registry = || {
            if cfg.auth_shared_keys.is_empty() {
                let mut reg = AuthHandlerRegistry::new();
                reg.register(AUTH_PROTOCOL_NONE, Arc::new(NoneAuthHandler));
                reg
            } else {
                AuthHandlerRegistry::with_shared_key(cfg.auth_shared_keys.iter().cloned())
            }
        };

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(MdsInner {
                name: cfg.name.clone(),
                global_id,
                config,
                lock: tokio::sync::Mutex::new(MdsCore::new(subsystems)),
                beacon,
                op_tracker,
                clog,
                clients,
                auth_cluster: make_registry(),
                auth_service: make_registry(),
                last_heartbeat_ms: AtomicI64::new(0),
                shutdown_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn global_id(&self) -> GlobalId {
        self.inner.global_id
    }

    pub fn op_tracker(&self) -> &OpTracker {
        &self.inner.op_tracker
    }

    pub fn clog(&self) -> &Arc<OperatorLog> {
        &self.inner.clog
    }

    pub fn beacon(&self) -> &Beacon {
        &self.inner.beacon
    }

    /// Run a closure with the core locked. Intended for tests and for
    /// wiring code that needs direct access to the session table.
    pub async fn with_core<R>(&self, f: impl FnOnce(&mut MdsCore) -> R) -> R {
        let mut core = self.inner.lock.lock().await;
        f(&mut core)
    }

    pub async fn current_state(&self) -> DaemonState {
        self.inner.lock.lock().await.state
    }

    pub async fn current_rank(&self) -> Rank {
        self.inner.lock.lock().await.whoami
    }

    pub async fn current_epoch(&self) -> Epoch {
        self.inner.lock.lock().await.mdsmap.epoch
    }

    pub async fn osd_epoch_barrier(&self) -> Epoch {
        self.inner.lock.lock().await.osd_epoch_barrier
    }

    pub async fn is_stopping(&self) -> bool {
        self.inner.lock.lock().await.stopping
    }

    // -----------------------------------------------------------------------
    // Boot
    // -----------------------------------------------------------------------

    /// Bring the daemon up: authenticate, gate on object-server
    /// features, wire standby preferences, and start the periodic
    /// loops. The first beacon induces a cluster map from the monitor.
    pub async fn init(&self, wanted_state: DaemonState) -> Result<()> {
        let clients = &self.inner.clients;
        clients.objecter.init();

        if let Err(e) = clients.monc.authenticate().await {
            tracing::error!(%e, "failed to authenticate with monitors");
            let mut core = self.inner.lock.lock().await;
            self.suicide(&mut core).await;
            return Err(e);
        }
        while clients.monc.wait_auth_rotating(30).await.is_err() {
            tracing::error!("unable to obtain rotating service keys; retrying");
        }
        clients.objecter.start();

        if wanted_state == DaemonState::Dne {
            return Ok(());
        }

        clients.monc.subscribe("mdsmap", Epoch::ZERO);

        // Object servers must support omap conversion before we start.
        let retry = Duration::from_millis(self.inner.config.snapshot().boot_retry_interval_ms);
        loop {
            clients.objecter.maybe_request_map();
            clients.objecter.wait_for_initial_map().await;
            if clients
                .objecter
                .up_osd_features()
                .contains(features::OSD_OMAP_CONVERSION)
            {
                break;
            }
            if clients.objecter.num_up_osds() > 0 {
                tracing::error!(
                    "one or more object servers do not support omap conversion; \
                     upgrade them before starting the MDS"
                );
            } else {
                tracing::error!(
                    epoch = *clients.objecter.get_osdmap_epoch(),
                    "no object servers are up, waiting"
                );
            }
            tokio::time::sleep(retry.into()).await;
        }

        let cfg = self.inner.config.snapshot();
        let mut core = self.inner.lock.lock().await;

        let mut wanted = wanted_state;
        if wanted == DaemonState::Boot && cfg.standby_replay {
            wanted = DaemonState::StandbyReplay;
        }
        if cfg.oneshot_replay {
            wanted = DaemonState::OneshotReplay;
        }

        let mut want = wanted;
        if matches!(
            wanted,
            DaemonState::StandbyReplay | DaemonState::OneshotReplay
        ) {
            if wanted == DaemonState::OneshotReplay
                && cfg.standby_for_rank < 0
                && cfg.standby_for_name.is_empty()
            {
                tracing::error!("oneshot replay requested without a target MDS");
                self.suicide(&mut core).await;
                return make_error_msg(
                    StatusCode::INVALID_CONFIG,
                    "oneshot replay requires a target",
                );
            }
            core.standby_type = Some(wanted);
            want = DaemonState::Boot;
        }
        core.standby_for_rank = Rank(cfg.standby_for_rank);
        core.standby_for_name = cfg.standby_for_name.clone();

        self.set_want_state(&mut core, want);
        core.whoami = Rank::NONE;
        self.inner
            .clients
            .messenger
            .set_myname(EntityName::mds(self.inner.global_id));
        drop(core);

        self.heartbeat_reset();
        self.spawn_loops();
        Ok(())
    }

    fn spawn_loops(&self) {
        // Tick loop. The interval is re-read each round so injectargs
        // on tick_interval_ms applies immediately.
        let mds = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let ms = mds.inner.config.snapshot().tick_interval_ms;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                        mds.tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        // Beacon loop.
        let mds = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let ms = mds.inner.config.snapshot().beacon_interval_ms;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                        if let Err(e) = mds.inner.beacon.send().await {
                            tracing::warn!(%e, "beacon send failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    pub fn heartbeat_reset(&self) {
        self.inner
            .last_heartbeat_ms
            .store(UtcTime::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.inner.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Re-apply hot-updatable config to the op tracker and operator
    /// log after a configuration change.
    pub fn apply_config(&self) {
        let cfg = self.inner.config.snapshot();
        self.inner.op_tracker.set_complaint_and_threshold(
            Duration::from_millis(cfg.op_complaint_time_ms),
            cfg.op_history_size,
        );
        self.inner.clog.update_config(cfg.clog_routing());
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn sender_allowed(msg: &Message, source: EntityName) -> bool {
        match msg {
            Message::MonMap { .. } | Message::MonCommand { .. } => {
                source.peer_type == PeerType::Monitor
            }
            Message::MdsMap { .. } => {
                matches!(source.peer_type, PeerType::Monitor | PeerType::Mds)
            }
            Message::OsdMap { .. } => {
                matches!(source.peer_type, PeerType::Monitor | PeerType::ObjectServer)
            }
            _ => true,
        }
    }

    /// Route an inbound message. Returns `false` when the message was
    /// not handled (daemon stopping, or no rank-local taker).
    pub async fn dispatch(&self, env: MessageEnvelope) -> bool {
        let mut core = self.inner.lock.lock().await;
        if core.stopping {
            return false;
        }

        self.heartbeat_reset();

        if core.want_state == DaemonState::Dne {
            tracing::debug!(msg = env.msg.type_name(), "stopping, discarding");
            return true;
        }

        if !Self::sender_allowed(&env.msg, env.source) {
            tracing::warn!(
                msg = env.msg.type_name(),
                source = %env.source,
                "dropping message from disallowed sender"
            );
            return true;
        }

        match env.msg {
            Message::MonMap { epoch } => {
                tracing::debug!(epoch = *epoch, "new monitor map");
                true
            }
            Message::MdsMap { map } => {
                self.handle_mds_map_locked(&mut core, map, env.source).await;
                true
            }
            Message::MonCommand { args } => {
                drop(core);
                self.handle_legacy_command(args).await;
                true
            }
            Message::Command { tid, request } => {
                drop(core);
                self.handle_command_message(env.source, tid, request).await;
                true
            }
            Message::OsdMap { epoch } => {
                self.handle_osd_map_locked(&mut core, epoch);
                true
            }
            _ => core.subsystems.rank_dispatcher.dispatch(&env),
        }
    }

    fn handle_osd_map_locked(&self, core: &mut MdsCore, epoch: Epoch) {
        if core.state == DaemonState::Active {
            core.subsystems.snap_server.check_osd_map(true);
        }
        core.subsystems.server.handle_osd_map(epoch);

        // Keep requesting maps so the full-pool flag stays current.
        self.inner.clients.objecter.maybe_request_map();
    }

    // -----------------------------------------------------------------------
    // Cluster-map handling
    // -----------------------------------------------------------------------

    pub async fn handle_mds_map(&self, map: MdsMap, source: EntityName) {
        let mut core = self.inner.lock.lock().await;
        self.handle_mds_map_locked(&mut core, map, source).await;
    }

    async fn handle_mds_map_locked(
        &self,
        core: &mut MdsCore,
        map: MdsMap,
        source: EntityName,
    ) {
        let epoch = map.epoch;
        tracing::debug!(epoch = *epoch, %source, "handle_mds_map");

        // Note the source's map version.
        if source.is_mds() {
            let seen = core.peer_map_epochs.entry(source).or_insert(Epoch::ZERO);
            if *seen < epoch {
                *seen = epoch;
            }
        }

        // Strictly epoch-ordered: drop stale maps.
        if epoch <= core.mdsmap.epoch {
            tracing::debug!(
                epoch = *epoch,
                current = *core.mdsmap.epoch,
                "old map epoch, discarding"
            );
            return;
        }

        let oldmap = core.mdsmap.clone();
        let old_whoami = core.whoami;
        let oldstate = core.state;

        let newmap = Arc::new(map);
        core.mdsmap = newmap.clone();
        self.inner.clients.monc.subscribe("mdsmap", epoch);

        // Update the beacon first so anything below that sends one
        // reflects the new epoch.
        self.inner.beacon.notify_mdsmap(epoch);

        // Feature compatibility gate.
        let supported = FeatureSet::supported();
        if !supported.compatible(&newmap.required_features) {
            tracing::error!(
                required = %newmap.required_features,
                supported = %supported,
                "map requires features this daemon lacks, killing myself"
            );
            self.suicide(core).await;
            return;
        }

        // Who am I according to the new map?
        core.state = newmap.get_state_gid(self.inner.global_id);
        core.incarnation = newmap.get_inc_gid(self.inner.global_id);
        core.whoami = newmap.get_rank_gid(self.inner.global_id);
        if core.whoami.is_none()
            && matches!(
                core.state,
                DaemonState::StandbyReplay | DaemonState::OneshotReplay
            )
        {
            if let Some(info) = newmap.get_info_gid(self.inner.global_id) {
                core.whoami = info.standby_for_rank;
            }
        }

        tracing::info!(
            rank = *core.whoami,
            incarnation = *core.incarnation,
            state = %core.state,
            "map says i am mds.{}.{}",
            core.whoami,
            core.incarnation
        );

        // A held rank can only change to a different rank via process
        // restart; losing the rank entirely is handled below, where
        // the unique-name check decides between respawn and suicide.
        if core.whoami != old_whoami && !old_whoami.is_none() && !core.whoami.is_none() {
            tracing::error!(
                old = *old_whoami,
                new = *core.whoami,
                "invalid rank transition"
            );
            self.respawn(core);
            return;
        }

        // Validate state transitions while holding a rank.
        if !core.whoami.is_none()
            && core.state != oldstate
            && !mds_map::is_valid_transition(oldstate, core.state)
        {
            tracing::error!(
                old = %oldstate,
                new = %core.state,
                "invalid state transition"
            );
            self.inner.clog.error(format!(
                "invalid state transition {} -> {}",
                oldstate, core.state
            ));
            self.respawn(core);
            return;
        }

        // Mark down peers that vanished from the map.
        for (gid, info) in &oldmap.infos {
            if !newmap.infos.contains_key(gid) {
                tracing::debug!(gid = **gid, "peer removed from map");
                self.inner.clients.messenger.mark_down(info.addr);
            }
        }

        if core.state != oldstate {
            core.last_state = oldstate;
        }

        if core.state == DaemonState::Standby {
            self.set_want_state(core, DaemonState::Standby);
            tracing::info!("handle_mds_map standby");
            if let Some(standby_type) = core.standby_type {
                self.request_state(core, standby_type).await;
            }
            return;
        } else if core.state == DaemonState::StandbyReplay {
            if let Some(standby_type) = core.standby_type {
                if standby_type != DaemonState::StandbyReplay {
                    self.request_state(core, standby_type).await;
                    core.state = oldstate;
                    return;
                }
            }
        }

        if core.whoami.is_none() {
            if core.want_state == DaemonState::Standby {
                tracing::info!("dropped out of mdsmap, re-adding myself");
                core.state = DaemonState::Boot;
                self.set_want_state(core, DaemonState::Boot);
            } else if core.want_state == DaemonState::Boot {
                tracing::debug!("not in map yet");
            } else {
                // Did someone else take our name?
                if self.inner.config.snapshot().enforce_unique_name {
                    if let Some(existing) = newmap.find_gid_by_name(&self.inner.name) {
                        if existing > self.inner.global_id {
                            tracing::warn!(
                                existing = *existing,
                                "dne in the mdsmap, new instance has larger gid, suicide"
                            );
                            // Suicide rather than respawn so the two of
                            // us do not fight over the slot forever.
                            self.suicide(core).await;
                            return;
                        }
                    }
                }
                tracing::warn!("dne in the mdsmap, respawning myself");
                self.respawn(core);
            }
            return;
        }

        // Update the messenger identity.
        if old_whoami != core.whoami || oldstate != core.state {
            if matches!(
                core.state,
                DaemonState::StandbyReplay | DaemonState::OneshotReplay
            ) {
                self.inner
                    .clients
                    .messenger
                    .set_myname(EntityName::mds(self.inner.global_id));
            } else {
                self.inner
                    .clients
                    .messenger
                    .set_myname(EntityName::mds(GlobalId(*core.whoami as u64)));
            }
        }

        // Fence stale object writes from the previous incarnation.
        self.inner
            .clients
            .objecter
            .set_client_incarnation(core.incarnation);

        if self.inner.config.snapshot().dump_cache_on_map {
            core.subsystems.mdcache.dump(None);
        }

        // Entry action for the new state.
        if oldstate != core.state {
            tracing::info!(old = %oldstate, new = %core.state, "state change");
            self.set_want_state(core, core.state);

            if oldstate == DaemonState::StandbyReplay {
                tracing::debug!("monitor activated us, leaving standby replay");
            } else {
                if matches!(core.state, DaemonState::Active | DaemonState::ClientReplay)
                    && matches!(
                        oldstate,
                        DaemonState::Creating | DaemonState::Rejoin | DaemonState::Reconnect
                    )
                {
                    core.subsystems.mdcache.recovery_done(oldstate);
                }
                Self::run_entry_action(core);
            }
        }

        // Peer transitions run after the entry action.
        self.handle_peer_transitions(core, &oldmap, oldstate);

        // Raise the OSD barrier before releasing any waiter, so a
        // woken continuation cannot hand out a capability based on a
        // pre-incarnation view.
        if core.state == DaemonState::Active {
            let osd_epoch = self.inner.clients.objecter.get_osdmap_epoch();
            self.set_osd_epoch_barrier(core, osd_epoch);
        }

        // Release map waiters satisfied by this epoch.
        let pending = core.waiting_for_mdsmap.split_off(&Epoch(*epoch + 1));
        let ready = std::mem::replace(&mut core.waiting_for_mdsmap, pending);
        for (_, waiters) in ready {
            queue_waiters(waiters, 0);
        }

        core.subsystems.mdcache.notify_map_changed(epoch);
    }

    fn run_entry_action(core: &mut MdsCore) {
        let cache = &mut core.subsystems.mdcache;
        match core.state {
            DaemonState::Active => cache.active_start(),
            DaemonState::Replay | DaemonState::StandbyReplay | DaemonState::OneshotReplay => {
                cache.replay_start()
            }
            DaemonState::Resolve => cache.resolve_start(),
            DaemonState::Reconnect => cache.reconnect_start(),
            DaemonState::Rejoin => cache.rejoin_start(),
            DaemonState::ClientReplay => cache.clientreplay_start(),
            DaemonState::Creating => cache.boot_create(),
            DaemonState::Starting => cache.boot_start(),
            DaemonState::Stopping => cache.stopping_start(),
            _ => {}
        }
    }

    fn handle_peer_transitions(
        &self,
        core: &mut MdsCore,
        oldmap: &MdsMap,
        oldstate: DaemonState,
    ) {
        let newmap = core.mdsmap.clone();
        let state = core.state;

        // Someone newly resolving: trigger the resolve broadcast.
        if matches!(
            state,
            DaemonState::Resolve
                | DaemonState::Reconnect
                | DaemonState::Rejoin
                | DaemonState::ClientReplay
                | DaemonState::Active
                | DaemonState::Stopping
        ) && !oldmap.is_resolving()
            && newmap.is_resolving()
        {
            tracing::debug!("resolve set is {:?}", newmap.get_mds_set(DaemonState::Resolve));
            core.subsystems.mdcache.send_resolves();
        }

        // Everybody finally rejoining?
        if matches!(
            state,
            DaemonState::Rejoin
                | DaemonState::ClientReplay
                | DaemonState::Active
                | DaemonState::Stopping
        ) {
            if !oldmap.is_rejoining() && newmap.is_rejoining() {
                core.subsystems.mdcache.rejoin_joint_start();
            }

            // Peers newly discoverable since the last map.
            if oldstate
                .recovery_index()
                .map(|i| i >= DaemonState::Rejoin.recovery_index().unwrap())
                .unwrap_or(false)
            {
                let old_dis = oldmap.get_discoverable_mds_set();
                for peer in newmap.get_discoverable_mds_set() {
                    if peer != core.whoami && !old_dis.contains(&peer) {
                        core.subsystems.mdcache.kick_discovers(peer);
                    }
                }
            }
        }

        if oldmap.is_degraded()
            && !newmap.is_degraded()
            && matches!(state, DaemonState::Active | DaemonState::Stopping)
        {
            self.inner.clog.info("cluster recovered.");
        }

        // Did someone go active?
        let recovery_notify = matches!(
            oldstate,
            DaemonState::ClientReplay | DaemonState::Active | DaemonState::Stopping
        ) && matches!(
            state,
            DaemonState::ClientReplay | DaemonState::Active | DaemonState::Stopping
        );
        let old_serving = oldmap.get_serving_mds_set();
        for peer in newmap.get_serving_mds_set() {
            if peer != core.whoami && !old_serving.contains(&peer) {
                if recovery_notify {
                    self.handle_mds_recovery(core, peer);
                } else if let Some(waiters) = core.waiting_for_active_peer.remove(&peer) {
                    queue_waiters(waiters, 0);
                }
            }
        }

        // Did someone fail? Newly down ranks first.
        let new_up = newmap.get_up_mds_set();
        for peer in oldmap.get_up_mds_set() {
            if !new_up.contains(&peer) {
                if let Some(addr) = oldmap.get_rank_addr(peer) {
                    self.inner.clients.messenger.mark_down(addr);
                }
                self.handle_mds_failure(core, peer);
            }
        }

        // Then ranks whose address changed (a replacement instance).
        for peer in &new_up {
            if let (Some(old_addr), Some(new_addr)) =
                (oldmap.get_rank_addr(*peer), newmap.get_rank_addr(*peer))
            {
                if oldmap.is_up(*peer) && old_addr != new_addr {
                    self.inner.clients.messenger.mark_down(old_addr);
                    self.handle_mds_failure(core, *peer);
                }
            }
        }

        // Did anyone stop cleanly?
        if matches!(
            state,
            DaemonState::ClientReplay | DaemonState::Active | DaemonState::Stopping
        ) {
            let old_stopped = oldmap.get_stopped_mds_set();
            for peer in newmap.get_stopped_mds_set() {
                if !old_stopped.contains(&peer) {
                    core.subsystems.migrator.handle_peer_stopped(peer);
                }
            }
        }

        if !state.is_any_replay() {
            core.subsystems.balancer.try_rebalance();
        }
    }

    fn handle_mds_recovery(&self, core: &mut MdsCore, who: Rank) {
        tracing::debug!(rank = *who, "handle_mds_recovery");
        core.subsystems.mdcache.handle_peer_recovery(who);
        if core.mdsmap.get_tableserver() == core.whoami {
            core.subsystems.snap_server.handle_peer_recovery(who);
        }
        if let Some(waiters) = core.waiting_for_active_peer.remove(&who) {
            queue_waiters(waiters, 0);
        }
    }

    fn handle_mds_failure(&self, core: &mut MdsCore, who: Rank) {
        if who == core.whoami {
            tracing::debug!("handle_mds_failure for myself; not doing anything");
            return;
        }
        tracing::debug!(rank = *who, "handle_mds_failure");
        core.subsystems.mdcache.handle_peer_failure(who);
        core.subsystems.snap_client.handle_peer_failure(who);
    }

    // -----------------------------------------------------------------------
    // Wanted-state plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn set_want_state(&self, core: &mut MdsCore, state: DaemonState) {
        if core.want_state != state {
            tracing::info!(old = %core.want_state, new = %state, "set_want_state");
        }
        core.want_state = state;
        self.inner.beacon.set_want_state(state);
    }

    async fn request_state(&self, core: &mut MdsCore, state: DaemonState) {
        self.set_want_state(core, state);
        if let Err(e) = self.inner.beacon.send().await {
            tracing::warn!(%e, "state-request beacon failed");
        }
    }

    // -----------------------------------------------------------------------
    // Waiters
    // -----------------------------------------------------------------------

    /// Completion fired once a map with at least `epoch` is accepted.
    pub fn wait_for_mdsmap(&self, core: &mut MdsCore, epoch: Epoch) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        if core.mdsmap.epoch >= epoch {
            let _ = tx.send(0);
        } else {
            core.waiting_for_mdsmap.entry(epoch).or_default().push(tx);
        }
        rx
    }

    /// Completion fired once `rank` enters a serving state.
    pub fn wait_for_active_peer(&self, core: &mut MdsCore, rank: Rank) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        core.waiting_for_active_peer
            .entry(rank)
            .or_default()
            .push(tx);
        rx
    }

    // -----------------------------------------------------------------------
    // OSD epoch barrier
    // -----------------------------------------------------------------------

    pub fn set_osd_epoch_barrier(&self, core: &mut MdsCore, epoch: Epoch) {
        if epoch < core.osd_epoch_barrier {
            tracing::debug!(
                epoch = *epoch,
                current = *core.osd_epoch_barrier,
                "ignoring epoch barrier regression"
            );
            return;
        }
        tracing::debug!(epoch = *epoch, "osd epoch barrier");
        core.osd_epoch_barrier = epoch;
    }

    // -----------------------------------------------------------------------
    // Sessions: kill / evict support
    // -----------------------------------------------------------------------

    /// Close and remove a session. Returns `false` when no such
    /// session exists. Records a session-close event in the journal so
    /// eviction can wait for it to become durable.
    pub fn kill_session_locked(&self, core: &mut MdsCore, name: EntityName) -> bool {
        let Some(mut session) = core.sessions.remove(name) else {
            tracing::debug!(%name, "session not in sessionmap");
            return false;
        };
        tracing::info!(%name, "killing session");
        session.state = SessionState::Closing;
        if let Some(con) = session.connection.take() {
            con.mark_down();
            con.set_entity(None);
        }
        session.state = SessionState::Closed;
        core.mdlog.append_event(64, false);
        true
    }

    // -----------------------------------------------------------------------
    // Authorizer / session binding
    // -----------------------------------------------------------------------

    /// Verify an incoming authorizer and bind or create the session.
    /// Returns `Ok(true)` when the peer is authenticated.
    pub async fn verify_authorizer(
        &self,
        con: &Arc<dyn Connection>,
        authorizer: &Authorizer,
    ) -> Result<bool> {
        let mut core = self.inner.lock.lock().await;
        if core.stopping || core.want_state == DaemonState::Dne {
            return Ok(false);
        }

        let registry = if con.peer_type() == PeerType::Mds {
            &self.inner.auth_cluster
        } else {
            &self.inner.auth_service
        };
        let Some(handler) = registry.get_handler(authorizer.protocol) else {
            tracing::warn!(
                protocol = authorizer.protocol,
                "no authorize handler for protocol"
            );
            return Ok(false);
        };

        let identity = match handler.verify(authorizer) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::debug!(%e, "authorizer rejected");
                return Ok(false);
            }
        };

        let name = EntityName::new(con.peer_type(), identity.global_id);
        let is_new = !core.sessions.contains(name);
        let session = core.sessions.get_or_create(name, con.peer_addr());
        con.set_entity(Some(name));
        if is_new {
            tracing::debug!(%name, "new session");
            session.connection = Some(con.clone());
        } else {
            // Multiple incoming attempts may race; only the winner of
            // the accept event owns the session's connection.
            tracing::debug!(%name, "existing session, deferring connection bind to accept");
        }

        session.caps = match identity.caps.as_deref() {
            Some(caps_str) => match MdsAuthCaps::parse(caps_str) {
                Ok(caps) => caps,
                Err(e) => {
                    tracing::info!(error = %e, caps = caps_str, "auth cap parse error");
                    MdsAuthCaps::legacy()
                }
            },
            None => {
                tracing::debug!(%name, "no auth caps provided, assuming legacy");
                MdsAuthCaps::legacy()
            }
        };
        if identity.allow_all {
            session.caps.set_allow_all();
        }

        Ok(true)
    }

    /// The messenger fully accepted a connection: it wins the race and
    /// owns the session's connection; queued messages drain FIFO.
    pub async fn handle_accept(&self, con: &Arc<dyn Connection>) {
        let mut core = self.inner.lock.lock().await;
        if core.stopping {
            return;
        }
        let Some(name) = con.entity() else {
            tracing::debug!(addr = %con.peer_addr(), "accept without session");
            return;
        };
        let Some(session) = core.sessions.get_mut(name) else {
            return;
        };

        let rebind = match &session.connection {
            Some(existing) => !Arc::ptr_eq(existing, con),
            None => true,
        };
        if rebind {
            tracing::debug!(%name, "binding session connection");
            session.connection = Some(con.clone());
            while let Some(msg) = session.preopen_out_queue.pop_front() {
                con.send_message(msg);
            }
        }
    }

    /// Connection reset from the peer side.
    pub async fn handle_reset(&self, con: &Arc<dyn Connection>) {
        if con.peer_type() != PeerType::Client {
            return;
        }
        let mut core = self.inner.lock.lock().await;
        if core.stopping || core.want_state == DaemonState::Dne {
            return;
        }
        tracing::debug!(addr = %con.peer_addr(), "handle_reset");
        match con.entity().and_then(|name| core.sessions.get(name)) {
            Some(session) if session.is_closed() => {
                con.mark_down();
                con.set_entity(None);
            }
            Some(_) => {}
            None => con.mark_down(),
        }
    }

    /// The peer told us it reset its side of the connection.
    pub async fn handle_remote_reset(&self, con: &Arc<dyn Connection>) {
        if con.peer_type() != PeerType::Client {
            return;
        }
        let mut core = self.inner.lock.lock().await;
        if core.stopping || core.want_state == DaemonState::Dne {
            return;
        }
        tracing::debug!(addr = %con.peer_addr(), "handle_remote_reset");
        if let Some(session) = con.entity().and_then(|name| core.sessions.get(name)) {
            if session.is_closed() {
                con.mark_down();
                con.set_entity(None);
            }
        }
    }

    /// Build an outbound authorizer for connecting to a peer. Waits up
    /// to ten seconds for rotating keys when a fresh one is demanded.
    pub async fn get_authorizer(
        &self,
        peer_type: PeerType,
        force_new: bool,
    ) -> Result<Authorizer> {
        if force_new && self.inner.clients.monc.wait_auth_rotating(10).await.is_err() {
            return make_error_msg(StatusCode::AUTHENTICATION_FAIL, "no authorizer");
        }
        self.inner
            .clients
            .monc
            .build_authorizer(peer_type)
            .ok_or_else(|| Status::with_message(StatusCode::AUTHENTICATION_FAIL, "no authorizer"))
    }

    // -----------------------------------------------------------------------
    // Terminal actions
    // -----------------------------------------------------------------------

    /// Declare this daemon permanently damaged: advertise the damaged
    /// state, flush the operator log, give the monitor one synchronous
    /// beacon, and respawn into standby.
    pub async fn damaged(&self, core: &mut MdsCore) {
        assert!(!core.whoami.is_none());

        self.set_want_state(core, DaemonState::Damaged);
        if let Err(e) = self.inner.clog.flush().await {
            tracing::warn!(%e, "operator log flush failed during damage report");
        }
        self.inner.beacon.notify_health(self.health_report());
        let timeout =
            Duration::from_millis(self.inner.config.snapshot().mon_shutdown_timeout_ms);
        // A timeout is fine: whoever takes the rank next will hit the
        // same damage and report it again.
        if let Err(e) = self.inner.beacon.send_and_wait(timeout).await {
            tracing::warn!(%e, "damaged beacon not acknowledged");
        }

        self.respawn(core);
    }

    /// Voluntary in-process termination. Idempotent through the
    /// `stopping` flag; tears down sub-systems in dependency order.
    pub async fn suicide(&self, core: &mut MdsCore) {
        if core.stopping {
            return;
        }
        core.stopping = true;

        self.set_want_state(core, DaemonState::Dne);

        if !core.mdsmap.is_dne_gid(self.inner.global_id) {
            // Tell the monitor we are dying so it does not wait for us
            // to go laggy; pointless if we are not in the map.
            let _ = self.inner.beacon.send_and_wait(Duration::from_secs(1)).await;
        }

        tracing::info!(
            wanted = %core.want_state,
            state = %core.state,
            "suicide"
        );

        core.subsystems.mdcache.shutdown();
        core.mdlog.shutdown();
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.beacon.shutdown();
        self.inner.clients.messenger.shutdown();
        self.inner.clients.objecter.shutdown();
        self.inner.clients.monc.shutdown();
        self.inner.op_tracker.on_shutdown();
        self.inner.last_heartbeat_ms.store(0, Ordering::Relaxed);
    }

    /// Re-execute ourselves. Never returns in production; the recording
    /// control used by tests returns, so callers must return
    /// immediately afterwards.
    pub(crate) fn respawn(&self, core: &mut MdsCore) {
        tracing::info!(rank = *core.whoami, "respawn");
        self.inner.clients.process.respawn();
    }

    /// `SIGINT`/`SIGTERM`: graceful suicide, once.
    pub async fn handle_signal(&self, signum: i32) {
        tracing::error!(signum, "*** got signal ***");
        let mut core = self.inner.lock.lock().await;
        if core.stopping {
            return;
        }
        self.suicide(&mut core).await;
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub(crate) fn health_report(&self) -> HealthReport {
        let mut metrics = Vec::new();
        let slow = self.inner.op_tracker.check_ops_in_flight();
        if !slow.is_empty() {
            metrics.push(HealthMetric {
                kind: "SLOW_OPS".into(),
                message: format!("{} slow requests", slow.len()),
            });
        }
        HealthReport { metrics }
    }

    /// Periodic maintenance.
    pub async fn tick(&self) {
        self.heartbeat_reset();

        if self.inner.beacon.is_laggy() {
            tracing::debug!("tick bailing out since we seem laggy");
            return;
        }

        let mut core = self.inner.lock.lock().await;
        if core.stopping {
            return;
        }

        // Make sure the journal flushes and trims periodically.
        MdsInner::kick_journal_flush(&self.inner, &mut core);

        let state = core.state;
        if matches!(state, DaemonState::Active | DaemonState::Stopping) {
            core.subsystems.mdcache.trim();
            core.subsystems.mdcache.trim_client_leases();
            core.subsystems.mdcache.check_memory_usage();
            let max_segments = self.inner.config.snapshot().max_log_segments;
            let MdsCore {
                mdlog, subsystems, ..
            } = &mut *core;
            mdlog.trim(subsystems.mdcache.as_mut(), max_segments);
        }

        let load = core.subsystems.balancer.get_load();
        tracing::trace!(load, sessions = core.sessions.len(), "tick stats");

        if matches!(
            state,
            DaemonState::ClientReplay | DaemonState::Active | DaemonState::Stopping
        ) {
            core.subsystems.locker.tick();
            core.subsystems.server.find_idle_sessions();
        }

        if state == DaemonState::Reconnect {
            core.subsystems.server.reconnect_tick();
        }

        if state == DaemonState::Active {
            core.subsystems.balancer.tick();
            core.subsystems.mdcache.find_stale_fragment_freeze();
            core.subsystems.migrator.find_stale_export_freeze();
            core.subsystems.snap_server.check_osd_map(false);
        }
        drop(core);

        self.inner.beacon.notify_health(self.health_report());

        for warning in self.inner.op_tracker.check_ops_in_flight() {
            self.inner.clog.warn(warning);
        }
    }
}
