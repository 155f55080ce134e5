//! The monitor-published cluster map and the daemon states it carries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use ferrofs_types::{Epoch, GlobalId, Incarnation, Rank};

use crate::common::{Address, FeatureSet};

/// Lifecycle state of a metadata daemon, as recorded in the cluster map.
///
/// The recovery sequence `Replay -> Resolve -> Reconnect -> Rejoin ->
/// ClientReplay -> Active` is ordered; see [`DaemonState::recovery_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DaemonState {
    Boot,
    Standby,
    StandbyReplay,
    OneshotReplay,
    Creating,
    Starting,
    Replay,
    Resolve,
    Reconnect,
    Rejoin,
    ClientReplay,
    Active,
    Stopping,
    Stopped,
    Damaged,
    Dne,
}

impl DaemonState {
    /// Short lower-case name used in logs and status output.
    pub fn name(&self) -> &'static str {
        match self {
            DaemonState::Boot => "boot",
            DaemonState::Standby => "standby",
            DaemonState::StandbyReplay => "standby-replay",
            DaemonState::OneshotReplay => "oneshot-replay",
            DaemonState::Creating => "creating",
            DaemonState::Starting => "starting",
            DaemonState::Replay => "replay",
            DaemonState::Resolve => "resolve",
            DaemonState::Reconnect => "reconnect",
            DaemonState::Rejoin => "rejoin",
            DaemonState::ClientReplay => "clientreplay",
            DaemonState::Active => "active",
            DaemonState::Stopping => "stopping",
            DaemonState::Stopped => "stopped",
            DaemonState::Damaged => "damaged",
            DaemonState::Dne => "dne",
        }
    }

    /// Position within the recovery sequence, `None` for states outside it.
    pub fn recovery_index(&self) -> Option<u8> {
        match self {
            DaemonState::Replay => Some(0),
            DaemonState::Resolve => Some(1),
            DaemonState::Reconnect => Some(2),
            DaemonState::Rejoin => Some(3),
            DaemonState::ClientReplay => Some(4),
            DaemonState::Active => Some(5),
            _ => None,
        }
    }

    /// The successor in the recovery sequence, if any.
    pub fn next_recovery_state(&self) -> Option<DaemonState> {
        match self {
            DaemonState::Replay => Some(DaemonState::Resolve),
            DaemonState::Resolve => Some(DaemonState::Reconnect),
            DaemonState::Reconnect => Some(DaemonState::Rejoin),
            DaemonState::Rejoin => Some(DaemonState::ClientReplay),
            DaemonState::ClientReplay => Some(DaemonState::Active),
            _ => None,
        }
    }

    /// Whether a daemon in this state is replaying a journal.
    pub fn is_any_replay(&self) -> bool {
        matches!(
            self,
            DaemonState::Replay | DaemonState::StandbyReplay | DaemonState::OneshotReplay
        )
    }

    /// Whether this state actively holds a rank.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            DaemonState::Creating
                | DaemonState::Starting
                | DaemonState::Replay
                | DaemonState::Resolve
                | DaemonState::Reconnect
                | DaemonState::Rejoin
                | DaemonState::ClientReplay
                | DaemonState::Active
                | DaemonState::Stopping
        )
    }

    /// Whether peers in this state may be asked to serve discovery.
    pub fn is_discoverable(&self) -> bool {
        matches!(
            self,
            DaemonState::Rejoin | DaemonState::ClientReplay | DaemonState::Active
        )
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a map may move a rank-holding daemon from `old` to `new`.
///
/// Constraints apply only where the protocol demands them:
/// - from `Replay` only `Resolve` or `Reconnect`;
/// - from `Rejoin` only `Active`, `ClientReplay`, or `Stopped`;
/// - from `Reconnect` and `ClientReplay` only the next recovery state.
///
/// Everything else (including `Active -> Stopping -> Stopped`) is legal.
pub fn is_valid_transition(old: DaemonState, new: DaemonState) -> bool {
    if old == new {
        return true;
    }
    match old {
        DaemonState::Replay => {
            matches!(new, DaemonState::Resolve | DaemonState::Reconnect)
        }
        DaemonState::Rejoin => matches!(
            new,
            DaemonState::Active | DaemonState::ClientReplay | DaemonState::Stopped
        ),
        DaemonState::Reconnect | DaemonState::ClientReplay => {
            old.next_recovery_state() == Some(new)
        }
        _ => true,
    }
}

/// Per-daemon record in the cluster map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdsInfo {
    pub global_id: GlobalId,
    pub name: String,
    pub rank: Rank,
    pub incarnation: Incarnation,
    pub state: DaemonState,
    pub addr: Address,
    pub standby_for_rank: Rank,
    pub standby_for_name: String,
}

impl MdsInfo {
    pub fn new(global_id: GlobalId, name: impl Into<String>) -> Self {
        Self {
            global_id,
            name: name.into(),
            rank: Rank::NONE,
            incarnation: Incarnation(0),
            state: DaemonState::Standby,
            addr: Address::default(),
            standby_for_rank: Rank::NONE,
            standby_for_name: String::new(),
        }
    }
}

/// A monotonically versioned snapshot of cluster membership published by
/// the monitor. The daemon only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MdsMap {
    pub epoch: Epoch,
    /// Features every participating daemon must support.
    pub required_features: FeatureSet,
    pub infos: BTreeMap<GlobalId, MdsInfo>,
}

impl MdsMap {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            required_features: FeatureSet::EMPTY,
            infos: BTreeMap::new(),
        }
    }

    pub fn get_epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn get_info_gid(&self, gid: GlobalId) -> Option<&MdsInfo> {
        self.infos.get(&gid)
    }

    /// State recorded for a gid; `Dne` when the gid is not in the map.
    pub fn get_state_gid(&self, gid: GlobalId) -> DaemonState {
        self.infos
            .get(&gid)
            .map(|i| i.state)
            .unwrap_or(DaemonState::Dne)
    }

    pub fn get_rank_gid(&self, gid: GlobalId) -> Rank {
        self.infos.get(&gid).map(|i| i.rank).unwrap_or(Rank::NONE)
    }

    pub fn get_inc_gid(&self, gid: GlobalId) -> Incarnation {
        self.infos
            .get(&gid)
            .map(|i| i.incarnation)
            .unwrap_or(Incarnation(0))
    }

    pub fn is_dne_gid(&self, gid: GlobalId) -> bool {
        !self.infos.contains_key(&gid)
    }

    pub fn find_gid_by_name(&self, name: &str) -> Option<GlobalId> {
        self.infos
            .values()
            .find(|i| i.name == name)
            .map(|i| i.global_id)
    }

    fn info_for_rank(&self, rank: Rank) -> Option<&MdsInfo> {
        self.infos.values().find(|i| i.rank == rank)
    }

    /// Whether the rank is held by a live daemon.
    pub fn is_up(&self, rank: Rank) -> bool {
        rank.is_some()
            && self
                .info_for_rank(rank)
                .map(|i| i.state.is_up())
                .unwrap_or(false)
    }

    /// Whether the rank exists in the cluster at all.
    pub fn is_in(&self, rank: Rank) -> bool {
        rank.is_some() && self.info_for_rank(rank).is_some()
    }

    pub fn get_rank_addr(&self, rank: Rank) -> Option<Address> {
        self.info_for_rank(rank).map(|i| i.addr)
    }

    /// Ranks currently in `state`.
    pub fn get_mds_set(&self, state: DaemonState) -> BTreeSet<Rank> {
        self.infos
            .values()
            .filter(|i| i.rank.is_some() && i.state == state)
            .map(|i| i.rank)
            .collect()
    }

    /// Ranks of live daemons.
    pub fn get_up_mds_set(&self) -> BTreeSet<Rank> {
        self.infos
            .values()
            .filter(|i| i.rank.is_some() && i.state.is_up())
            .map(|i| i.rank)
            .collect()
    }

    /// Ranks recorded as cleanly stopped.
    pub fn get_stopped_mds_set(&self) -> BTreeSet<Rank> {
        self.get_mds_set(DaemonState::Stopped)
    }

    /// Ranks we can send discovery traffic to.
    pub fn get_discoverable_mds_set(&self) -> BTreeSet<Rank> {
        self.infos
            .values()
            .filter(|i| i.rank.is_some() && i.state.is_discoverable())
            .map(|i| i.rank)
            .collect()
    }

    /// Ranks serving or finishing client replay.
    pub fn get_serving_mds_set(&self) -> BTreeSet<Rank> {
        self.infos
            .values()
            .filter(|i| {
                i.rank.is_some()
                    && matches!(i.state, DaemonState::Active | DaemonState::ClientReplay)
            })
            .map(|i| i.rank)
            .collect()
    }

    pub fn is_resolving(&self) -> bool {
        self.infos
            .values()
            .any(|i| i.state == DaemonState::Resolve)
    }

    pub fn is_rejoining(&self) -> bool {
        self.infos.values().any(|i| i.state == DaemonState::Rejoin)
    }

    /// The cluster is degraded while any rank-holding daemon has not
    /// reached a steady state.
    pub fn is_degraded(&self) -> bool {
        self.infos.values().any(|i| {
            i.rank.is_some()
                && !matches!(
                    i.state,
                    DaemonState::Active | DaemonState::Stopping | DaemonState::Stopped
                )
        })
    }

    /// The rank responsible for the snapshot table.
    pub fn get_tableserver(&self) -> Rank {
        Rank(0)
    }
}
