//! Metadata-server daemon core: cluster-map driven lifecycle, message
//! dispatch under a single process-wide lock, journal-flush
//! coordination, and authorizer/session binding.
//!
//! The metadata cache, balancer, migrator, snapshot tables, object
//! client, monitor client, and transport are collaborators reached
//! through the traits in [`subsystems`]; in-memory implementations for
//! the server binary and tests live in [`stubs`].

pub mod admin;
pub mod auth;
pub mod beacon;
pub mod clog;
pub mod config;
pub mod daemon;
pub mod flush;
pub mod mdlog;
pub mod op_tracker;
pub mod session;
pub mod stubs;
pub mod subsystems;
pub mod testing;

pub use admin::DeferredAction;
pub use beacon::Beacon;
pub use clog::{ClogRouting, OperatorLog};
pub use config::MdsConfig;
pub use daemon::{Mds, MdsCore};
pub use mdlog::{JournalHead, LogSegment, MdsLog, SegmentState};
pub use op_tracker::OpTracker;
pub use session::{MdsAuthCaps, Session, SessionMap, SessionState};
pub use subsystems::{
    Balancer, Connection, FragId, JournalBackend, Locker, MdsWaiter, Messenger, MetadataCache,
    Migrator, MonitorClient, ObjectClient, ProcessControl, RankDispatcher, Server, SharedClients,
    SnapClient, SnapServer, SubtreeInfo, Subsystems,
};
