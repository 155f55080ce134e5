//! Wire-facing data model for the ferrofs metadata server.
//!
//! Everything a daemon reads off the wire or publishes to the monitor is
//! defined here: entity naming, the cluster map, the inbound message
//! envelope, beacons, and administrative commands.

pub mod common;
pub mod mds_map;
pub mod messages;

pub use common::{Address, AddressParseError, EntityName, FeatureSet, PeerType, features};
pub use mds_map::{DaemonState, MdsInfo, MdsMap};
pub use messages::{
    BeaconMsg, CommandDescription, CommandRequest, CommandResult, HealthMetric, HealthReport,
    Message, MessageEnvelope,
};
