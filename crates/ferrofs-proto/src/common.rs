use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use ferrofs_types::GlobalId;

/// The class of peer on the other end of a connection or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerType {
    Monitor,
    Mds,
    ObjectServer,
    Client,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerType::Monitor => write!(f, "mon"),
            PeerType::Mds => write!(f, "mds"),
            PeerType::ObjectServer => write!(f, "osd"),
            PeerType::Client => write!(f, "client"),
        }
    }
}

/// Identity of a peer: its type plus its monitor-assigned global id.
///
/// Sessions are keyed by this pair, so two connection attempts from the
/// same authenticated entity resolve to the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    pub peer_type: PeerType,
    pub global_id: GlobalId,
}

impl EntityName {
    pub fn new(peer_type: PeerType, global_id: GlobalId) -> Self {
        Self {
            peer_type,
            global_id,
        }
    }

    pub fn client(global_id: GlobalId) -> Self {
        Self::new(PeerType::Client, global_id)
    }

    pub fn mds(global_id: GlobalId) -> Self {
        Self::new(PeerType::Mds, global_id)
    }

    pub fn monitor(global_id: GlobalId) -> Self {
        Self::new(PeerType::Monitor, global_id)
    }

    pub fn is_client(&self) -> bool {
        self.peer_type == PeerType::Client
    }

    pub fn is_mds(&self) -> bool {
        self.peer_type == PeerType::Mds
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer_type, self.global_id)
    }
}

/// Network address of a peer, `ip:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IPv4 address in network byte order.
    pub ip: u32,
    pub port: u16,
}

impl Address {
    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::from_octets(0, 0, 0, 0, 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ip_str, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;

        let parts: Vec<&str> = ip_str.split('.').collect();
        if parts.len() != 4 {
            return Err(AddressParseError::InvalidIp);
        }
        let octets: std::result::Result<Vec<u8>, _> = parts.iter().map(|p| p.parse()).collect();
        let octets = octets.map_err(|_| AddressParseError::InvalidIp)?;

        Ok(Address::from_octets(
            octets[0], octets[1], octets[2], octets[3], port,
        ))
    }
}

/// Errors when parsing an `Address` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
    #[error("invalid IP address")]
    InvalidIp,
}

/// Named feature bits carried in the cluster map and advertised by
/// object servers.
pub mod features {
    /// Base protocol support; always set.
    pub const BASE: u64 = 1 << 0;
    /// Object servers can convert legacy tmap objects to omap.
    pub const OSD_OMAP_CONVERSION: u64 = 1 << 1;
    /// Directory-fragment aware peers.
    pub const DIRFRAG: u64 = 1 << 2;
    /// Inline journal-head rewrite.
    pub const JOURNAL_HEAD_V2: u64 = 1 << 3;
}

/// A set of feature bits, used both for what this binary supports and
/// for what a cluster map requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(pub u64);

impl FeatureSet {
    pub const EMPTY: FeatureSet = FeatureSet(0);

    /// Everything this daemon binary implements.
    pub fn supported() -> Self {
        FeatureSet(
            features::BASE
                | features::OSD_OMAP_CONVERSION
                | features::DIRFRAG
                | features::JOURNAL_HEAD_V2,
        )
    }

    pub fn contains(&self, bits: u64) -> bool {
        self.0 & bits == bits
    }

    /// Whether a daemon supporting `self` can participate in a map
    /// requiring `required`.
    pub fn compatible(&self, required: &FeatureSet) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn insert(&mut self, bits: u64) {
        self.0 |= bits;
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_name_display() {
        let n = EntityName::client(GlobalId(4100));
        assert_eq!(format!("{}", n), "client.4100");
        let n = EntityName::mds(GlobalId(17));
        assert_eq!(format!("{}", n), "mds.17");
    }

    #[test]
    fn test_entity_name_keys() {
        use std::collections::HashMap;
        let mut m = HashMap::new();
        m.insert(EntityName::client(GlobalId(1)), "a");
        m.insert(EntityName::mds(GlobalId(1)), "b");
        // Same gid, different type: distinct keys.
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_address_display_parse() {
        let addr = Address::from_octets(10, 1, 2, 3, 6800);
        assert_eq!(format!("{}", addr), "10.1.2.3:6800");
        let parsed: Address = "10.1.2.3:6800".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_address_parse_errors() {
        assert!("1.2.3.4".parse::<Address>().is_err());
        assert!("1.2.3:80".parse::<Address>().is_err());
        assert!("1.2.3.4:99999".parse::<Address>().is_err());
    }

    #[test]
    fn test_feature_set_compat() {
        let supported = FeatureSet::supported();
        let required = FeatureSet(features::BASE | features::DIRFRAG);
        assert!(supported.compatible(&required));

        let future = FeatureSet(features::BASE | (1 << 40));
        assert!(!supported.compatible(&future));

        // An empty requirement is always satisfiable.
        assert!(FeatureSet::EMPTY.compatible(&FeatureSet::EMPTY));
        assert!(supported.compatible(&FeatureSet::EMPTY));
    }

    #[test]
    fn test_feature_set_insert() {
        let mut fs = FeatureSet::EMPTY;
        fs.insert(features::BASE);
        assert!(fs.contains(features::BASE));
        assert!(!fs.contains(features::DIRFRAG));
    }
}
