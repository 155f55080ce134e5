strong_type!(Rank, i32);
strong_type!(GlobalId, u64);
strong_type!(Epoch, u64);
strong_type!(Incarnation, u32);
strong_type!(SegmentSeq, u64);
strong_type!(SessionId, u64);
strong_type!(BeaconSeq, u64);

impl Rank {
    /// The unassigned rank.
    pub const NONE: Rank = Rank(-1);

    /// Whether this rank is unassigned.
    pub fn is_none(&self) -> bool {
        *self == Rank::NONE
    }

    /// Whether this rank holds a real cluster position.
    pub fn is_some(&self) -> bool {
        self.0 >= 0
    }
}

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_none() {
        assert!(Rank::NONE.is_none());
        assert!(!Rank::NONE.is_some());
        assert!(Rank(0).is_some());
        assert!(Rank(5).is_some());
        assert_eq!(format!("{:?}", Rank::NONE), "Rank(-1)");
    }

    #[test]
    fn test_epoch_ordering() {
        assert!(Epoch::ZERO < Epoch(1));
        assert!(Epoch(7) < Epoch(8));
        assert_eq!(Epoch::default(), Epoch::ZERO);
    }

    #[test]
    fn test_global_id() {
        let gid = GlobalId(4400);
        assert_eq!(*gid, 4400u64);
        let raw: u64 = gid.into();
        assert_eq!(raw, 4400);
    }

    #[test]
    fn test_incarnation_serde() {
        let inc = Incarnation(3);
        let json = serde_json::to_string(&inc).unwrap();
        assert_eq!(json, "3");
        let parsed: Incarnation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, inc);
    }
}
