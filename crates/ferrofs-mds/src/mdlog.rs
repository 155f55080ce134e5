//! In-memory journal bookkeeping: segments, durability positions, and
//! the waiter queues the flush protocol relies on.
//!
//! A segment passes through `Open -> Sealed -> Expiring -> Expired` and
//! is finally removed by trimming. Durability itself is delegated to
//! the [`JournalBackend`](crate::subsystems::JournalBackend); this
//! module only tracks positions and completions.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use ferrofs_types::SegmentSeq;

use crate::subsystems::{MdsWaiter, MetadataCache, queue_waiters};

/// On-disk journal head record: where a future reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalHead {
    pub expire_pos: u64,
    pub trim_pos: u64,
    pub write_pos: u64,
}

/// Lifecycle of a journal segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Sealed,
    Expiring,
    Expired,
}

/// One unit of the write-ahead journal.
pub struct LogSegment {
    pub seq: SegmentSeq,
    pub offset: u64,
    pub len: u64,
    pub state: SegmentState,
    /// Metadata written in this segment has not been written back yet.
    dirty: bool,
    expiry_waiters: Vec<MdsWaiter>,
}

impl LogSegment {
    fn new(seq: SegmentSeq, offset: u64) -> Self {
        Self {
            seq,
            offset,
            len: 0,
            state: SegmentState::Open,
            dirty: false,
            expiry_waiters: Vec::new(),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Journal state owned by the daemon core, mutated only under the
/// process-wide lock.
pub struct MdsLog {
    segments: BTreeMap<SegmentSeq, LogSegment>,
    next_seq: u64,
    safe_pos: u64,
    trim_pos: u64,
    on_disk_head: JournalHead,
    /// Waiters keyed by the write position they need durable.
    safe_waiters: Vec<(u64, MdsWaiter)>,
    flush_in_flight: bool,
}

impl MdsLog {
    pub fn new() -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(SegmentSeq(1), LogSegment::new(SegmentSeq(1), 0));
        Self {
            segments,
            next_seq: 2,
            safe_pos: 0,
            trim_pos: 0,
            on_disk_head: JournalHead::default(),
            safe_waiters: Vec::new(),
            flush_in_flight: false,
        }
    }

    fn open_segment_mut(&mut self) -> &mut LogSegment {
        // There is always exactly one open segment, at the tail.
        self.segments
            .values_mut()
            .next_back()
            .expect("journal always has an open segment")
    }

    /// Record an event of `len` bytes in the open segment. `dirty`
    /// marks the segment as pinning not-yet-written-back metadata.
    pub fn append_event(&mut self, len: u64, dirty: bool) {
        let seg = self.open_segment_mut();
        seg.len += len;
        if dirty {
            seg.dirty = true;
        }
    }

    /// Clear the dirty pin on a segment (metadata written back).
    pub fn clean_segment(&mut self, seq: SegmentSeq) {
        if let Some(seg) = self.segments.get_mut(&seq) {
            seg.dirty = false;
        }
    }

    pub fn write_pos(&self) -> u64 {
        self.segments
            .values()
            .next_back()
            .map(|s| s.end())
            .unwrap_or(0)
    }

    pub fn safe_pos(&self) -> u64 {
        self.safe_pos
    }

    /// Offset of the first byte that may still be needed on replay.
    pub fn expire_pos(&self) -> u64 {
        for seg in self.segments.values() {
            if seg.state != SegmentState::Expired {
                return seg.offset;
            }
        }
        self.write_pos()
    }

    pub fn trim_pos(&self) -> u64 {
        self.trim_pos
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn current_segment_seq(&self) -> SegmentSeq {
        self.segments
            .values()
            .next_back()
            .map(|s| s.seq)
            .expect("journal always has an open segment")
    }

    pub fn segment_state(&self, seq: SegmentSeq) -> Option<SegmentState> {
        self.segments.get(&seq).map(|s| s.state)
    }

    /// Seal the open segment and start a new one. All previously open
    /// records become candidates for expiry once durable.
    pub fn start_new_segment(&mut self) -> SegmentSeq {
        let write_pos = self.write_pos();
        self.open_segment_mut().state = SegmentState::Sealed;

        let seq = SegmentSeq(self.next_seq);
        self.next_seq += 1;
        self.segments.insert(seq, LogSegment::new(seq, write_pos));
        seq
    }

    /// Register for "everything written so far is durable". Fires
    /// immediately when already satisfied.
    pub fn wait_for_safe(&mut self) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        let target = self.write_pos();
        if self.safe_pos >= target {
            let _ = tx.send(0);
        } else {
            self.safe_waiters.push((target, tx));
        }
        rx
    }

    pub fn needs_flush(&self) -> bool {
        self.safe_pos < self.write_pos()
    }

    pub fn flush_in_flight(&self) -> bool {
        self.flush_in_flight
    }

    pub fn has_safe_waiters(&self) -> bool {
        !self.safe_waiters.is_empty()
    }

    pub fn set_flush_in_flight(&mut self) {
        self.flush_in_flight = true;
    }

    /// Durability advanced to `pos`; fire satisfied safe-waiters in
    /// registration order.
    pub fn mark_safe(&mut self, pos: u64) {
        self.flush_in_flight = false;
        if pos > self.safe_pos {
            self.safe_pos = pos;
        }
        let safe = self.safe_pos;
        let (ready, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.safe_waiters)
                .into_iter()
                .partition(|(target, _)| *target <= safe);
        self.safe_waiters = pending;
        queue_waiters(ready.into_iter().map(|(_, w)| w).collect(), 0);
    }

    /// A flush attempt failed; every pending safe-waiter observes the
    /// error code.
    pub fn fail_safe_waiters(&mut self, code: i32) {
        self.flush_in_flight = false;
        let waiters = std::mem::take(&mut self.safe_waiters);
        queue_waiters(waiters.into_iter().map(|(_, w)| w).collect(), code);
    }

    /// Move every sealed-and-durable segment into expiry. Segments the
    /// cache reports clean expire immediately; dirty ones enter
    /// `Expiring` and complete through [`MdsLog::segment_expired`].
    pub fn trim_all(&mut self, cache: &mut dyn MetadataCache) {
        let seqs: Vec<SegmentSeq> = self
            .segments
            .values()
            .filter(|s| s.state == SegmentState::Sealed && s.end() <= self.safe_pos)
            .map(|s| s.seq)
            .collect();
        for seq in seqs {
            self.start_expiry(seq, cache);
        }
    }

    fn start_expiry(&mut self, seq: SegmentSeq, cache: &mut dyn MetadataCache) {
        let clean = {
            let seg = &self.segments[&seq];
            !seg.dirty
        };
        if clean || cache.start_segment_expiry(seq) {
            self.segment_expired(seq);
        } else {
            self.segments.get_mut(&seq).unwrap().state = SegmentState::Expiring;
        }
    }

    pub fn get_expiring_segments(&self) -> Vec<SegmentSeq> {
        self.segments
            .values()
            .filter(|s| s.state == SegmentState::Expiring)
            .map(|s| s.seq)
            .collect()
    }

    /// Register for a segment's expiry. Fires immediately when the
    /// segment is already expired; `None` for an unknown segment.
    pub fn wait_for_expiry(&mut self, seq: SegmentSeq) -> Option<oneshot::Receiver<i32>> {
        let seg = self.segments.get_mut(&seq)?;
        let (tx, rx) = oneshot::channel();
        if seg.state == SegmentState::Expired {
            let _ = tx.send(0);
        } else {
            seg.expiry_waiters.push(tx);
        }
        Some(rx)
    }

    /// The cache finished writing back a segment's metadata. Expiry is
    /// not allowed to fail, so waiters always observe success.
    pub fn segment_expired(&mut self, seq: SegmentSeq) {
        if let Some(seg) = self.segments.get_mut(&seq) {
            seg.state = SegmentState::Expired;
            seg.dirty = false;
            queue_waiters(std::mem::take(&mut seg.expiry_waiters), 0);
        }
    }

    /// Drop the leading run of expired segments and advance `trim_pos`.
    pub fn trim_expired_segments(&mut self) {
        while let Some((&seq, seg)) = self.segments.iter().next() {
            if seg.state != SegmentState::Expired {
                break;
            }
            // Never remove the open tail.
            if self.segments.len() == 1 {
                break;
            }
            let end = seg.end();
            self.segments.remove(&seq);
            self.trim_pos = end;
        }
    }

    /// Periodic trim: bound the number of retained segments by starting
    /// expiry on the oldest durable ones and dropping the expired run.
    pub fn trim(&mut self, cache: &mut dyn MetadataCache, max_segments: usize) {
        let excess = self.segments.len().saturating_sub(max_segments);
        if excess > 0 {
            let seqs: Vec<SegmentSeq> = self
                .segments
                .values()
                .filter(|s| s.state == SegmentState::Sealed && s.end() <= self.safe_pos)
                .map(|s| s.seq)
                .take(excess)
                .collect();
            for seq in seqs {
                self.start_expiry(seq, cache);
            }
        }
        self.trim_expired_segments();
    }

    /// The head record to persist: positions as currently trimmed.
    pub fn head(&self) -> JournalHead {
        JournalHead {
            expire_pos: self.expire_pos(),
            trim_pos: self.trim_pos,
            write_pos: self.write_pos(),
        }
    }

    pub fn on_disk_head(&self) -> JournalHead {
        self.on_disk_head
    }

    pub fn note_head_written(&mut self, head: JournalHead) {
        self.on_disk_head = head;
    }

    /// Abort all pending waits; used on daemon teardown.
    pub fn shutdown(&mut self) {
        let code = -libc::ESHUTDOWN;
        self.fail_safe_waiters(code);
        let seqs: Vec<SegmentSeq> = self.segments.keys().copied().collect();
        for seq in seqs {
            let seg = self.segments.get_mut(&seq).unwrap();
            queue_waiters(std::mem::take(&mut seg.expiry_waiters), code);
        }
    }
}

impl Default for MdsLog {
    fn default() -> Self {
        Self::new()
    }
}
