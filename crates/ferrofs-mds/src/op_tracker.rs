//! In-flight operation tracking with a recent-slow-op history ring.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde_json::{Value, json};

use ferrofs_types::{Duration, UtcTime};

struct TrackedOp {
    id: u64,
    description: String,
    initiated_at: UtcTime,
}

impl TrackedOp {
    fn dump(&self) -> Value {
        json!({
            "id": self.id,
            "description": &self.description,
            "initiated_at": self.initiated_at.to_string(),
            "age": self.initiated_at.elapsed().as_secs_f64(),
        })
    }
}

struct OpTrackerInner {
    next_id: u64,
    in_flight: BTreeMap<u64, TrackedOp>,
    history: VecDeque<TrackedOp>,
    complaint_time: Duration,
    history_size: usize,
}

/// Tracks operations from registration to completion. Operations
/// exceeding the complaint threshold surface as operator warnings;
/// completed slow ops are retained in a bounded ring.
pub struct OpTracker {
    inner: Mutex<OpTrackerInner>,
    pub tracking_enabled: bool,
}

impl OpTracker {
    pub fn new(complaint_time: Duration, history_size: usize) -> Self {
        Self {
            inner: Mutex::new(OpTrackerInner {
                next_id: 1,
                in_flight: BTreeMap::new(),
                history: VecDeque::new(),
                complaint_time,
                history_size,
            }),
            tracking_enabled: true,
        }
    }

    pub fn set_complaint_and_threshold(&self, complaint_time: Duration, history_size: usize) {
        let mut inner = self.inner.lock();
        inner.complaint_time = complaint_time;
        inner.history_size = history_size;
        while inner.history.len() > inner.history_size {
            inner.history.pop_front();
        }
    }

    /// Register a new op; returns its id for `finish_op`.
    pub fn register_op(&self, description: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.in_flight.insert(
            id,
            TrackedOp {
                id,
                description: description.into(),
                initiated_at: UtcTime::now(),
            },
        );
        id
    }

    /// Complete an op. Ops that exceeded the complaint threshold are
    /// kept in the history ring.
    pub fn finish_op(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.in_flight.remove(&id) {
            if op.initiated_at.elapsed() >= inner.complaint_time {
                inner.history.push_back(op);
                while inner.history.len() > inner.history_size {
                    inner.history.pop_front();
                }
            }
        }
    }

    pub fn num_in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn dump_ops_in_flight(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "num_ops": inner.in_flight.len(),
            "ops": inner.in_flight.values().map(|o| o.dump()).collect::<Vec<_>>(),
        })
    }

    pub fn dump_historic_ops(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "num_ops": inner.history.len(),
            "ops": inner.history.iter().map(|o| o.dump()).collect::<Vec<_>>(),
        })
    }

    /// Warnings for in-flight ops older than the complaint threshold.
    pub fn check_ops_in_flight(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .in_flight
            .values()
            .filter(|op| op.initiated_at.elapsed() >= inner.complaint_time)
            .map(|op| {
                format!(
                    "slow request {:.3}s: {}",
                    op.initiated_at.elapsed().as_secs_f64(),
                    op.description
                )
            })
            .collect()
    }

    pub fn on_shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight.clear();
        inner.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_finish() {
        let tracker = OpTracker::new(Duration::from_secs(30), 10);
        let a = tracker.register_op("flush journal");
        let b = tracker.register_op("session evict");
        assert_eq!(tracker.num_in_flight(), 2);

        tracker.finish_op(a);
        assert_eq!(tracker.num_in_flight(), 1);
        // Fast op: not retained in history.
        assert_eq!(tracker.dump_historic_ops()["num_ops"], 0);

        tracker.finish_op(b);
        assert_eq!(tracker.num_in_flight(), 0);
    }

    #[test]
    fn test_dump_in_flight() {
        let tracker = OpTracker::new(Duration::from_secs(30), 10);
        tracker.register_op("export dir");
        let v = tracker.dump_ops_in_flight();
        assert_eq!(v["num_ops"], 1);
        assert_eq!(v["ops"][0]["description"], "export dir");
    }

    #[test]
    fn test_slow_op_warnings_and_history() {
        // Zero threshold: everything counts as slow.
        let tracker = OpTracker::new(Duration::ZERO, 2);
        let a = tracker.register_op("op-a");
        let warnings = tracker.check_ops_in_flight();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("op-a"));

        tracker.finish_op(a);
        assert_eq!(tracker.dump_historic_ops()["num_ops"], 1);

        // History ring is bounded.
        for i in 0..5 {
            let id = tracker.register_op(format!("op-{}", i));
            tracker.finish_op(id);
        }
        assert_eq!(tracker.dump_historic_ops()["num_ops"], 2);
    }

    #[test]
    fn test_finish_unknown_op() {
        let tracker = OpTracker::new(Duration::from_secs(30), 10);
        tracker.finish_op(12345);
        assert_eq!(tracker.num_in_flight(), 0);
    }

    #[test]
    fn test_shutdown_clears() {
        let tracker = OpTracker::new(Duration::ZERO, 10);
        let id = tracker.register_op("x");
        tracker.finish_op(id);
        tracker.register_op("y");
        tracker.on_shutdown();
        assert_eq!(tracker.num_in_flight(), 0);
        assert_eq!(tracker.dump_historic_ops()["num_ops"], 0);
    }
}
