//! Periodic liveness + desired-state advertisement to the monitor.

use std::sync::Arc;

use parking_lot::Mutex;

use ferrofs_proto::{BeaconMsg, DaemonState, HealthReport};
use ferrofs_types::{
    BeaconSeq, Duration, Epoch, GlobalId, Rank, Result, Status, StatusCode, UtcTime,
};

use crate::subsystems::MonitorClient;

struct BeaconState {
    global_id: GlobalId,
    next_seq: u64,
    last_acked_seq: BeaconSeq,
    last_acked_at: UtcTime,
    grace: Duration,
    want_state: DaemonState,
    map_epoch: Epoch,
    standby_for_rank: Rank,
    standby_for_name: String,
    health: HealthReport,
    shutdown: bool,
}

/// Beacon agent. Small internal lock only; never takes the daemon lock.
pub struct Beacon {
    name: String,
    monc: Arc<dyn MonitorClient>,
    state: Mutex<BeaconState>,
}

impl Beacon {
    pub fn new(
        name: impl Into<String>,
        monc: Arc<dyn MonitorClient>,
        global_id: GlobalId,
        want_state: DaemonState,
        standby_for_rank: Rank,
        standby_for_name: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            monc,
            state: Mutex::new(BeaconState {
                global_id,
                next_seq: 1,
                last_acked_seq: BeaconSeq(0),
                last_acked_at: UtcTime::now(),
                grace,
                want_state,
                map_epoch: Epoch::ZERO,
                standby_for_rank,
                standby_for_name: standby_for_name.into(),
                health: HealthReport::default(),
                shutdown: false,
            }),
        }
    }

    /// Record the epoch of a newly accepted cluster map so every beacon
    /// emitted afterwards reflects it.
    pub fn notify_mdsmap(&self, epoch: Epoch) {
        self.state.lock().map_epoch = epoch;
    }

    pub fn set_want_state(&self, state: DaemonState) {
        self.state.lock().want_state = state;
    }

    pub fn want_state(&self) -> DaemonState {
        self.state.lock().want_state
    }

    pub fn notify_health(&self, health: HealthReport) {
        self.state.lock().health = health;
    }

    pub fn last_acked_seq(&self) -> BeaconSeq {
        self.state.lock().last_acked_seq
    }

    /// The monitor has not acknowledged a beacon within the grace
    /// period.
    pub fn is_laggy(&self) -> bool {
        let state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.last_acked_at.elapsed() > state.grace
    }

    fn build_msg(&self) -> Option<BeaconMsg> {
        let mut state = self.state.lock();
        if state.shutdown {
            return None;
        }
        let seq = BeaconSeq(state.next_seq);
        state.next_seq += 1;
        Some(BeaconMsg {
            name: self.name.clone(),
            global_id: state.global_id,
            seq,
            want_state: state.want_state,
            map_epoch: state.map_epoch,
            standby_for_rank: state.standby_for_rank,
            standby_for_name: state.standby_for_name.clone(),
            health: state.health.clone(),
        })
    }

    /// Send one beacon and record the acknowledgement.
    pub async fn send(&self) -> Result<()> {
        let Some(msg) = self.build_msg() else {
            return Ok(());
        };
        let seq = msg.seq;
        tracing::debug!(seq = *seq, state = %msg.want_state, epoch = *msg.map_epoch, "sending beacon");
        self.monc.send_beacon(msg).await?;
        let mut state = self.state.lock();
        if seq > state.last_acked_seq {
            state.last_acked_seq = seq;
            state.last_acked_at = UtcTime::now();
        }
        Ok(())
    }

    /// Synchronous send for shutdown notification; timeout is
    /// non-fatal for the caller.
    pub async fn send_and_wait(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout.into(), self.send()).await {
            Ok(r) => r,
            Err(_) => Err(Status::with_message(
                StatusCode::TIMEOUT,
                format!("beacon not acknowledged within {}", timeout),
            )),
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::StubMonitorClient;

    fn beacon(monc: Arc<StubMonitorClient>) -> Beacon {
        Beacon::new(
            "mds-a",
            monc,
            GlobalId(4400),
            DaemonState::Boot,
            Rank::NONE,
            "",
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_send_carries_current_state() {
        let monc = Arc::new(StubMonitorClient::new());
        let b = beacon(monc.clone());
        b.set_want_state(DaemonState::Standby);
        b.notify_mdsmap(Epoch(7));
        b.send().await.unwrap();

        let sent = monc.sent_beacons();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].want_state, DaemonState::Standby);
        assert_eq!(sent[0].map_epoch, Epoch(7));
        assert_eq!(sent[0].seq, BeaconSeq(1));
        assert_eq!(b.last_acked_seq(), BeaconSeq(1));
    }

    #[tokio::test]
    async fn test_seq_increments() {
        let monc = Arc::new(StubMonitorClient::new());
        let b = beacon(monc.clone());
        b.send().await.unwrap();
        b.send().await.unwrap();
        let sent = monc.sent_beacons();
        assert_eq!(sent[0].seq, BeaconSeq(1));
        assert_eq!(sent[1].seq, BeaconSeq(2));
    }

    #[tokio::test]
    async fn test_laggy_when_unacked() {
        let monc = Arc::new(StubMonitorClient::new());
        monc.fail_beacons(true);
        let b = beacon(monc.clone());
        assert!(!b.is_laggy());

        assert!(b.send().await.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert!(b.is_laggy());

        // A successful ack clears lagginess.
        monc.fail_beacons(false);
        b.send().await.unwrap();
        assert!(!b.is_laggy());
    }

    #[tokio::test]
    async fn test_send_and_wait_timeout() {
        let monc = Arc::new(StubMonitorClient::new());
        monc.delay_beacons_ms(500);
        let b = beacon(monc.clone());
        let err = b.send_and_wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::TIMEOUT);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sends() {
        let monc = Arc::new(StubMonitorClient::new());
        let b = beacon(monc.clone());
        b.shutdown();
        b.send().await.unwrap();
        assert!(monc.sent_beacons().is_empty());
        assert!(!b.is_laggy());
    }
}
