//! End-to-end scenarios for the daemon lifecycle: boot to active,
//! eviction, displacement, racing journal flush, illegal transitions,
//! and the authorizer accept race.

use std::sync::Arc;

use ferrofs_mds::auth::{AUTH_PROTOCOL_SHARED_KEY, Authorizer};
use ferrofs_mds::config::MdsConfig;
use ferrofs_mds::subsystems::Connection;
use ferrofs_mds::testing::TestMds;
use ferrofs_proto::{DaemonState, EntityName, FeatureSet, Message};
use ferrofs_types::{Epoch, GlobalId, Rank};

#[tokio::test]
async fn test_clean_boot_to_active() {
    let h = TestMds::new().await;
    h.objecter.set_epoch(Epoch(42));

    let final_epoch = h.boot_to_active(0).await;

    assert_eq!(h.mds.current_state().await, DaemonState::Active);
    assert_eq!(h.mds.current_rank().await, Rank(0));
    assert_eq!(h.mds.current_epoch().await, Epoch(final_epoch));

    // Entry actions fired once per recovery step, in order.
    assert_eq!(
        h.cache.entry_actions(),
        vec![
            "replay_start",
            "resolve_start",
            "reconnect_start",
            "rejoin_start",
            "active_start",
        ]
    );

    // Going active raised the barrier to the current OSD epoch.
    assert_eq!(h.mds.osd_epoch_barrier().await, Epoch(42));

    // The incarnation was pushed into the object client for fencing.
    assert_eq!(*h.objecter.client_incarnation(), 1);

    // The beacon advertises Active at the final epoch.
    h.mds.beacon().send().await.unwrap();
    let beacon = h.monc.last_beacon().unwrap();
    assert_eq!(beacon.want_state, DaemonState::Active);
    assert_eq!(beacon.map_epoch, Epoch(final_epoch));
}

#[tokio::test]
async fn test_duplicate_epoch_is_noop() {
    let h = TestMds::new().await;
    let map = h
        .map_builder()
        .epoch(1)
        .up(h.gid, "mds-a", 0, DaemonState::Replay)
        .build();
    h.accept_map(map.clone()).await;
    h.accept_map(map).await;

    // Entry action ran exactly once.
    assert_eq!(h.cache.entry_actions(), vec!["replay_start"]);
    assert_eq!(h.mds.current_epoch().await, Epoch(1));
}

#[tokio::test]
async fn test_incompatible_features_suicide() {
    let h = TestMds::new().await;
    let future_bit = 1u64 << 40;
    h.accept_map(
        h.map_builder()
            .epoch(1)
            .required_features(FeatureSet(future_bit))
            .up(h.gid, "mds-a", 0, DaemonState::Replay)
            .build(),
    )
    .await;

    assert!(h.mds.is_stopping().await);
    assert_eq!(h.process.respawn_count(), 0);
}

#[tokio::test]
async fn test_rank_reassignment_respawns() {
    let h = TestMds::new().await;
    h.accept_map(
        h.map_builder()
            .epoch(1)
            .up(h.gid, "mds-a", 0, DaemonState::Replay)
            .build(),
    )
    .await;
    assert_eq!(h.mds.current_rank().await, Rank(0));

    h.accept_map(
        h.map_builder()
            .epoch(2)
            .up(h.gid, "mds-a", 1, DaemonState::Replay)
            .build(),
    )
    .await;

    assert_eq!(h.process.respawn_count(), 1);
    assert!(!h.mds.is_stopping().await);
}

#[tokio::test]
async fn test_evicted_from_map_respawns() {
    let h = TestMds::new().await;
    h.boot_to_active(1).await;

    // A newer map without our gid and no name claim.
    h.accept_map(
        h.map_builder()
            .epoch(10)
            .up(GlobalId(5000), "mds-b", 0, DaemonState::Active)
            .build(),
    )
    .await;

    assert_eq!(h.process.respawn_count(), 1);
    assert!(!h.mds.is_stopping().await);
}

#[tokio::test]
async fn test_displaced_by_fresher_instance_suicides() {
    let h = TestMds::new().await;
    h.boot_to_active(1).await;

    // Our name reappears under a larger gid: do not fight for the slot.
    h.accept_map(
        h.map_builder()
            .epoch(10)
            .up(GlobalId(9999), "mds-a", 1, DaemonState::Replay)
            .build(),
    )
    .await;

    assert!(h.mds.is_stopping().await);
    assert_eq!(h.process.respawn_count(), 0);
}

#[tokio::test]
async fn test_displacement_check_respects_config() {
    let mut cfg = MdsConfig::default();
    cfg.enforce_unique_name = false;
    let h = TestMds::with_config(cfg).await;
    h.boot_to_active(1).await;

    h.accept_map(
        h.map_builder()
            .epoch(10)
            .up(GlobalId(9999), "mds-a", 1, DaemonState::Replay)
            .build(),
    )
    .await;

    // Without the unique-name check this is an ordinary eviction.
    assert_eq!(h.process.respawn_count(), 1);
    assert!(!h.mds.is_stopping().await);
}

#[tokio::test]
async fn test_illegal_transition_respawns() {
    let h = TestMds::new().await;
    h.accept_map(
        h.map_builder()
            .epoch(1)
            .up(h.gid, "mds-a", 0, DaemonState::Replay)
            .build(),
    )
    .await;

    // Replay may not jump straight to Active.
    h.accept_map(
        h.map_builder()
            .epoch(2)
            .up(h.gid, "mds-a", 0, DaemonState::Active)
            .build(),
    )
    .await;

    assert_eq!(h.process.respawn_count(), 1);
    // The invalid transition was reported to the operator log.
    assert!(h.mds.clog().num_pending() > 0);
    // No entry action ran for the bogus target state.
    assert_eq!(h.cache.entry_actions(), vec!["replay_start"]);
}

#[tokio::test]
async fn test_standby_then_reregister_on_drop() {
    let h = TestMds::new().await;
    h.accept_map(h.map_builder().epoch(1).standby(h.gid, "mds-a").build())
        .await;
    assert_eq!(h.mds.current_state().await, DaemonState::Standby);

    // Dropped from the map while wanting standby: back to boot and
    // re-register rather than respawn.
    h.accept_map(
        h.map_builder()
            .epoch(2)
            .up(GlobalId(5000), "mds-b", 0, DaemonState::Active)
            .build(),
    )
    .await;

    assert_eq!(h.mds.current_state().await, DaemonState::Boot);
    assert_eq!(h.mds.beacon().want_state(), DaemonState::Boot);
    assert_eq!(h.process.respawn_count(), 0);
    assert!(!h.mds.is_stopping().await);
}

#[tokio::test]
async fn test_peer_transitions() {
    let h = TestMds::new().await;
    // Us at rank 0 plus a peer at rank 1, both active.
    h.accept_map(
        h.map_builder()
            .epoch(1)
            .up(h.gid, "mds-a", 0, DaemonState::Active)
            .up(GlobalId(5000), "mds-b", 1, DaemonState::Active)
            .build(),
    )
    .await;

    // Peer drops into resolve after a restart elsewhere: the map shows
    // it resolving and we broadcast resolves.
    h.accept_map(
        h.map_builder()
            .epoch(2)
            .up(h.gid, "mds-a", 0, DaemonState::Active)
            .up(GlobalId(5001), "mds-b", 1, DaemonState::Resolve)
            .build(),
    )
    .await;
    assert_eq!(h.cache.state.lock().resolves_sent, 1);
    // The old instance of rank 1 vanished: failure handling fired.
    assert!(h.cache.state.lock().peer_failures.contains(&Rank(1)));
    assert!(h.snap_client.peer_failures.lock().contains(&Rank(1)));

    // Peer comes back up: recovery handling plus the active-peer
    // wait-set fires.
    let rx = h
        .mds
        .with_core(|core| h.mds.wait_for_active_peer(core, Rank(1)))
        .await;
    h.accept_map(
        h.map_builder()
            .epoch(3)
            .up(h.gid, "mds-a", 0, DaemonState::Active)
            .up(GlobalId(5001), "mds-b", 1, DaemonState::Active)
            .build(),
    )
    .await;
    assert_eq!(rx.await.unwrap(), 0);
    assert!(h.cache.state.lock().peer_recoveries.contains(&Rank(1)));

    // Peer stops cleanly: the migrator is told.
    h.accept_map(
        h.map_builder()
            .epoch(4)
            .up(h.gid, "mds-a", 0, DaemonState::Active)
            .up(GlobalId(5001), "mds-b", 1, DaemonState::Stopped)
            .build(),
    )
    .await;
    assert!(h.migrator.state.lock().stopped_peers.contains(&Rank(1)));
}

#[tokio::test]
async fn test_flush_journal_with_racing_writers() {
    let h = TestMds::new().await;
    h.boot_to_active(0).await;

    h.mds
        .with_core(|core| core.mdlog.append_event(500, false))
        .await;
    let (before_write_pos, before_expire_pos) = h
        .mds
        .with_core(|core| (core.mdlog.write_pos(), core.mdlog.expire_pos()))
        .await;

    // Background writers keep appending while the flush runs.
    let writer = {
        let mds = h.mds.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                mds.with_core(|core| core.mdlog.append_event(10, false)).await;
                tokio::task::yield_now().await;
            }
        })
    };

    h.mds.command_flush_journal().await.unwrap();
    writer.await.unwrap();

    h.mds
        .with_core(|core| {
            // Everything written before the call is past the expiry
            // point, and trim caught up with the old expire position.
            assert!(core.mdlog.expire_pos() >= before_write_pos);
            assert!(core.mdlog.trim_pos() >= before_expire_pos);
        })
        .await;

    // The head on disk reflects the trimmed journal.
    let head = *h.journal_backend.written_heads().last().unwrap();
    assert!(head.expire_pos >= before_write_pos);
}

#[tokio::test]
async fn test_force_readonly_then_flush_erofs() {
    let h = TestMds::new().await;
    h.boot_to_active(0).await;

    let result = h
        .mds
        .asok_command("force_readonly", &serde_json::Map::new())
        .await;
    assert!(result.is_ok());
    // Idempotent.
    let result = h
        .mds
        .asok_command("force_readonly", &serde_json::Map::new())
        .await;
    assert!(result.is_ok());

    let result = h
        .mds
        .asok_command("flush journal", &serde_json::Map::new())
        .await;
    assert_eq!(result.return_code, -libc::EROFS);
}

#[tokio::test]
async fn test_authorizer_race_binds_single_winner() {
    let mut cfg = MdsConfig::default();
    cfg.auth_shared_keys = vec!["sekrit".into()];
    let h = TestMds::with_config(cfg).await;
    h.boot_to_active(0).await;

    let client_gid = GlobalId(500);
    let name = EntityName::client(client_gid);

    // A session replayed from the journal: known, but with no live
    // connection, and with messages queued for delivery.
    h.mds
        .with_core(|core| {
            let session = core
                .sessions
                .get_or_create(name, ferrofs_proto::Address::default());
            session.send_message(Message::ClientSession { op: "open".into() });
            session.send_message(Message::ClientSession { op: "renew".into() });
        })
        .await;

    let authorizer = Authorizer {
        protocol: AUTH_PROTOCOL_SHARED_KEY,
        entity: "client.admin".into(),
        global_id: client_gid,
        key: "sekrit".into(),
        caps: Some("allow rw".into()),
        allow_all: false,
    };

    // Two simultaneous connection attempts both verify.
    let con1_stub = h.client_connection();
    let con2_stub = h.client_connection();
    let con1: Arc<dyn Connection> = con1_stub.clone();
    let con2: Arc<dyn Connection> = con2_stub.clone();
    assert!(h.mds.verify_authorizer(&con1, &authorizer).await.unwrap());
    assert!(h.mds.verify_authorizer(&con2, &authorizer).await.unwrap());

    // Neither owns the session until an accept event.
    h.mds
        .with_core(|core| {
            assert!(core.sessions.get(name).unwrap().connection.is_none());
        })
        .await;

    // con2 wins the race.
    h.mds.handle_accept(&con2).await;

    h.mds
        .with_core(|core| {
            let session = core.sessions.get(name).unwrap();
            let bound = session.connection.as_ref().unwrap();
            assert!(Arc::ptr_eq(bound, &con2));
            assert!(session.preopen_out_queue.is_empty());
        })
        .await;

    // The queue drained to the winner, FIFO, exactly once; the loser
    // received nothing.
    let sent: Vec<String> = con2_stub
        .sent_messages()
        .iter()
        .map(|m| match m {
            Message::ClientSession { op } => op.clone(),
            other => panic!("unexpected {:?}", other.type_name()),
        })
        .collect();
    assert_eq!(sent, vec!["open", "renew"]);
    assert!(con1_stub.sent_messages().is_empty());

    // A second accept of the same connection does not re-drain.
    h.mds.handle_accept(&con2).await;
    assert_eq!(con2_stub.sent_messages().len(), 2);
}

#[tokio::test]
async fn test_bad_key_rejected() {
    let mut cfg = MdsConfig::default();
    cfg.auth_shared_keys = vec!["sekrit".into()];
    let h = TestMds::with_config(cfg).await;
    h.boot_to_active(0).await;

    let authorizer = Authorizer {
        protocol: AUTH_PROTOCOL_SHARED_KEY,
        entity: "client.evil".into(),
        global_id: GlobalId(666),
        key: "wrong".into(),
        caps: None,
        allow_all: false,
    };
    let con: Arc<dyn Connection> = h.client_connection();
    assert!(!h.mds.verify_authorizer(&con, &authorizer).await.unwrap());
    // No session was created for the failed attempt.
    assert!(
        h.mds
            .with_core(|core| core.sessions.get(EntityName::client(GlobalId(666))).is_none())
            .await
    );
}

#[tokio::test]
async fn test_reset_detaches_closed_session() {
    let h = TestMds::new().await;
    h.boot_to_active(0).await;

    let name = EntityName::client(GlobalId(700));
    let con: Arc<dyn Connection> = h.client_connection();
    con.set_entity(Some(name));
    h.mds
        .with_core(|core| {
            let session = core.sessions.get_or_create(name, con.peer_addr());
            session.state = ferrofs_mds::SessionState::Closed;
        })
        .await;

    h.mds.handle_reset(&con).await;
    assert!(con.is_down());
    assert!(con.entity().is_none());
}

#[tokio::test]
async fn test_tick_state_gating() {
    let h = TestMds::new().await;

    // Before holding a rank, tick does no cache maintenance.
    h.mds.tick().await;
    assert_eq!(h.cache.state.lock().trims, 0);

    h.boot_to_active(0).await;
    h.mds.tick().await;

    {
        let cache = h.cache.state.lock();
        assert_eq!(cache.trims, 1);
        assert_eq!(cache.lease_trims, 1);
        assert_eq!(cache.memory_checks, 1);
        assert_eq!(cache.stale_frag_scans, 1);
    }
    assert_eq!(h.balancer.state.lock().ticks, 1);
    assert_eq!(h.migrator.state.lock().stale_scans, 1);
    assert!(h.locker.ticks.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    assert_eq!(h.server.state.lock().idle_scans, 1);
    // Active tick polls the snap server without forcing.
    assert_eq!(h.snap_server.state.lock().osd_map_checks, vec![false]);
}

#[tokio::test]
async fn test_tick_skips_when_laggy() {
    let mut cfg = MdsConfig::default();
    cfg.beacon_interval_ms = 10;
    cfg.beacon_grace_ms = 20;
    let h = TestMds::with_config(cfg).await;
    h.boot_to_active(0).await;

    h.monc.fail_beacons(true);
    let _ = h.mds.beacon().send().await;
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    assert!(h.mds.beacon().is_laggy());

    h.mds.tick().await;
    assert_eq!(h.cache.state.lock().trims, 0, "laggy tick must do no work");
}
