//! The `flush journal` coordinator.
//!
//! Contract: after a successful return every record written before the
//! call is durable and the on-disk journal head has advanced past all
//! prior segments. The step ordering is load-bearing; see the comments
//! at each stage.

use tokio::sync::{MutexGuard, oneshot};

use ferrofs_proto::DaemonState;
use ferrofs_types::{JournalCode, Result, SegmentSeq, Status, StatusCode, make_error_msg};

use crate::daemon::{Mds, MdsCore, MdsInner};

fn errno_text(code: i32) -> String {
    std::io::Error::from_raw_os_error(-code).to_string()
}

impl Mds {
    /// One durability barrier: register for safety, kick the flush,
    /// wait with the lock released, reacquire.
    async fn flush_barrier<'a>(
        &'a self,
        mut core: MutexGuard<'a, MdsCore>,
    ) -> Result<MutexGuard<'a, MdsCore>> {
        let rx = core.mdlog.wait_for_safe();
        MdsInner::kick_journal_flush(&self.inner, &mut core);
        drop(core);

        let r = rx.await.unwrap_or(-libc::ECANCELED);
        let core = self.inner.lock.lock().await;
        if r != 0 {
            return Err(Status::with_message(
                JournalCode::FLUSH_FAILED,
                format!("Error {} ({}) while flushing journal", r, errno_text(r)),
            ));
        }
        Ok(core)
    }

    /// Flush the journal and trim it down to the freshly opened
    /// segment, rewriting the on-disk head last.
    pub async fn command_flush_journal(&self) -> Result<()> {
        let mut core = self.inner.lock.lock().await;

        if core.subsystems.mdcache.is_readonly() {
            tracing::debug!("flush journal: read-only FS");
            return make_error_msg(StatusCode::READ_ONLY_MODE, "read-only filesystem");
        }
        if core.state != DaemonState::Active {
            tracing::debug!("flush journal: not active, no-op");
            return Ok(());
        }

        // Seal off the current segment so every older segment becomes
        // a candidate for expiry. New writes land in the new segment.
        core.mdlog.start_new_segment();

        // First barrier: everything sealed is durable before trim.
        core = self.flush_barrier(core).await?;

        // Our continuation on the first barrier may not have been the
        // last one registered; later continuations can dirty metadata
        // in older segments while we run. The second barrier
        // guarantees no such race remains before expiry begins.
        core = self.flush_barrier(core).await?;

        // Move every old segment into expiring or expired state.
        tracing::debug!("flush journal: beginning segment expiry");
        {
            let MdsCore {
                mdlog, subsystems, ..
            } = &mut *core;
            mdlog.trim_all(subsystems.mdcache.as_mut());
        }

        // Wait for every expiring segment, lock released.
        let receivers: Vec<_> = core
            .mdlog
            .get_expiring_segments()
            .into_iter()
            .filter_map(|seq| core.mdlog.wait_for_expiry(seq))
            .collect();
        tracing::debug!(
            segments = receivers.len(),
            "flush journal: waiting for segments to expire"
        );
        if !receivers.is_empty() {
            drop(core);
            for rx in receivers {
                let r = rx.await.unwrap_or(-libc::ECANCELED);
                // Expiry is not allowed to raise errors.
                assert_eq!(r, 0, "segment expiry returned {}", r);
            }
            core = self.inner.lock.lock().await;
        }

        tracing::debug!(
            expire_pos = core.mdlog.expire_pos(),
            trim_pos = core.mdlog.trim_pos(),
            "flush journal: expiry complete"
        );

        // Remove the expired segments' in-memory entries.
        core.mdlog.trim_expired_segments();

        tracing::debug!(
            expire_pos = core.mdlog.expire_pos(),
            trim_pos = core.mdlog.trim_pos(),
            "flush journal: trim complete"
        );

        // Rewrite the journal head so a future reader starts from
        // after the flushed region. Only after trim, so the head never
        // moves ahead of it.
        let head = core.mdlog.head();
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let code = match inner.clients.journal_backend.write_head(head).await {
                Ok(()) => {
                    let mut core = inner.lock.lock().await;
                    core.mdlog.note_head_written(head);
                    0
                }
                Err(status) => {
                    tracing::error!(%status, "journal head write failed");
                    status.errno()
                }
            };
            let _ = tx.send(code);
        });
        drop(core);

        let r = rx.await.unwrap_or(-libc::ECANCELED);
        if r != 0 {
            return Err(Status::with_message(
                JournalCode::WRITE_HEAD_FAILED,
                format!("Error {} ({}) while writing journal head", r, errno_text(r)),
            ));
        }

        tracing::debug!("flush journal: write_head complete, all done");
        Ok(())
    }

    /// Completion path for segment expiry driven by the cache's
    /// writeback machinery.
    pub async fn journal_segment_expired(&self, seq: SegmentSeq) {
        let mut core = self.inner.lock.lock().await;
        core.mdlog.segment_expired(seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestMds;
    use ferrofs_types::StatusCode;

    #[tokio::test]
    async fn test_flush_noop_when_not_active() {
        let h = TestMds::new().await;
        h.mds
            .with_core(|core| core.mdlog.append_event(100, false))
            .await;
        h.mds.command_flush_journal().await.unwrap();
        // Nothing persisted, nothing trimmed: the daemon was not active.
        assert_eq!(h.journal_backend.persisted_upto(), 0);
        assert!(h.journal_backend.written_heads().is_empty());
    }

    #[tokio::test]
    async fn test_flush_rejected_when_readonly() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.mds
            .with_core(|core| core.subsystems.mdcache.force_readonly())
            .await;
        let err = h.mds.command_flush_journal().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::READ_ONLY_MODE);
    }

    #[tokio::test]
    async fn test_flush_basic() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.mds
            .with_core(|core| {
                core.mdlog.append_event(100, false);
                core.mdlog.append_event(50, false);
            })
            .await;

        h.mds.command_flush_journal().await.unwrap();

        assert_eq!(h.journal_backend.persisted_upto(), 150);
        let heads = h.journal_backend.written_heads();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].expire_pos, 150);
        assert_eq!(heads[0].trim_pos, 150);

        h.mds
            .with_core(|core| {
                // Only the freshly opened segment remains.
                assert_eq!(core.mdlog.num_segments(), 1);
                assert_eq!(core.mdlog.on_disk_head(), heads[0]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_flush_twice_is_idempotent() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.mds
            .with_core(|core| core.mdlog.append_event(100, false))
            .await;

        h.mds.command_flush_journal().await.unwrap();
        let first_head = *h.journal_backend.written_heads().last().unwrap();

        h.mds.command_flush_journal().await.unwrap();
        let second_head = *h.journal_backend.written_heads().last().unwrap();

        // Second flush found nothing to expire; positions unchanged.
        assert_eq!(first_head.expire_pos, second_head.expire_pos);
        assert_eq!(first_head.trim_pos, second_head.trim_pos);
        assert_eq!(first_head.write_pos, second_head.write_pos);
    }

    #[tokio::test]
    async fn test_flush_waits_for_dirty_segment_expiry() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.cache.set_hold_expiry(true);

        let seq = h
            .mds
            .with_core(|core| {
                core.mdlog.append_event(100, true);
                core.mdlog.current_segment_seq()
            })
            .await;

        let mds = h.mds.clone();
        let flush = tokio::spawn(async move { mds.command_flush_journal().await });

        // Wait until the flush parks on the expiry gather.
        let mut waited = 0;
        loop {
            let expiring = h
                .mds
                .with_core(|core| core.mdlog.get_expiring_segments())
                .await;
            if expiring.contains(&seq) {
                break;
            }
            waited += 1;
            assert!(waited < 100, "flush never reached segment expiry");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!flush.is_finished());

        h.mds.journal_segment_expired(seq).await;
        flush.await.unwrap().unwrap();

        assert_eq!(h.journal_backend.written_heads().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_surfaces_persist_error() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.mds
            .with_core(|core| core.mdlog.append_event(10, false))
            .await;
        h.journal_backend.fail_persist(true);

        let err = h.mds.command_flush_journal().await.unwrap_err();
        assert_eq!(err.code(), JournalCode::FLUSH_FAILED);
        assert!(err.message().unwrap().contains("while flushing journal"));
        assert!(h.journal_backend.written_heads().is_empty());
    }

    #[tokio::test]
    async fn test_flush_surfaces_head_error() {
        let h = TestMds::new().await;
        h.boot_to_active(0).await;
        h.mds
            .with_core(|core| core.mdlog.append_event(10, false))
            .await;
        h.journal_backend.fail_head(true);

        let err = h.mds.command_flush_journal().await.unwrap_err();
        assert_eq!(err.code(), JournalCode::WRITE_HEAD_FAILED);
        h.mds
            .with_core(|core| {
                // The in-memory head note is only taken on success.
                assert_eq!(core.mdlog.on_disk_head(), Default::default());
            })
            .await;
    }
}
