//! Slice snapshots, the recovery-point persistor, and rollback.
//!
//! An open snapshot pairs one MVCC snapshot per store and pins the slice
//! alive through its reference count. Committed snapshots are persisted in
//! the background as recovery points carrying `[8-byte BE nanos || JSON
//! timestamp vector]` metadata; the 8-byte prefix pairs points across the
//! two stores.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use log::{error, info};

use crate::store::{RecoveryPoint, Snapshot as StoreSnapshot};
use crate::sync::Gate;

use super::error::SliceError;
use super::{SeqVector, SliceInner};

/// Only one slice on the host persists at a time, so recovery-point
/// writing cannot starve scan I/O.
static PERSISTENCE_GATE: Gate = Gate::new();

/// A committed (or in-memory) point of the slice.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub ts: SeqVector,
    pub committed: bool,
    pub count: u64,
    pub(crate) main_rp: Option<Arc<RecoveryPoint>>,
    pub(crate) back_rp: Option<Arc<RecoveryPoint>>,
}

impl SnapshotInfo {
    pub fn timestamp(&self) -> &SeqVector {
        &self.ts
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

/// A paired MVCC view over both stores, held open by scans.
pub struct OpenSnapshot {
    slice: Arc<SliceInner>,
    info: SnapshotInfo,
    pub(crate) main_snap: Arc<StoreSnapshot>,
    back_snap: Option<Arc<StoreSnapshot>>,
    refs: AtomicI32,
}

impl OpenSnapshot {
    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    pub fn timestamp(&self) -> &SeqVector {
        &self.info.ts
    }

    pub(crate) fn slice(&self) -> &Arc<SliceInner> {
        &self.slice
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.slice.defn.is_primary
    }

    pub fn open(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.refs.load(Ordering::SeqCst) > 0
    }

    /// Drops one reference; the final close releases the store snapshots
    /// and the slice reference, triggering any deferred close/destroy.
    pub fn close(&self) -> Result<(), SliceError> {
        let count = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if count < 0 {
            error!("snapshot close requested on already closed snapshot");
            return Err(SliceError::SnapshotClosed);
        }
        if count == 0 {
            self.destroy();
        }
        Ok(())
    }

    fn destroy(&self) {
        let _ = self.main_snap.close();
        if let Some(back) = &self.back_snap {
            let _ = back.close();
        }
        self.slice.decr_ref();
    }

    /// Approximate item count from the last commit.
    pub fn stat_count_total(&self) -> u64 {
        self.slice.committed_count.load(Ordering::SeqCst)
    }

    /// Exact item count of this snapshot's view.
    pub fn count_total(&self) -> u64 {
        self.main_snap.count()
    }
}

fn rp_prefix(meta: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = meta.len().min(8);
    buf[..n].copy_from_slice(&meta[..n]);
    u64::from_be_bytes(buf)
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Clears the persistor-active flag on every exit path.
struct PersistorDone<'a>(&'a SliceInner);

impl Drop for PersistorDone<'_> {
    fn drop(&mut self) {
        self.0.is_persistor_active.store(false, Ordering::SeqCst);
    }
}

impl SliceInner {
    /// Marks a committed point. The mutation queue must be fully drained;
    /// a non-empty queue aborts by policy.
    pub(crate) fn new_snapshot(
        &self,
        ts: SeqVector,
        committed: bool,
    ) -> Result<SnapshotInfo, SliceError> {
        let t0 = Instant::now();
        self.wait_persist();
        assert_eq!(
            self.queued(),
            0,
            "slice invariant violation - commit with pending mutations"
        );

        self.dirty.store(false, Ordering::SeqCst);
        let info = SnapshotInfo {
            ts,
            committed,
            count: self.mainstore.items_count(),
            main_rp: None,
            back_rp: None,
        };
        self.total_commit_time_ns
            .fetch_add(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(info)
    }

    pub(crate) fn open_snapshot(
        self: &Arc<Self>,
        info: &SnapshotInfo,
    ) -> Result<Arc<OpenSnapshot>, SliceError> {
        let snap = Arc::new(OpenSnapshot {
            slice: self.clone(),
            info: info.clone(),
            main_snap: self.mainstore.new_snapshot(),
            back_snap: self.backstore.as_ref().map(|b| b.new_snapshot()),
            refs: AtomicI32::new(0),
        });
        snap.open();
        self.incr_ref();

        if info.committed && self.has_persistence {
            self.persist_snapshot(&snap);
        }
        if info.committed {
            info!(
                "slice {:?}:{:?}:{:?} new snapshot: count {} committed {}",
                self.id, self.inst_id, self.partition_id, info.count, info.committed
            );
        }
        self.set_committed_count();
        Ok(snap)
    }

    /// Launches the background recovery-point writer, unless one is
    /// already running for this slice.
    fn persist_snapshot(self: &Arc<Self>, snap: &Arc<OpenSnapshot>) {
        if self
            .is_persistor_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(
                "slice {:?}:{:?}:{:?} skipping on-disk snapshot, a snapshot writer is in progress",
                self.id, self.inst_id, self.partition_id
            );
            return;
        }

        // Extra store-snapshot refs keep the views open for the writer.
        snap.main_snap.open();
        if let Some(back) = &snap.back_snap {
            back.open();
        }

        let slice = self.clone();
        let snap = snap.clone();
        let snap_for_thread = snap.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("slicedb-persistor-{}", self.inst_id.0))
            .spawn(move || slice.run_persistor(snap_for_thread));
        if let Err(err) = spawned {
            error!("failed to spawn persistor: {err}");
            let _ = snap.main_snap.close();
            if let Some(back) = &snap.back_snap {
                let _ = back.close();
            }
            self.is_persistor_active.store(false, Ordering::SeqCst);
        }
    }

    fn run_persistor(self: Arc<Self>, snap: Arc<OpenSnapshot>) {
        let _done = PersistorDone(&self);
        info!(
            "slice {:?}:{:?}:{:?} creating recovery point",
            self.id, self.inst_id, self.partition_id
        );
        let t0 = Instant::now();

        let ts_json = match serde_json::to_vec(&snap.info.ts) {
            Ok(v) => v,
            Err(err) => panic!("timestamp vector failed to serialize: {err}"),
        };
        let mut meta = unix_nanos().to_be_bytes().to_vec();
        meta.extend_from_slice(&ts_json);

        let (cpu_pct, max_rollbacks) = {
            let conf = self.conf.read();
            (conf.persistence_cpu_percent, conf.max_rollbacks)
        };
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let concurr = ((ncpu as f32 * cpu_pct as f32 / 200.0) + 0.75) as usize;
        let concurr = concurr.max(1);

        // The pairing gate holds one slot so the main and back callbacks
        // never both hold the node-wide gate; a snapshot must not stay
        // open waiting for its sibling's recovery point.
        let pair = Gate::new();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let result = self.mainstore.create_recovery_point(
                    &snap.main_snap,
                    &meta,
                    concurr,
                    || {
                        pair.acquire();
                        PERSISTENCE_GATE.acquire();
                    },
                );
                pair.release();
                PERSISTENCE_GATE.release();
                if let Err(err) = result {
                    error!("mainstore recovery point failed: {err}");
                }
            });

            if let (Some(back), Some(back_snap)) = (&self.backstore, &snap.back_snap) {
                let result = back.create_recovery_point(back_snap, &meta, concurr, || {
                    pair.acquire();
                    PERSISTENCE_GATE.acquire();
                });
                pair.release();
                PERSISTENCE_GATE.release();
                if let Err(err) = result {
                    error!("backstore recovery point failed: {err}");
                }
            }
        });

        let _ = snap.main_snap.close();
        if let Some(back_snap) = &snap.back_snap {
            let _ = back_snap.close();
        }

        info!(
            "slice {:?}:{:?}:{:?} created recovery point (took {:?})",
            self.id,
            self.inst_id,
            self.partition_id,
            t0.elapsed()
        );

        self.prune_recovery_points(max_rollbacks);
    }

    /// Keeps at most `max_rollbacks` recovery points per store.
    fn prune_recovery_points(&self, max_rollbacks: usize) {
        let prune = |store: &crate::store::Store| {
            let points = store.recovery_points();
            if points.len() > max_rollbacks {
                for point in &points[..points.len() - max_rollbacks] {
                    if let Err(err) = store.remove_recovery_point(point) {
                        error!("failed to remove old recovery point: {err}");
                    }
                }
            }
        };
        prune(&self.mainstore);
        if let Some(back) = &self.backstore {
            prune(back);
        }
    }

    /// Paired recovery points, newest first.
    ///
    /// Main and back lists are intersected by their 8-byte metadata
    /// prefix, bounded by the common range. Any pairing mismatch after
    /// intersection invalidates recovery entirely.
    pub(crate) fn get_snapshots(&self) -> Result<Vec<SnapshotInfo>, SliceError> {
        let m_rps = self.mainstore.recovery_points();

        let (m_rps, b_rps) = match &self.backstore {
            None => (m_rps, None),
            Some(back) => {
                let b_rps = back.recovery_points();
                if m_rps.is_empty() || b_rps.is_empty() {
                    return Ok(Vec::new());
                }

                let min = rp_prefix(m_rps[0].meta()).max(rp_prefix(b_rps[0].meta()));
                let max = rp_prefix(m_rps[m_rps.len() - 1].meta())
                    .min(rp_prefix(b_rps[b_rps.len() - 1].meta()));
                let in_range = |rp: &Arc<RecoveryPoint>| {
                    let p = rp_prefix(rp.meta());
                    p >= min && p <= max
                };

                let m: Vec<_> = m_rps.into_iter().filter(in_range).collect();
                let b: Vec<_> = b_rps.into_iter().filter(in_range).collect();
                if m.len() != b.len() {
                    return Ok(Vec::new());
                }
                if m.iter()
                    .zip(&b)
                    .any(|(m, b)| rp_prefix(m.meta()) != rp_prefix(b.meta()))
                {
                    return Ok(Vec::new());
                }
                (m, Some(b))
            }
        };

        let mut infos = Vec::with_capacity(m_rps.len());
        for (i, m_rp) in m_rps.iter().enumerate().rev() {
            let ts: SeqVector = serde_json::from_slice(m_rp.meta().get(8..).unwrap_or(&[]))
                .map_err(|err| anyhow!("unable to decode snapshot meta: {err}"))?;
            infos.push(SnapshotInfo {
                ts,
                committed: false,
                count: m_rp.items_count(),
                main_rp: Some(m_rp.clone()),
                back_rp: b_rps.as_ref().map(|b| b[i].clone()),
            });
        }
        Ok(infos)
    }

    /// Warm-start: restore the newest paired recovery point, or reset the
    /// stores when none exists.
    pub(crate) fn do_recovery(self: &Arc<Self>) -> Result<(), SliceError> {
        let snaps = self.get_snapshots()?;
        match snaps.first() {
            None => {
                info!(
                    "slice {:?}:{:?}:{:?} unable to find recovery point, resetting store",
                    self.id, self.inst_id, self.partition_id
                );
                self.reset_stores()
            }
            Some(info) => self.restore(info),
        }
    }

    fn restore(&self, info: &SnapshotInfo) -> Result<(), SliceError> {
        let m_rp = info
            .main_rp
            .as_ref()
            .ok_or_else(|| anyhow!("snapshot info carries no recovery point"))?;

        let (m_res, b_res) = std::thread::scope(|scope| {
            let main = scope.spawn(|| self.mainstore.rollback(m_rp).map(drop));
            let back = match (&self.backstore, &info.back_rp) {
                (Some(store), Some(rp)) => {
                    let join = scope.spawn(move || store.rollback(rp).map(drop));
                    Some(join.join().expect("backstore rollback thread"))
                }
                _ => None,
            };
            (
                main.join().expect("mainstore rollback thread"),
                back.unwrap_or(Ok(())),
            )
        });

        if m_res.is_err() || b_res.is_err() {
            return Err(SliceError::Init(anyhow!(
                "rollback error {:?} {:?}",
                m_res.err(),
                b_res.err()
            )));
        }
        Ok(())
    }

    /// Rolls the slice back to a persisted snapshot. Blocks scans by
    /// draining the reader pool for the duration.
    pub(crate) fn rollback(&self, info: &SnapshotInfo) -> Result<(), SliceError> {
        self.wait_persist();
        self.wait_for_persistor();
        assert_eq!(
            self.queued(),
            0,
            "slice invariant violation - rollback with pending mutations"
        );

        let readers = self.readers.drain_all();
        let result = self.restore(info);
        self.readers.return_all(readers);
        result
    }

    /// Rolls back to the initial (empty) state.
    pub(crate) fn rollback_to_zero(self: &Arc<Self>) -> Result<(), SliceError> {
        self.wait_persist();
        self.wait_for_persistor();
        self.reset_stores()
    }

    /// Persistors are not cancellable; poll until the active one clears.
    pub(crate) fn wait_for_persistor(&self) {
        while self.is_persistor_active.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}
