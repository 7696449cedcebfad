use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use super::{Store, StoreError};

/// Tracks pinned snapshot seqnos and the minimum pin.
///
/// A pin id is separate from the pinned seqno; the pin fixes the seqno at
/// creation time so version purging never reclaims state a live snapshot
/// can still observe.
#[derive(Debug)]
pub(crate) struct SnapshotTracker {
    next_id: AtomicU64,
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    latest_seqno: u64,
    pinned: std::collections::BTreeMap<u64, u64>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    pub fn set_latest(&self, seqno: u64) {
        let mut guard = self.inner.lock();
        guard.latest_seqno = guard.latest_seqno.max(seqno);
    }

    pub fn pin(&self, seqno: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().pinned.insert(id, seqno);
        id
    }

    pub fn unpin(&self, id: u64) {
        self.inner.lock().pinned.remove(&id);
    }

    /// Smallest pinned seqno, `None` when nothing is pinned.
    pub fn min_pinned(&self) -> Option<u64> {
        self.inner.lock().pinned.values().copied().min()
    }
}

/// An MVCC snapshot handle.
///
/// Opened with one reference; every additional holder calls `open` and
/// every release calls `close`. The pinned seqno is released when the
/// count reaches zero.
pub struct Snapshot {
    store: Arc<Store>,
    pin_id: u64,
    seqno: u64,
    generation: u64,
    count: u64,
    refs: AtomicI32,
    released: AtomicBool,
}

impl Snapshot {
    pub(crate) fn new(
        store: Arc<Store>,
        pin_id: u64,
        seqno: u64,
        generation: u64,
        count: u64,
    ) -> Self {
        Self {
            store,
            pin_id,
            seqno,
            generation,
            count,
            refs: AtomicI32::new(1),
            released: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.refs.load(Ordering::SeqCst) > 0
    }

    pub fn close(&self) -> Result<(), StoreError> {
        let count = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if count < 0 {
            error!("snapshot close requested on already closed snapshot");
            return Err(StoreError::InvalidSnapshot);
        }
        if count == 0 {
            self.release();
        }
        Ok(())
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.store.tracker().unpin(self.pin_id);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.release();
    }
}
