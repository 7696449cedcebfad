//! The storage slice: one partition of one secondary index.
//!
//! A slice owns a mainstore (forward index) and, for non-primary indexes,
//! a backstore (reverse index), a pool of writer workers fed by per-worker
//! command channels, a pool of pooled readers for scans, and the snapshot
//! and recovery-point machinery that makes commits durable.

pub mod config;
pub mod error;
pub mod scan;
pub mod snapshot;
pub mod token;
pub(crate) mod tuner;
pub(crate) mod writer;

pub use scan::{Inclusion, ReaderContext};
pub use snapshot::{OpenSnapshot, SnapshotInfo};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreError, StoreReader};
use config::SliceConfig;
use error::SliceError;
use token::{Token, WriterTokens};
use tuner::Tuner;
use writer::WriterPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexInstId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexDefnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(pub u64);

/// Index shape descriptor: primary, scalar secondary, or array secondary.
#[derive(Debug, Clone)]
pub struct IndexDefn {
    pub defn_id: IndexDefnId,
    pub name: String,
    pub bucket: String,
    pub is_primary: bool,
    pub is_array: bool,
    /// Per-leading-field descending flags; descending fields are stored
    /// reverse-collated.
    pub desc: Vec<bool>,
    /// Composite-key slot holding the array expression.
    pub array_expr_position: usize,
    pub array_distinct: bool,
}

impl IndexDefn {
    pub fn primary(defn_id: IndexDefnId, bucket: &str, name: &str) -> Self {
        Self {
            defn_id,
            name: name.to_string(),
            bucket: bucket.to_string(),
            is_primary: true,
            is_array: false,
            desc: Vec::new(),
            array_expr_position: 0,
            array_distinct: false,
        }
    }

    pub fn secondary(defn_id: IndexDefnId, bucket: &str, name: &str, desc: Vec<bool>) -> Self {
        Self {
            defn_id,
            name: name.to_string(),
            bucket: bucket.to_string(),
            is_primary: false,
            is_array: false,
            desc,
            array_expr_position: 0,
            array_distinct: false,
        }
    }

    pub fn array(
        defn_id: IndexDefnId,
        bucket: &str,
        name: &str,
        desc: Vec<bool>,
        array_expr_position: usize,
        array_distinct: bool,
    ) -> Self {
        Self {
            defn_id,
            name: name.to_string(),
            bucket: bucket.to_string(),
            is_primary: false,
            is_array: true,
            desc,
            array_expr_position,
            array_distinct,
        }
    }
}

/// Source metadata attached to every mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutationMeta {
    /// Source partition; shards the mutation onto a writer.
    pub vbucket: u16,
    pub seqno: u64,
    /// First mutation ever seen for this doc in the current lifecycle;
    /// lets the back-index lookup be skipped.
    pub first_snap: bool,
}

/// Timestamp vector marking a consistent point in the upstream stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqVector {
    pub seqnos: Vec<u64>,
    pub vbuuids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
pub(crate) struct IndexMutation {
    pub op: MutOp,
    pub key: Bytes,
    pub docid: Bytes,
    pub meta: MutationMeta,
}

pub(crate) enum Command {
    Mutation(IndexMutation),
    /// Echoed once the worker has drained everything enqueued before it.
    Probe(mpsc::SyncSender<bool>),
    Stop(mpsc::SyncSender<bool>),
}

#[derive(Debug, Default)]
struct Lifecycle {
    ref_count: u64,
    active: bool,
    soft_closed: bool,
    soft_deleted: bool,
    compacting: bool,
}

/// Bounded pool of mainstore readers, checked out per scan.
pub(crate) struct ReaderPool {
    tx: mpsc::Sender<StoreReader>,
    rx: Mutex<mpsc::Receiver<StoreReader>>,
    cap: usize,
}

impl ReaderPool {
    fn new(cap: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            cap,
        }
    }

    fn fill(&self, store: &Arc<Store>) {
        for _ in 0..self.cap {
            let _ = self.tx.send(store.new_reader());
        }
    }

    pub(crate) fn checkout(&self) -> StoreReader {
        self.rx
            .lock()
            .recv()
            .expect("reader pool channel closed")
    }

    pub(crate) fn put_back(&self, reader: StoreReader) {
        let _ = self.tx.send(reader);
    }

    /// Takes every reader out of the pool, blocking scans until returned.
    pub(crate) fn drain_all(&self) -> Vec<StoreReader> {
        let rx = self.rx.lock();
        (0..self.cap)
            .map(|_| rx.recv().expect("reader pool channel closed"))
            .collect()
    }

    pub(crate) fn return_all(&self, readers: Vec<StoreReader>) {
        for reader in readers {
            self.put_back(reader);
        }
    }
}

/// Aggregated slice storage statistics.
#[derive(Debug, Clone, Default)]
pub struct StorageStatistics {
    pub items: u64,
    pub mem_used: u64,
    pub insert_bytes: u64,
    pub delete_bytes: u64,
    pub get_bytes: u64,
    pub flushed_count: u64,
    pub committed_count: u64,
    pub data_size: u64,
    pub disk_size: u64,
}

pub struct Slice {
    inner: Arc<SliceInner>,
}

pub(crate) struct SliceInner {
    path: PathBuf,
    id: SliceId,
    inst_id: IndexInstId,
    partition_id: PartitionId,
    defn: IndexDefn,
    num_partitions: usize,
    has_persistence: bool,
    new_born: AtomicBool,

    mainstore: Arc<Store>,
    backstore: Option<Arc<Store>>,

    conf: RwLock<SliceConfig>,
    lifecycle: RwLock<Lifecycle>,
    closed: AtomicBool,

    dirty: AtomicBool,
    fatal_err: RwLock<Option<Arc<StoreError>>>,

    q_count: AtomicI64,
    flushed_count: AtomicU64,
    committed_count: AtomicU64,
    insert_bytes: AtomicU64,
    delete_bytes: AtomicU64,
    total_flush_time_ns: AtomicU64,
    total_commit_time_ns: AtomicU64,

    pool: RwLock<WriterPool>,
    readers: ReaderPool,

    is_persistor_active: AtomicBool,

    tuner: Tuner,
    token: Arc<Token>,
    tokens: Arc<WriterTokens>,
}

impl Slice {
    /// Opens (or warm-starts) a slice at `path`.
    ///
    /// A directory that existed before this run triggers recovery from the
    /// newest paired recovery point; a newborn slice starts empty.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: impl AsRef<Path>,
        id: SliceId,
        defn: IndexDefn,
        inst_id: IndexInstId,
        partition_id: PartitionId,
        num_partitions: usize,
        conf: SliceConfig,
        tokens: Arc<WriterTokens>,
    ) -> Result<Slice, SliceError> {
        let path = path.as_ref().to_path_buf();
        let new_born = !path.exists();
        if new_born {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("create slice dir {}", path.display()))
                .map_err(SliceError::Init)?;
        }

        let has_persistence = !conf.disable_persistence;
        let base = has_persistence.then_some(path.as_path());

        let main_prefix = format!(
            "{}/{}/Mainstore#{}:{}",
            defn.bucket, defn.name, inst_id.0, partition_id.0
        );
        let main_cfg =
            conf.store_config(base, "mainIndex", main_prefix, &conf.main, num_partitions);

        let (mainstore, backstore) = if defn.is_primary {
            (Store::open(main_cfg).map_err(map_open_err)?, None)
        } else {
            let back_prefix = format!(
                "{}/{}/Backstore#{}:{}",
                defn.bucket, defn.name, inst_id.0, partition_id.0
            );
            let back_cfg =
                conf.store_config(base, "docIndex", back_prefix, &conf.back, num_partitions);
            let (main, back) = rayon::join(|| Store::open(main_cfg), || Store::open(back_cfg));
            (
                main.map_err(map_open_err)?,
                Some(back.map_err(map_open_err)?),
            )
        };

        let readers = ReaderPool::new(conf.num_readers);
        readers.fill(&mainstore);

        let token = tokens.register(inst_id.0, conf.max_num_writers);
        let tuner = Tuner::new(&conf);

        let inner = Arc::new(SliceInner {
            path,
            id,
            inst_id,
            partition_id,
            defn,
            num_partitions,
            has_persistence,
            new_born: AtomicBool::new(new_born),
            mainstore,
            backstore,
            conf: RwLock::new(conf),
            lifecycle: RwLock::new(Lifecycle::default()),
            closed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            fatal_err: RwLock::new(None),
            q_count: AtomicI64::new(0),
            flushed_count: AtomicU64::new(0),
            committed_count: AtomicU64::new(0),
            insert_bytes: AtomicU64::new(0),
            delete_bytes: AtomicU64::new(0),
            total_flush_time_ns: AtomicU64::new(0),
            total_commit_time_ns: AtomicU64::new(0),
            pool: RwLock::new(WriterPool::default()),
            readers,
            is_persistor_active: AtomicBool::new(false),
            tuner,
            token,
            tokens,
        });

        if !inner.new_born.load(Ordering::SeqCst) {
            info!(
                "slice {:?}:{:?}:{:?} recovering from recovery point",
                inner.id, inner.inst_id, inner.partition_id
            );
            let t0 = Instant::now();
            inner.do_recovery()?;
            info!(
                "slice {:?}:{:?}:{:?} warmup took {:?}",
                inner.id,
                inner.inst_id,
                inner.partition_id,
                t0.elapsed()
            );
        }

        inner.setup_writers();
        inner.set_committed_count();

        info!(
            "slice {:?}:{:?}:{:?} created, writer threads {}",
            inner.id,
            inner.inst_id,
            inner.partition_id,
            inner.pool.read().num_writers
        );

        Ok(Slice { inner })
    }

    /// Enqueues an insert/update; non-blocking while the target worker's
    /// channel has room. Returns the latched fatal error, if any.
    pub fn insert(&self, key: &[u8], docid: &[u8], meta: MutationMeta) -> Result<(), SliceError> {
        let op = if meta.first_snap {
            MutOp::Insert
        } else {
            MutOp::Update
        };
        self.inner.enqueue(IndexMutation {
            op,
            key: Bytes::copy_from_slice(key),
            docid: Bytes::copy_from_slice(docid),
            meta,
        })
    }

    /// Enqueues a delete. A `first_snap` delete is a no-op: the doc was
    /// never indexed in this lifecycle.
    pub fn delete(&self, docid: &[u8], meta: MutationMeta) -> Result<(), SliceError> {
        if meta.first_snap {
            return self.inner.fatal_or_ok();
        }
        self.inner.enqueue(IndexMutation {
            op: MutOp::Delete,
            key: Bytes::new(),
            docid: Bytes::copy_from_slice(docid),
            meta,
        })
    }

    /// Marks a committed point. Callable only once the mutation queue has
    /// drained; a non-empty queue is an invariant violation and aborts.
    pub fn new_snapshot(&self, ts: SeqVector, committed: bool) -> Result<SnapshotInfo, SliceError> {
        self.inner.new_snapshot(ts, committed)
    }

    pub fn open_snapshot(&self, info: &SnapshotInfo) -> Result<Arc<OpenSnapshot>, SliceError> {
        self.inner.open_snapshot(info)
    }

    /// Paired recovery points on both stores, newest first.
    pub fn get_snapshots(&self) -> Result<Vec<SnapshotInfo>, SliceError> {
        self.inner.get_snapshots()
    }

    pub fn rollback(&self, info: &SnapshotInfo) -> Result<(), SliceError> {
        self.inner.rollback(info)
    }

    pub fn rollback_to_zero(&self) -> Result<(), SliceError> {
        self.inner.rollback_to_zero()
    }

    /// Commit-boundary hook; runs writer-pool adjustment when tuning is
    /// enabled.
    pub fn flush_done(&self) {
        self.inner.flush_done();
    }

    pub fn get_reader_context(&self) -> ReaderContext {
        ReaderContext::new(self.inner.clone())
    }

    /// Whether the slice changed since the last snapshot. Waits for the
    /// mutation queue to drain first.
    pub fn is_dirty(&self) -> bool {
        self.inner.wait_persist();
        self.inner.dirty.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> SliceId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn index_inst_id(&self) -> IndexInstId {
        self.inner.inst_id
    }

    pub fn index_defn_id(&self) -> IndexDefnId {
        self.inner.defn.defn_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.inner.partition_id
    }

    pub fn is_primary(&self) -> bool {
        self.inner.defn.is_primary
    }

    pub fn is_active(&self) -> bool {
        self.inner.lifecycle.read().active
    }

    pub fn set_active(&self, active: bool) {
        self.inner.lifecycle.write().active = active;
    }

    pub fn is_compacting(&self) -> bool {
        self.inner.lifecycle.read().compacting
    }

    pub fn is_soft_closed(&self) -> bool {
        self.inner.lifecycle.read().soft_closed
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.inner.lifecycle.read().soft_deleted
    }

    pub fn get_committed_count(&self) -> u64 {
        self.inner.committed_count.load(Ordering::SeqCst)
    }

    pub fn num_writers(&self) -> usize {
        self.inner.pool.read().num_writers
    }

    pub fn statistics(&self) -> StorageStatistics {
        self.inner.statistics()
    }

    /// Swaps the running configuration and re-plumbs store tunables.
    pub fn update_config(&self, conf: SliceConfig) {
        self.inner.update_config(conf);
    }

    /// Triggers log cleaning on both stores unless auto-cleaning owns it.
    /// Cleaning aborts at `deadline` or when the slice is soft-closed or
    /// soft-deleted.
    pub fn compact(&self, deadline: Instant, min_frag: u8) -> Result<(), SliceError> {
        self.inner.compact(deadline, min_frag)
    }

    /// Closes the slice, deferring behind outstanding snapshot references.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Removes the slice from disk, deferring behind outstanding
    /// references.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SliceInner> {
        &self.inner
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

fn map_open_err(err: StoreError) -> SliceError {
    if err.is_fatal() {
        error!("slice store open failed with fatal error: {err}");
        SliceError::StorageCorrupted
    } else {
        SliceError::Store(err)
    }
}

impl SliceInner {
    fn enqueue(&self, mutation: IndexMutation) -> Result<(), SliceError> {
        self.q_count.fetch_add(1, Ordering::SeqCst);
        let pool = self.pool.read();
        if pool.num_writers == 0 {
            self.q_count.fetch_sub(1, Ordering::SeqCst);
            return Err(SliceError::Closed);
        }
        let at = mutation.meta.vbucket as usize % pool.num_writers;
        if pool.workers[at]
            .tx
            .send(Command::Mutation(mutation))
            .is_err()
        {
            self.q_count.fetch_sub(1, Ordering::SeqCst);
            return Err(SliceError::Closed);
        }
        drop(pool);
        self.fatal_or_ok()
    }

    pub(crate) fn fatal_or_ok(&self) -> Result<(), SliceError> {
        match &*self.fatal_err.read() {
            Some(err) => Err(SliceError::Fatal(err.clone())),
            None => Ok(()),
        }
    }

    /// Latches a fatal store error and aborts: continuing against an
    /// unusable store risks silent index corruption.
    pub(crate) fn check_fatal_db_error(&self, err: StoreError) -> ! {
        if err.is_fatal() {
            *self.fatal_err.write() = Some(Arc::new(err));
            let latched = self.fatal_err.read();
            panic!(
                "slice {:?}:{:?}:{:?} fatal storage error: {:?}",
                self.id, self.inst_id, self.partition_id, latched
            );
        }
        panic!(
            "slice {:?}:{:?}:{:?} unexpected storage error: {}",
            self.id, self.inst_id, self.partition_id, err
        );
    }

    pub(crate) fn queued(&self) -> i64 {
        self.q_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_committed_count(&self) {
        self.committed_count
            .store(self.mainstore.items_count(), Ordering::SeqCst);
    }

    pub(crate) fn log_writer_stat(&self) {
        let count = self.flushed_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 10_000 == 0 {
            log::debug!(
                "slice {:?}:{:?} flushed {} queued {}",
                self.inst_id,
                self.partition_id,
                count,
                self.queued()
            );
        }
    }

    fn statistics(&self) -> StorageStatistics {
        let main = self.mainstore.stats();
        let mut stats = StorageStatistics {
            items: main.items,
            mem_used: main.mem_used,
            insert_bytes: self.insert_bytes.load(Ordering::Relaxed),
            delete_bytes: self.delete_bytes.load(Ordering::Relaxed),
            get_bytes: main.bytes_read,
            flushed_count: self.flushed_count.load(Ordering::Relaxed),
            committed_count: self.committed_count.load(Ordering::SeqCst),
            data_size: 0,
            disk_size: 0,
        };
        if let Some(back) = &self.backstore {
            let back_stats = back.stats();
            stats.mem_used += back_stats.mem_used;
            stats.get_bytes += back_stats.bytes_read;
        }
        if self.has_persistence {
            let (_, data, disk) = self.mainstore.lss_info();
            stats.data_size += data;
            stats.disk_size += disk;
            if let Some(back) = &self.backstore {
                let (_, data, disk) = back.lss_info();
                stats.data_size += data;
                stats.disk_size += disk;
            }
        }
        stats
    }

    fn update_config(&self, conf: SliceConfig) {
        let apply = |store: &Arc<Store>, settings: &config::IndexStoreSettings| {
            let auto = !conf.manual_compaction;
            let frag = settings.lss_fragmentation;
            let max_frag = settings.max_lss_fragmentation;
            let split = settings.page_split_threshold;
            let merge = settings.page_merge_threshold;
            let purger = conf.purger.clone();
            store.update_config(move |c| {
                c.auto_lss_cleaning = auto;
                c.lss_cleaner_threshold = frag;
                c.lss_cleaner_max_threshold = max_frag;
                c.max_page_items = split;
                c.min_page_items = merge;
                c.purger_interval = purger.interval;
                c.purge_threshold = purger.high_threshold;
                c.purge_low_threshold = purger.low_threshold;
            });
        };
        apply(&self.mainstore, &conf.main);
        if let Some(back) = &self.backstore {
            apply(back, &conf.back);
        }
        *self.conf.write() = conf;
    }

    fn compact(&self, deadline: Instant, min_frag: u8) -> Result<(), SliceError> {
        {
            let mut lc = self.lifecycle.write();
            if lc.compacting {
                return Ok(());
            }
            lc.compacting = true;
        }

        let clean = |store: &Arc<Store>| -> Result<(), StoreError> {
            if store.auto_lss_cleaning() {
                return Ok(());
            }
            let min_size = store.lss_cleaner_min_size();
            store.clean_lss(|| {
                if Instant::now() >= deadline {
                    return false;
                }
                let lc = self.lifecycle.read();
                if lc.soft_closed || lc.soft_deleted {
                    return false;
                }
                drop(lc);
                store.trigger_lss_cleaner(min_frag, min_size)
            })
        };

        let result = std::thread::scope(|scope| {
            let main = scope.spawn(|| clean(&self.mainstore));
            let back = self
                .backstore
                .as_ref()
                .map(|b| scope.spawn(move || clean(b)));
            let m = main.join().expect("compact thread");
            let b = back.map(|j| j.join().expect("compact thread"));
            m.and(b.unwrap_or(Ok(())))
        });

        self.lifecycle.write().compacting = false;
        result.map_err(SliceError::Store)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "slice {:?}:{:?}:{:?} closing",
            self.id, self.inst_id, self.partition_id
        );

        self.cleanup_writers_on_close();

        let defer = {
            let mut lc = self.lifecycle.write();
            if lc.ref_count > 0 {
                lc.soft_closed = true;
                true
            } else {
                false
            }
        };
        if !defer {
            self.try_close();
        }
    }

    fn cleanup_writers_on_close(&self) {
        let released = self.pool.read().num_writers;
        self.token.increment(released);
        self.free_all_writers();
        self.tuner.stop_sampler();
    }

    fn destroy(&self) {
        let defer = {
            let mut lc = self.lifecycle.write();
            if lc.ref_count > 0 {
                info!(
                    "slice {:?}:{:?}:{:?} soft-deleted",
                    self.id, self.inst_id, self.partition_id
                );
                lc.soft_deleted = true;
                true
            } else {
                false
            }
        };
        if !defer {
            self.try_delete();
        }
    }

    pub(crate) fn incr_ref(&self) {
        self.lifecycle.write().ref_count += 1;
    }

    pub(crate) fn decr_ref(&self) {
        let (close_now, delete_now) = {
            let mut lc = self.lifecycle.write();
            lc.ref_count -= 1;
            if lc.ref_count == 0 {
                (lc.soft_closed, lc.soft_deleted)
            } else {
                (false, false)
            }
        };
        if close_now {
            self.try_close();
        }
        if delete_now {
            self.try_delete();
        }
    }

    fn try_close(&self) {
        self.wait_for_persistor();
        self.mainstore.close();
        if let Some(back) = &self.backstore {
            back.close();
        }
    }

    fn try_delete(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            warn!(
                "slice {:?}:{:?}:{:?} error cleaning up {}: {}",
                self.id,
                self.inst_id,
                self.partition_id,
                self.path.display(),
                err
            );
        }
        self.tokens.remove(self.inst_id.0);
    }

    /// Discards both stores and reinitialises the slice empty.
    pub(crate) fn reset_stores(self: &Arc<Self>) -> Result<(), SliceError> {
        let readers = self.readers.drain_all();
        let prev_writers = self.pool.read().num_writers;
        self.free_all_writers();

        self.mainstore.reset()?;
        if let Some(back) = &self.backstore {
            back.reset()?;
        }

        self.new_born.store(true, Ordering::SeqCst);
        drop(readers);
        self.readers.fill(&self.mainstore);
        self.restart_writers(prev_writers);
        self.set_committed_count();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defn_constructors_classify_variants() {
        let p = IndexDefn::primary(IndexDefnId(1), "b", "p");
        assert!(p.is_primary && !p.is_array);

        let s = IndexDefn::secondary(IndexDefnId(2), "b", "s", vec![false, true]);
        assert!(!s.is_primary && !s.is_array);
        assert_eq!(s.desc, vec![false, true]);

        let a = IndexDefn::array(IndexDefnId(3), "b", "a", vec![false], 1, true);
        assert!(a.is_array && a.array_distinct);
        assert_eq!(a.array_expr_position, 1);
    }
}
