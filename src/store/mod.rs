//! MVCC ordered key-value store with durable recovery points.
//!
//! One slice owns two of these: the mainstore (forward index) and the
//! backstore (reverse index). Internal keys are ordered by
//! `(user_key ASC, seqno DESC, kind)`; reads resolve the newest version at
//! or below a pinned snapshot seqno. Rollback swaps the whole keyspace for
//! a recovery-point image and bumps the store generation, invalidating
//! snapshots taken before it.

mod iter;
mod recovery;
mod snapshot;

pub use iter::SnapshotIterator;
pub use recovery::RecoveryPoint;
pub use snapshot::Snapshot;

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use self::recovery::RecoveryLog;
use self::snapshot::SnapshotTracker;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item not found")]
    NotFound,

    #[error("item has no value")]
    NoValue,

    #[error("invalid snapshot")]
    InvalidSnapshot,

    #[error("recovery point not found")]
    RecoveryPointMissing,

    #[error("checksum error")]
    Checksum,

    #[error("file corruption")]
    FileCorruption,

    #[error("no db instance")]
    NoInstance,

    #[error("alloc fail")]
    AllocFail,

    #[error("seek fail")]
    SeekFail,

    #[error("fsync fail")]
    FsyncFail,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// The closed set of errors after which the store is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Checksum
                | StoreError::FileCorruption
                | StoreError::NoInstance
                | StoreError::AllocFail
                | StoreError::SeekFail
                | StoreError::FsyncFail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum KeyKind {
    Del = 0,
    Put = 1,
}

/// Internal key: `(user_key ASC, seqno DESC, kind)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VersionedKey {
    pub user: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.user
            .cmp(&other.user)
            .then(other.seqno.cmp(&self.seqno))
            .then((self.kind as u8).cmp(&(other.kind as u8)))
    }
}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl VersionedKey {
    /// Probe sorting at or before every version of `user`.
    pub(crate) fn probe(user: Bytes) -> Self {
        Self {
            user,
            seqno: u64::MAX,
            kind: KeyKind::Del,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Storage directory; `None` disables persistence entirely.
    pub dir: Option<PathBuf>,
    /// Prefix for log lines, e.g. `bucket/index/Mainstore#3:0`.
    pub log_prefix: String,

    /// When set, garbage is reclaimed by the background purger and manual
    /// cleaning requests become no-ops.
    pub auto_lss_cleaning: bool,
    pub lss_cleaner_threshold: u8,
    pub lss_cleaner_max_threshold: u8,
    pub lss_cleaner_min_size: u64,
    pub lss_cleaner_concurrency: usize,

    /// Version purge batch granularity.
    pub max_page_items: usize,
    pub min_page_items: usize,

    pub checkpoint_interval: Duration,

    pub purger_enabled: bool,
    pub purger_interval: Duration,
    /// Garbage ratio at which the purger starts.
    pub purge_threshold: f64,
    /// Garbage ratio at which the purger stops.
    pub purge_low_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: None,
            log_prefix: String::new(),
            auto_lss_cleaning: true,
            lss_cleaner_threshold: 30,
            lss_cleaner_max_threshold: 70,
            lss_cleaner_min_size: 16 * 1024 * 1024,
            lss_cleaner_concurrency: 4,
            max_page_items: 400,
            min_page_items: 25,
            checkpoint_interval: Duration::from_secs(600),
            purger_enabled: false,
            purger_interval: Duration::from_secs(60),
            purge_threshold: 0.5,
            purge_low_threshold: 0.25,
        }
    }
}

/// Per-record map state. Swapped wholesale on rollback and reset.
#[derive(Debug, Default)]
struct State {
    map: SkipMap<VersionedKey, Bytes>,
    versions: AtomicU64,
    dead_versions: AtomicU64,
    live_items: AtomicU64,
    mem_bytes: AtomicU64,
    log_bytes: AtomicU64,
}

impl State {
    fn record_size(key: &VersionedKey, value: &Bytes) -> u64 {
        (key.user.len() + value.len() + 16) as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub items: u64,
    pub versions: u64,
    pub dead_versions: u64,
    pub mem_used: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

#[derive(Debug)]
pub struct Store {
    cfg: RwLock<Config>,
    state: RwLock<State>,
    seqno: AtomicU64,
    generation: AtomicU64,
    tracker: SnapshotTracker,
    active_scopes: AtomicI64,
    recovery: Mutex<RecoveryLog>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    purger_stop: Mutex<Option<mpsc::Sender<()>>>,
}

impl Store {
    /// Opens the store, loading the newest recovery point when the
    /// directory already holds one.
    pub fn open(cfg: Config) -> Result<Arc<Store>, StoreError> {
        let recovery = RecoveryLog::open(cfg.dir.as_deref())?;

        let store = Arc::new(Store {
            cfg: RwLock::new(cfg),
            state: RwLock::new(State::default()),
            seqno: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            tracker: SnapshotTracker::new(),
            active_scopes: AtomicI64::new(0),
            recovery: Mutex::new(recovery),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            purger_stop: Mutex::new(None),
        });

        if let Some(newest) = store.recovery.lock().newest() {
            let items = recovery::load_items(&newest)?;
            store.install_items(items);
            info!(
                "{} recovered {} items from recovery point",
                store.log_prefix(),
                store.items_count()
            );
        }

        store.spawn_purger();
        Ok(store)
    }

    fn log_prefix(&self) -> String {
        self.cfg.read().log_prefix.clone()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut Config)) {
        f(&mut self.cfg.write());
    }

    pub fn auto_lss_cleaning(&self) -> bool {
        self.cfg.read().auto_lss_cleaning
    }

    pub fn lss_cleaner_min_size(&self) -> u64 {
        self.cfg.read().lss_cleaner_min_size
    }

    /// Replaces the keyspace with `items`, assigning fresh seqnos.
    fn install_items(&self, items: Vec<(Bytes, Bytes)>) {
        let state = State::default();
        for (user, value) in items {
            let seqno = self.seqno.fetch_add(1, Ordering::SeqCst) + 1;
            let key = VersionedKey {
                user,
                seqno,
                kind: KeyKind::Put,
            };
            let size = State::record_size(&key, &value);
            state.versions.fetch_add(1, Ordering::Relaxed);
            state.live_items.fetch_add(1, Ordering::Relaxed);
            state.mem_bytes.fetch_add(size, Ordering::Relaxed);
            state.log_bytes.fetch_add(size, Ordering::Relaxed);
            state.map.insert(key, value);
        }
        *self.state.write() = state;
        self.tracker.set_latest(self.seqno.load(Ordering::SeqCst));
    }

    pub fn new_writer(self: &Arc<Store>) -> StoreWriter {
        StoreWriter {
            store: self.clone(),
            scope_depth: std::cell::Cell::new(0),
        }
    }

    pub fn new_reader(self: &Arc<Store>) -> StoreReader {
        StoreReader {
            store: self.clone(),
        }
    }

    pub fn new_snapshot(self: &Arc<Store>) -> Arc<Snapshot> {
        let seqno = self.seqno.load(Ordering::SeqCst);
        self.tracker.set_latest(seqno);
        let id = self.tracker.pin(seqno);
        Arc::new(Snapshot::new(
            self.clone(),
            id,
            seqno,
            self.generation.load(Ordering::SeqCst),
            self.items_count(),
        ))
    }

    pub fn items_count(&self) -> u64 {
        self.state.read().live_items.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            items: state.live_items.load(Ordering::Relaxed),
            versions: state.versions.load(Ordering::Relaxed),
            dead_versions: state.dead_versions.load(Ordering::Relaxed),
            mem_used: state.mem_bytes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Returns `(fragmentation percent, data size, disk size)`.
    pub fn lss_info(&self) -> (u8, u64, u64) {
        let state = self.state.read();
        let versions = state.versions.load(Ordering::Relaxed);
        let dead = state.dead_versions.load(Ordering::Relaxed);
        let frag = if versions == 0 {
            0
        } else {
            (dead * 100 / versions) as u8
        };
        (
            frag,
            state.mem_bytes.load(Ordering::Relaxed),
            state.log_bytes.load(Ordering::Relaxed),
        )
    }

    /// Whether manual log cleaning is currently worthwhile. Fragmentation
    /// past the configured max threshold overrides the size floor.
    pub fn trigger_lss_cleaner(&self, min_frag: u8, min_size: u64) -> bool {
        let max_frag = self.cfg.read().lss_cleaner_max_threshold;
        let (frag, _, disk) = self.lss_info();
        frag >= max_frag || (frag >= min_frag && disk >= min_size)
    }

    /// Reclaims superseded versions and dead tombstones below the minimum
    /// pinned seqno, consulting `should_clean` between batches.
    pub fn clean_lss(&self, should_clean: impl Fn() -> bool) -> Result<(), StoreError> {
        let batch = self.cfg.read().max_page_items.max(1);
        let mut cleaned = 0u64;
        loop {
            if !should_clean() {
                break;
            }
            let purged = self.purge_batch(batch);
            cleaned += purged;
            if purged == 0 {
                break;
            }
        }
        if cleaned > 0 {
            debug!("{} log cleaner reclaimed {} versions", self.log_prefix(), cleaned);
        }
        Ok(())
    }

    /// Removes up to `limit` reclaimable versions. A version is
    /// reclaimable when a newer version at or below the minimum pinned
    /// seqno shadows it, or when it is a tombstone no pinned snapshot can
    /// distinguish from absence.
    fn purge_batch(&self, limit: usize) -> u64 {
        let state = self.state.read();
        let min_pin = self
            .tracker
            .min_pinned()
            .unwrap_or_else(|| self.seqno.load(Ordering::SeqCst));

        let mut doomed: Vec<VersionedKey> = Vec::new();
        let mut current_user: Option<Bytes> = None;
        let mut seen_leq_pin = false;

        for entry in state.map.iter() {
            if doomed.len() >= limit {
                break;
            }
            let key = entry.key();
            if current_user.as_ref() != Some(&key.user) {
                current_user = Some(key.user.clone());
                seen_leq_pin = false;
            }
            if key.seqno > min_pin {
                continue;
            }
            if seen_leq_pin {
                doomed.push(key.clone());
            } else {
                seen_leq_pin = true;
                if key.kind == KeyKind::Del {
                    doomed.push(key.clone());
                }
            }
        }

        let mut purged = 0u64;
        for key in doomed {
            if let Some(entry) = state.map.get(&key) {
                let size = State::record_size(&key, entry.value());
                entry.remove();
                purged += 1;
                state.versions.fetch_sub(1, Ordering::Relaxed);
                sub_floor(&state.dead_versions, 1);
                sub_floor(&state.mem_bytes, size);
                sub_floor(&state.log_bytes, size);
            }
        }
        purged
    }

    fn spawn_purger(self: &Arc<Store>) {
        let cfg = self.cfg.read();
        if !cfg.purger_enabled {
            return;
        }
        let interval = cfg.purger_interval;
        let high = cfg.purge_threshold;
        let low = cfg.purge_low_threshold;
        let prefix = cfg.log_prefix.clone();
        drop(cfg);

        let (tx, rx) = mpsc::channel();
        *self.purger_stop.lock() = Some(tx);
        let store = Arc::downgrade(self);

        let spawned = std::thread::Builder::new()
            .name("slicedb-purger".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                let Some(store) = store.upgrade() else {
                    break;
                };
                if store.garbage_ratio() >= high {
                    let target = store.clone();
                    let _ = store.clean_lss(|| target.garbage_ratio() > low);
                }
            });
        if let Err(err) = spawned {
            warn!("{} failed to start purger: {}", prefix, err);
        }
    }

    fn garbage_ratio(&self) -> f64 {
        let state = self.state.read();
        let versions = state.versions.load(Ordering::Relaxed);
        if versions == 0 {
            return 0.0;
        }
        state.dead_versions.load(Ordering::Relaxed) as f64 / versions as f64
    }

    /// Collects the visible `(key, value)` pairs at `seqno`.
    pub(crate) fn collect_visible(&self, seqno: u64) -> Vec<(Bytes, Bytes)> {
        let state = self.state.read();
        let mut items = Vec::new();
        let mut current_user: Option<Bytes> = None;
        let mut resolved = false;

        for entry in state.map.iter() {
            let key = entry.key();
            if current_user.as_ref() != Some(&key.user) {
                current_user = Some(key.user.clone());
                resolved = false;
            }
            if resolved || key.seqno > seqno {
                continue;
            }
            resolved = true;
            if key.kind == KeyKind::Put {
                items.push((key.user.clone(), entry.value().clone()));
            }
        }
        items
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn tracker(&self) -> &SnapshotTracker {
        &self.tracker
    }

    /// Clears the keyspace and removes every recovery point. The caller
    /// must have quiesced all writers.
    pub fn reset(&self) -> Result<(), StoreError> {
        assert_eq!(
            self.active_scopes.load(Ordering::SeqCst),
            0,
            "store reset with active writer scopes"
        );
        self.recovery.lock().remove_all()?;
        *self.state.write() = State::default();
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn close(&self) {
        // Dropping the sender wakes the purger, which then exits.
        self.purger_stop.lock().take();
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

fn sub_floor(counter: &AtomicU64, by: u64) {
    let mut cur = counter.load(Ordering::Relaxed);
    loop {
        let next = cur.saturating_sub(by);
        match counter.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(now) => cur = now,
        }
    }
}

/// Write handle. One per worker; a `begin` scope brackets every mutation
/// so rollback and reset can assert quiescence. Scopes are re-entrant:
/// error-recovery paths re-enter while the outer scope is held.
pub struct StoreWriter {
    store: Arc<Store>,
    scope_depth: std::cell::Cell<u32>,
}

/// Releases the writer scope on every exit path.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct WriteScope<'a> {
    writer: &'a StoreWriter,
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        let depth = self.writer.scope_depth.get();
        debug_assert!(depth > 0, "unbalanced writer scope");
        self.writer.scope_depth.set(depth - 1);
        if depth == 1 {
            self.writer.store.active_scopes.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl StoreWriter {
    pub fn begin(&self) -> WriteScope<'_> {
        let depth = self.scope_depth.get();
        self.scope_depth.set(depth + 1);
        if depth == 0 {
            self.store.active_scopes.fetch_add(1, Ordering::SeqCst);
        }
        WriteScope { writer: self }
    }

    fn in_scope(&self) -> bool {
        self.scope_depth.get() > 0
    }

    /// Latest visible value for `key`.
    ///
    /// `NotFound` when absent or deleted; `NoValue` when present with an
    /// empty value (primary entries store no payload).
    pub fn lookup_kv(&self, key: &[u8]) -> Result<Bytes, StoreError> {
        let state = self.store.state.read();
        let probe = VersionedKey::probe(Bytes::copy_from_slice(key));
        let found = state
            .map
            .range(probe..)
            .next()
            .filter(|e| e.key().user == key);

        match found {
            None => Err(StoreError::NotFound),
            Some(entry) => {
                if entry.key().kind == KeyKind::Del {
                    return Err(StoreError::NotFound);
                }
                let value = entry.value().clone();
                self.store
                    .bytes_read
                    .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
                if value.is_empty() {
                    Err(StoreError::NoValue)
                } else {
                    Ok(value)
                }
            }
        }
    }

    pub fn insert_kv(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        debug_assert!(self.in_scope(), "mutation outside writer scope");
        let state = self.store.state.read();
        let user = Bytes::copy_from_slice(key);

        let shadowed = visible_kind(&state, &user);
        let seqno = self.store.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let vkey = VersionedKey {
            user,
            seqno,
            kind: KeyKind::Put,
        };
        let value = Bytes::copy_from_slice(value);
        let size = State::record_size(&vkey, &value);

        // A superseded put becomes garbage; a superseded tombstone was
        // already counted when the delete landed.
        if shadowed == Some(KeyKind::Put) {
            state.dead_versions.fetch_add(1, Ordering::Relaxed);
        }
        if shadowed != Some(KeyKind::Put) {
            state.live_items.fetch_add(1, Ordering::Relaxed);
        }
        state.versions.fetch_add(1, Ordering::Relaxed);
        state.mem_bytes.fetch_add(size, Ordering::Relaxed);
        state.log_bytes.fetch_add(size, Ordering::Relaxed);
        state.map.insert(vkey, value);

        self.store
            .bytes_written
            .fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete_kv(&self, key: &[u8]) -> Result<(), StoreError> {
        debug_assert!(self.in_scope(), "mutation outside writer scope");
        let state = self.store.state.read();
        let user = Bytes::copy_from_slice(key);

        if visible_kind(&state, &user) != Some(KeyKind::Put) {
            return Ok(());
        }

        let seqno = self.store.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        let vkey = VersionedKey {
            user,
            seqno,
            kind: KeyKind::Del,
        };
        let value = Bytes::new();
        let size = State::record_size(&vkey, &value);

        // The tombstone supersedes the put, and is itself garbage once no
        // snapshot pins the put.
        state.dead_versions.fetch_add(2, Ordering::Relaxed);
        sub_floor(&state.live_items, 1);
        state.versions.fetch_add(1, Ordering::Relaxed);
        state.mem_bytes.fetch_add(size, Ordering::Relaxed);
        state.log_bytes.fetch_add(size, Ordering::Relaxed);
        state.map.insert(vkey, value);

        self.store
            .bytes_written
            .fetch_add(size, Ordering::Relaxed);
        Ok(())
    }
}

fn visible_kind(state: &State, user: &Bytes) -> Option<KeyKind> {
    let probe = VersionedKey::probe(user.clone());
    state
        .map
        .range(probe..)
        .next()
        .filter(|e| &e.key().user == user)
        .map(|e| e.key().kind)
}

/// Read handle, pooled by the slice and checked out per scan.
pub struct StoreReader {
    store: Arc<Store>,
}

impl StoreReader {
    /// Fails with `InvalidSnapshot` when the snapshot predates the store's
    /// last rollback.
    pub fn snapshot_iterator(
        &self,
        snap: &Snapshot,
    ) -> Result<SnapshotIterator, StoreError> {
        if snap.generation() != self.store.generation() {
            return Err(StoreError::InvalidSnapshot);
        }
        Ok(SnapshotIterator::new(self.store.clone(), snap.seqno()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> Arc<Store> {
        Store::open(Config::default()).expect("open store")
    }

    #[test]
    fn lookup_insert_delete_round_trip() {
        let store = ephemeral();
        let w = store.new_writer();

        let scope = w.begin();
        assert!(matches!(w.lookup_kv(b"k"), Err(StoreError::NotFound)));
        w.insert_kv(b"k", b"v").expect("insert");
        assert_eq!(w.lookup_kv(b"k").expect("lookup"), Bytes::from_static(b"v"));
        w.delete_kv(b"k").expect("delete");
        assert!(matches!(w.lookup_kv(b"k"), Err(StoreError::NotFound)));
        drop(scope);
    }

    #[test]
    fn empty_value_reports_no_value() {
        let store = ephemeral();
        let w = store.new_writer();
        let scope = w.begin();
        w.insert_kv(b"primary", b"").expect("insert");
        assert!(matches!(w.lookup_kv(b"primary"), Err(StoreError::NoValue)));
        drop(scope);
    }

    #[test]
    fn items_count_tracks_visible_keys() {
        let store = ephemeral();
        let w = store.new_writer();
        let scope = w.begin();
        w.insert_kv(b"a", b"1").expect("insert");
        w.insert_kv(b"b", b"1").expect("insert");
        w.insert_kv(b"a", b"2").expect("update");
        assert_eq!(store.items_count(), 2);
        w.delete_kv(b"b").expect("delete");
        assert_eq!(store.items_count(), 1);
        drop(scope);
    }

    #[test]
    fn snapshot_isolation_across_updates() {
        let store = ephemeral();
        let w = store.new_writer();
        let scope = w.begin();
        w.insert_kv(b"k", b"old").expect("insert");
        drop(scope);

        let snap = store.new_snapshot();
        let scope = w.begin();
        w.insert_kv(b"k", b"new").expect("update");
        drop(scope);

        let items = store.collect_visible(snap.seqno());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1, Bytes::from_static(b"old"));
        snap.close().expect("close snapshot");
    }

    #[test]
    fn purge_respects_pinned_snapshots() {
        let store = ephemeral();
        let w = store.new_writer();
        let scope = w.begin();
        w.insert_kv(b"k", b"v1").expect("insert");
        drop(scope);

        let snap = store.new_snapshot();
        let scope = w.begin();
        w.insert_kv(b"k", b"v2").expect("update");
        drop(scope);

        store.clean_lss(|| true).expect("clean");
        // v1 is pinned by the snapshot and must survive.
        let items = store.collect_visible(snap.seqno());
        assert_eq!(items[0].1, Bytes::from_static(b"v1"));

        snap.close().expect("close");
        store.clean_lss(|| true).expect("clean");
        let stats = store.stats();
        assert_eq!(stats.versions, 1);
        assert_eq!(stats.dead_versions, 0);
    }

    #[test]
    fn fatal_predicate_covers_closed_set() {
        assert!(StoreError::Checksum.is_fatal());
        assert!(StoreError::FileCorruption.is_fatal());
        assert!(StoreError::FsyncFail.is_fatal());
        assert!(!StoreError::NotFound.is_fatal());
        assert!(!StoreError::InvalidSnapshot.is_fatal());
    }
}
