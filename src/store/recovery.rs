//! Durable recovery points.
//!
//! A recovery point is a checksummed image of the keyspace visible to one
//! snapshot plus caller-supplied metadata. Files are written to a temp
//! name, fsynced, then renamed into place so a crash can never surface a
//! partially written point.
//!
//! File layout:
//! `magic u32 | version u8 | meta_len u32 LE | meta | item_count u64 LE |`
//! `chunk_count u32 LE | chunks...` where each chunk is
//! `len u32 LE | crc32 u32 LE | bincode [(key, value)]`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use rayon::prelude::*;

use super::{Snapshot, Store, StoreError};

const MAGIC: u32 = 0x534C_5250;
const VERSION: u8 = 1;

/// Handle to one durable recovery point.
#[derive(Debug, Clone)]
pub struct RecoveryPoint {
    seq: u64,
    meta: Bytes,
    item_count: u64,
    path: PathBuf,
}

impl RecoveryPoint {
    /// Caller metadata; the first 8 bytes order points across stores.
    pub fn meta(&self) -> &[u8] {
        &self.meta
    }

    pub fn items_count(&self) -> u64 {
        self.item_count
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

/// On-disk recovery point ledger for one store.
#[derive(Debug)]
pub(crate) struct RecoveryLog {
    dir: Option<PathBuf>,
    next_seq: u64,
    points: Vec<Arc<RecoveryPoint>>,
}

impl RecoveryLog {
    pub fn open(dir: Option<&Path>) -> Result<Self, StoreError> {
        let Some(dir) = dir else {
            return Ok(Self {
                dir: None,
                next_seq: 1,
                points: Vec::new(),
            });
        };

        fs::create_dir_all(dir)?;
        let mut points = Vec::new();
        for dirent in fs::read_dir(dir)? {
            let path = dirent?.path();
            let Some(seq) = seq_from_path(&path) else {
                continue;
            };
            match read_header(&path, seq) {
                Ok(point) => points.push(Arc::new(point)),
                Err(err) => {
                    warn!(
                        "skipping unreadable recovery point {}: {}",
                        path.display(),
                        err
                    );
                }
            }
        }
        points.sort_by_key(|p| p.seq);
        let next_seq = points.last().map(|p| p.seq + 1).unwrap_or(1);

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            next_seq,
            points,
        })
    }

    pub fn newest(&self) -> Option<Arc<RecoveryPoint>> {
        self.points.last().cloned()
    }

    /// Points ordered by metadata prefix (creation order).
    pub fn list(&self) -> Vec<Arc<RecoveryPoint>> {
        self.points.clone()
    }

    pub fn add(&mut self, point: Arc<RecoveryPoint>) {
        self.points.push(point);
        self.points.sort_by_key(|p| p.seq);
    }

    pub fn remove(&mut self, seq: u64) -> Result<(), StoreError> {
        let Some(at) = self.points.iter().position(|p| p.seq == seq) else {
            return Err(StoreError::RecoveryPointMissing);
        };
        let point = self.points.remove(at);
        fs::remove_file(&point.path)?;
        Ok(())
    }

    /// Drops every point newer than `seq`; rollback truncates history.
    pub fn remove_newer(&mut self, seq: u64) {
        let (keep, drop): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.points).into_iter().partition(|p| p.seq <= seq);
        self.points = keep;
        for point in drop {
            if let Err(err) = fs::remove_file(&point.path) {
                warn!(
                    "failed to remove stale recovery point {}: {}",
                    point.path.display(),
                    err
                );
            }
        }
    }

    pub fn remove_all(&mut self) -> Result<(), StoreError> {
        for point in std::mem::take(&mut self.points) {
            fs::remove_file(&point.path)?;
        }
        Ok(())
    }

    fn next_path(&mut self) -> Option<(u64, PathBuf)> {
        let dir = self.dir.as_ref()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, dir.join(format!("rp_{seq:016x}.rp"))))
    }
}

impl Store {
    /// Writes a recovery point capturing `snap`.
    ///
    /// `serialize` runs after the snapshot image is captured and before any
    /// disk write; callers use it to rate-limit persistence node-wide.
    /// `concurrency` bounds the parallel chunk encode.
    pub fn create_recovery_point(
        &self,
        snap: &Snapshot,
        meta: &[u8],
        concurrency: usize,
        serialize: impl FnOnce(),
    ) -> Result<(), StoreError> {
        let items = self.collect_visible(snap.seqno());
        serialize();

        let Some((seq, path)) = self.recovery.lock().next_path() else {
            return Ok(());
        };

        let item_count = items.len() as u64;
        write_point(&path, meta, &items, concurrency.max(1))?;
        info!(
            "{} created recovery point seq {} ({} items)",
            self.cfg.read().log_prefix,
            seq,
            item_count
        );

        self.recovery.lock().add(Arc::new(RecoveryPoint {
            seq,
            meta: Bytes::copy_from_slice(meta),
            item_count,
            path,
        }));
        Ok(())
    }

    /// All recovery points, oldest first.
    pub fn recovery_points(&self) -> Vec<Arc<RecoveryPoint>> {
        self.recovery.lock().list()
    }

    pub fn remove_recovery_point(&self, point: &RecoveryPoint) -> Result<(), StoreError> {
        self.recovery.lock().remove(point.seq())
    }

    /// Restores the keyspace to `point`, invalidating snapshots taken
    /// before the rollback and truncating newer recovery points.
    pub fn rollback(
        self: &Arc<Store>,
        point: &RecoveryPoint,
    ) -> Result<Arc<Snapshot>, StoreError> {
        assert_eq!(
            self.active_scopes.load(Ordering::SeqCst),
            0,
            "store rollback with active writer scopes"
        );

        let items = load_items(point)?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.install_items(items);
        self.recovery.lock().remove_newer(point.seq());
        Ok(self.new_snapshot())
    }
}

fn seq_from_path(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix("rp_")?.strip_suffix(".rp")?;
    u64::from_str_radix(hex, 16).ok()
}

fn write_point(
    path: &Path,
    meta: &[u8],
    items: &[(Bytes, Bytes)],
    concurrency: usize,
) -> Result<(), StoreError> {
    let chunk_len = items.len().div_ceil(concurrency).max(1);
    let chunks: Vec<Vec<u8>> = items
        .par_chunks(chunk_len)
        .map(|chunk| bincode::serialize(chunk).map_err(|_| StoreError::FileCorruption))
        .collect::<Result<_, _>>()?;

    let tmp = path.with_extension("rp.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;

    file.write_all(&MAGIC.to_le_bytes())?;
    file.write_all(&[VERSION])?;
    file.write_all(&(meta.len() as u32).to_le_bytes())?;
    file.write_all(meta)?;
    file.write_all(&(items.len() as u64).to_le_bytes())?;
    file.write_all(&(chunks.len() as u32).to_le_bytes())?;
    for chunk in &chunks {
        file.write_all(&(chunk.len() as u32).to_le_bytes())?;
        file.write_all(&crc32fast::hash(chunk).to_le_bytes())?;
        file.write_all(chunk)?;
    }
    file.sync_all().map_err(|_| StoreError::FsyncFail)?;
    drop(file);

    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|_| StoreError::FsyncFail)?;
    }
    Ok(())
}

struct HeaderReader {
    file: File,
}

impl HeaderReader {
    fn u32(&mut self) -> Result<u32, StoreError> {
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, StoreError> {
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, StoreError> {
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn open_checked(path: &Path) -> Result<(HeaderReader, Bytes, u64, u32), StoreError> {
    let file = File::open(path)?;
    let mut r = HeaderReader { file };

    if r.u32()? != MAGIC {
        return Err(StoreError::FileCorruption);
    }
    if r.bytes(1)?[0] != VERSION {
        return Err(StoreError::FileCorruption);
    }
    let meta_len = r.u32()? as usize;
    if meta_len > 1 << 20 {
        return Err(StoreError::FileCorruption);
    }
    let meta = Bytes::from(r.bytes(meta_len)?);
    let item_count = r.u64()?;
    let chunk_count = r.u32()?;
    Ok((r, meta, item_count, chunk_count))
}

fn read_header(path: &Path, seq: u64) -> Result<RecoveryPoint, StoreError> {
    let (_, meta, item_count, _) = open_checked(path)?;
    Ok(RecoveryPoint {
        seq,
        meta,
        item_count,
        path: path.to_path_buf(),
    })
}

/// Loads and checksum-verifies the full image of a recovery point.
pub(crate) fn load_items(point: &RecoveryPoint) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
    let (mut r, _, item_count, chunk_count) = open_checked(&point.path)?;

    let mut items: Vec<(Bytes, Bytes)> = Vec::with_capacity(item_count as usize);
    for _ in 0..chunk_count {
        let len = r.u32()? as usize;
        let crc = r.u32()?;
        let payload = r.bytes(len)?;
        if crc32fast::hash(&payload) != crc {
            return Err(StoreError::Checksum);
        }
        let chunk: Vec<(Bytes, Bytes)> =
            bincode::deserialize(&payload).map_err(|_| StoreError::FileCorruption)?;
        items.extend(chunk);
    }
    if items.len() as u64 != item_count {
        return Err(StoreError::FileCorruption);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::super::Config;
    use super::*;
    use std::io::Seek;

    fn disk_store(dir: &Path) -> Arc<Store> {
        Store::open(Config {
            dir: Some(dir.to_path_buf()),
            ..Config::default()
        })
        .expect("open store")
    }

    fn fill(store: &Arc<Store>, pairs: &[(&[u8], &[u8])]) {
        let w = store.new_writer();
        let scope = w.begin();
        for (k, v) in pairs {
            w.insert_kv(k, v).expect("insert");
        }
        drop(scope);
    }

    #[test]
    fn recovery_point_round_trip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = disk_store(dir.path());
        fill(&store, &[(b"a", b"1"), (b"b", b"2")]);

        let snap = store.new_snapshot();
        store
            .create_recovery_point(&snap, b"\x00\x00\x00\x00\x00\x00\x00\x01meta", 2, || {})
            .expect("create rp");
        snap.close().expect("close");

        let points = store.recovery_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].items_count(), 2);
        assert!(points[0].meta().ends_with(b"meta"));

        let items = load_items(&points[0]).expect("load");
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn reopen_restores_newest_point() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        {
            let store = disk_store(dir.path());
            fill(&store, &[(b"k", b"v")]);
            let snap = store.new_snapshot();
            store
                .create_recovery_point(&snap, b"01234567m", 1, || {})
                .expect("create rp");
            snap.close().expect("close");
        }

        let store = disk_store(dir.path());
        assert_eq!(store.items_count(), 1);
        let w = store.new_writer();
        let scope = w.begin();
        assert_eq!(w.lookup_kv(b"k").expect("lookup"), Bytes::from_static(b"v"));
        drop(scope);
    }

    #[test]
    fn rollback_truncates_newer_points() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = disk_store(dir.path());

        fill(&store, &[(b"a", b"1")]);
        let snap = store.new_snapshot();
        store
            .create_recovery_point(&snap, b"00000000a", 1, || {})
            .expect("rp a");
        snap.close().expect("close");

        fill(&store, &[(b"b", b"2")]);
        let snap = store.new_snapshot();
        store
            .create_recovery_point(&snap, b"00000001b", 1, || {})
            .expect("rp b");
        snap.close().expect("close");

        let points = store.recovery_points();
        assert_eq!(points.len(), 2);

        let restored = store.rollback(&points[0]).expect("rollback");
        assert_eq!(restored.count(), 1);
        assert_eq!(store.items_count(), 1);
        assert_eq!(store.recovery_points().len(), 1);
        restored.close().expect("close");

        // Snapshots from before the rollback are invalid for new scans.
        let stale = store.new_snapshot();
        assert_eq!(stale.generation(), store.generation());
        stale.close().expect("close");
    }

    #[test]
    fn corrupt_chunk_surfaces_checksum_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = disk_store(dir.path());
        fill(&store, &[(b"a", b"1")]);
        let snap = store.new_snapshot();
        store
            .create_recovery_point(&snap, b"00000000x", 1, || {})
            .expect("rp");
        snap.close().expect("close");

        let point = store.recovery_points().pop().expect("point");
        let mut file = OpenOptions::new()
            .write(true)
            .open(&point.path)
            .expect("open rp file");
        file.seek(std::io::SeekFrom::End(-1)).expect("seek");
        file.write_all(&[0xAA]).expect("flip byte");
        drop(file);

        let err = load_items(&point).expect_err("corrupt load");
        assert!(err.is_fatal());
    }
}
