//! Reader contexts and snapshot scans.
//!
//! Scans check a pooled mainstore reader out lazily, translate the
//! logical operations onto a single snapshot iterator, and surface
//! `IndexRollback` when the snapshot was invalidated underneath them.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec;
use crate::store::{StoreError, StoreReader};

use super::error::SliceError;
use super::snapshot::OpenSnapshot;
use super::SliceInner;

/// Bound inclusion for range scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Neither,
    Low,
    High,
    Both,
}

/// Per-scan reader handle; checked out from the slice pool on first use
/// and returned by `done` (or drop).
pub struct ReaderContext {
    slice: Arc<SliceInner>,
    reader: Option<StoreReader>,
}

impl ReaderContext {
    pub(crate) fn new(slice: Arc<SliceInner>) -> Self {
        Self {
            slice,
            reader: None,
        }
    }

    fn reader(&mut self) -> &StoreReader {
        if self.reader.is_none() {
            self.reader = Some(self.slice.readers.checkout());
        }
        self.reader.as_ref().expect("reader just checked out")
    }

    pub fn done(self) {}
}

impl Drop for ReaderContext {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.slice.readers.put_back(reader);
        }
    }
}

type CmpEntry = fn(&[u8], &[u8]) -> CmpOrdering;

fn sec_key_part(entry: &[u8]) -> &[u8] {
    match codec::SecEntry::parse(entry) {
        Ok(e) => e.key(),
        Err(err) => panic!("malformed entry in mainstore: {err}"),
    }
}

/// Primary entries are bare docids; compare whole.
fn compare_exact(k: &[u8], entry: &[u8]) -> CmpOrdering {
    k.cmp(entry)
}

/// Secondary equality is on the key portion, so one key's run spans all
/// its docids.
fn compare_sec_exact(k: &[u8], entry: &[u8]) -> CmpOrdering {
    k.cmp(sec_key_part(entry))
}

/// Prefix comparison: a bound that is a prefix of the stored key compares
/// equal, letting composite-key prefixes bound scans.
fn compare_prefix(k: &[u8], entry: &[u8]) -> CmpOrdering {
    let key = sec_key_part(entry);
    let n = k.len().min(key.len());
    match k[..n].cmp(&key[..n]) {
        CmpOrdering::Equal if k.len() > key.len() => CmpOrdering::Greater,
        other => other,
    }
}

impl OpenSnapshot {
    pub fn lookup(
        &self,
        ctx: &mut ReaderContext,
        key: &[u8],
        callback: impl FnMut(&[u8]) -> Result<(), SliceError>,
    ) -> Result<(), SliceError> {
        let cmp: CmpEntry = if self.is_primary() {
            compare_exact
        } else {
            compare_sec_exact
        };
        self.iterate(ctx, key, key, Inclusion::Both, cmp, callback)
    }

    pub fn range(
        &self,
        ctx: &mut ReaderContext,
        low: &[u8],
        high: &[u8],
        inclusion: Inclusion,
        callback: impl FnMut(&[u8]) -> Result<(), SliceError>,
    ) -> Result<(), SliceError> {
        let cmp: CmpEntry = if self.is_primary() {
            compare_exact
        } else {
            compare_prefix
        };
        self.iterate(ctx, low, high, inclusion, cmp, callback)
    }

    pub fn all(
        &self,
        ctx: &mut ReaderContext,
        callback: impl FnMut(&[u8]) -> Result<(), SliceError>,
    ) -> Result<(), SliceError> {
        self.range(ctx, &[], &[], Inclusion::Both, callback)
    }

    pub fn count_range(
        &self,
        ctx: &mut ReaderContext,
        low: &[u8],
        high: &[u8],
        inclusion: Inclusion,
        stop: &AtomicBool,
    ) -> Result<u64, SliceError> {
        let mut count = 0u64;
        self.range(ctx, low, high, inclusion, |_| {
            if stop.load(Ordering::Relaxed) {
                return Err(SliceError::ClientCancel);
            }
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    pub fn count_lookup(
        &self,
        ctx: &mut ReaderContext,
        keys: &[&[u8]],
        stop: &AtomicBool,
    ) -> Result<u64, SliceError> {
        let mut count = 0u64;
        for key in keys {
            self.lookup(ctx, key, |_| {
                if stop.load(Ordering::Relaxed) {
                    return Err(SliceError::ClientCancel);
                }
                count += 1;
                Ok(())
            })?;
        }
        Ok(count)
    }

    pub fn exists(
        &self,
        ctx: &mut ReaderContext,
        key: &[u8],
        stop: &AtomicBool,
    ) -> Result<bool, SliceError> {
        let mut count = 0u64;
        self.lookup(ctx, key, |_| {
            if stop.load(Ordering::Relaxed) {
                return Err(SliceError::ClientCancel);
            }
            count += 1;
            Ok(())
        })?;
        Ok(count != 0)
    }

    /// Counts entries in range, de-duplicating on the leading key when
    /// `distinct` is set and expanding count-encoded array entries when it
    /// is not.
    pub fn multi_scan_count(
        &self,
        ctx: &mut ReaderContext,
        low: &[u8],
        high: &[u8],
        inclusion: Inclusion,
        distinct: bool,
        stop: &AtomicBool,
    ) -> Result<u64, SliceError> {
        let primary = self.is_primary();
        let check_distinct = distinct && !primary;
        let desc = self.slice().defn.desc.clone();
        let has_desc = desc.iter().any(|d| *d);

        let mut count = 0u64;
        let mut prev: Vec<u8> = Vec::new();
        let mut revbuf: Vec<u8> = Vec::new();

        self.range(ctx, low, high, inclusion, |entry| {
            if stop.load(Ordering::Relaxed) {
                return Err(SliceError::ClientCancel);
            }
            if primary {
                count += 1;
                return Ok(());
            }

            let parsed = codec::SecEntry::parse(entry)?;
            // Filter on a canonical copy; the stored bytes stay collated.
            let canonical: &[u8] = if has_desc {
                revbuf.clear();
                revbuf.extend_from_slice(parsed.key());
                codec::reverse_collate(&mut revbuf, &desc)?;
                &revbuf
            } else {
                parsed.key()
            };

            if check_distinct {
                let fields = codec::split_fields(canonical)?;
                let leading = fields.first().copied().unwrap_or(canonical);
                if !prev.is_empty() && prev == leading {
                    return Ok(());
                }
                prev.clear();
                prev.extend_from_slice(leading);
                count += 1;
            } else {
                count += parsed.count() as u64;
            }
            Ok(())
        })?;
        Ok(count)
    }

    fn iterate(
        &self,
        ctx: &mut ReaderContext,
        low: &[u8],
        high: &[u8],
        inclusion: Inclusion,
        cmp: CmpEntry,
        mut callback: impl FnMut(&[u8]) -> Result<(), SliceError>,
    ) -> Result<(), SliceError> {
        let primary = self.is_primary();
        let reader = ctx.reader();
        let mut it = reader
            .snapshot_iterator(&self.main_snap)
            .map_err(|err| match err {
                StoreError::InvalidSnapshot => SliceError::IndexRollback,
                other => SliceError::Store(other),
            })?;

        if !high.is_empty() {
            if matches!(inclusion, Inclusion::High | Inclusion::Both) {
                let end = codec::gen_next_bigger_key(high, primary);
                if !end.is_empty() {
                    it.set_end_key(&end);
                }
            } else {
                it.set_end_key(high);
            }
        }

        if low.is_empty() {
            it.seek_first();
        } else {
            it.seek(low);
            // An exclusive low bound discards the leading equal-key run.
            if matches!(inclusion, Inclusion::Neither | Inclusion::High) {
                iter_equal_keys(low, &mut it, cmp, None)?;
            }
        }

        while it.valid() {
            let entry = it.key();
            if !high.is_empty() && cmp(high, entry) != CmpOrdering::Greater {
                break;
            }
            callback(entry)?;
            it.next();
        }

        if !high.is_empty() && matches!(inclusion, Inclusion::High | Inclusion::Both) {
            iter_equal_keys(high, &mut it, cmp, Some(&mut callback))?;
        }

        Ok(())
    }
}

fn iter_equal_keys(
    bound: &[u8],
    it: &mut crate::store::SnapshotIterator,
    cmp: CmpEntry,
    mut callback: Option<&mut dyn FnMut(&[u8]) -> Result<(), SliceError>>,
) -> Result<(), SliceError> {
    while it.valid() {
        let entry = it.key();
        if cmp(bound, entry) == CmpOrdering::Equal {
            if let Some(cb) = callback.as_mut() {
                cb(entry)?;
            }
        } else {
            break;
        }
        it.next();
    }
    Ok(())
}
