//! Seekable forward iterator over one snapshot of the keyspace.

use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;

use super::{KeyKind, Store, VersionedKey};

/// Iterates user keys visible at a snapshot seqno in ascending byte order.
///
/// Each step re-enters the store under its state read lock, so the
/// iterator never pins the map across calls; rollback safety is provided
/// by the slice draining readers first.
#[derive(Debug)]
pub struct SnapshotIterator {
    store: Arc<Store>,
    seqno: u64,
    end_key: Option<Bytes>,
    current: Option<Bytes>,
}

impl SnapshotIterator {
    pub(crate) fn new(store: Arc<Store>, seqno: u64) -> Self {
        Self {
            store,
            seqno,
            end_key: None,
            current: None,
        }
    }

    /// Bounds the scan; iteration stops at the first key `>= end`.
    pub fn set_end_key(&mut self, end: &[u8]) {
        self.end_key = Some(Bytes::copy_from_slice(end));
        if let (Some(cur), Some(end)) = (&self.current, &self.end_key) {
            if cur >= end {
                self.current = None;
            }
        }
    }

    pub fn seek_first(&mut self) {
        self.advance(Bound::Unbounded);
    }

    /// Positions at the first visible key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        let probe = VersionedKey::probe(Bytes::copy_from_slice(target));
        self.advance(Bound::Included(probe));
    }

    pub fn next(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        // (user, 0, Put) is the greatest version of `user`, so excluding it
        // starts the walk at the next user key.
        let past = VersionedKey {
            user: current,
            seqno: 0,
            kind: KeyKind::Put,
        };
        self.advance(Bound::Excluded(past));
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_deref().unwrap_or(&[])
    }

    pub fn close(self) {}

    fn advance(&mut self, start: Bound<VersionedKey>) {
        self.current = None;
        let state = self.store.state.read();
        let mut skip_user: Option<Bytes> = None;

        for entry in state.map.range((start, Bound::Unbounded)) {
            let key = entry.key();
            if let Some(end) = &self.end_key {
                if key.user.as_ref() >= end.as_ref() {
                    return;
                }
            }
            if skip_user.as_ref() == Some(&key.user) {
                continue;
            }
            if key.seqno > self.seqno {
                continue;
            }
            // Newest version at or below the snapshot decides visibility.
            if key.kind == KeyKind::Put {
                self.current = Some(key.user.clone());
                return;
            }
            skip_user = Some(key.user.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Config, Store, StoreError};
    use super::*;

    fn store_with(pairs: &[&[u8]]) -> Arc<Store> {
        let store = Store::open(Config::default()).expect("open");
        let w = store.new_writer();
        let scope = w.begin();
        for k in pairs {
            w.insert_kv(k, b"").expect("insert");
        }
        drop(scope);
        store
    }

    fn collect(it: &mut SnapshotIterator) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        keys
    }

    #[test]
    fn iterates_in_byte_order() {
        let store = store_with(&[b"b", b"a", b"c"]);
        let snap = store.new_snapshot();
        let reader = store.new_reader();
        let mut it = reader.snapshot_iterator(&snap).expect("iterator");

        it.seek_first();
        assert_eq!(collect(&mut it), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        snap.close().expect("close");
    }

    #[test]
    fn seek_and_end_key_bound_the_walk() {
        let store = store_with(&[b"a", b"b", b"c", b"d"]);
        let snap = store.new_snapshot();
        let reader = store.new_reader();
        let mut it = reader.snapshot_iterator(&snap).expect("iterator");

        it.set_end_key(b"d");
        it.seek(b"b");
        assert_eq!(collect(&mut it), vec![b"b".to_vec(), b"c".to_vec()]);
        snap.close().expect("close");
    }

    #[test]
    fn snapshot_hides_later_writes_and_deletes() {
        let store = store_with(&[b"a", b"b"]);
        let snap = store.new_snapshot();

        let w = store.new_writer();
        let scope = w.begin();
        w.insert_kv(b"c", b"").expect("insert");
        w.delete_kv(b"a").expect("delete");
        drop(scope);

        let reader = store.new_reader();
        let mut it = reader.snapshot_iterator(&snap).expect("iterator");
        it.seek_first();
        assert_eq!(collect(&mut it), vec![b"a".to_vec(), b"b".to_vec()]);

        let now = store.new_snapshot();
        let mut it = reader.snapshot_iterator(&now).expect("iterator");
        it.seek_first();
        assert_eq!(collect(&mut it), vec![b"b".to_vec(), b"c".to_vec()]);

        snap.close().expect("close");
        now.close().expect("close");
    }

    #[test]
    fn stale_generation_is_rejected() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = Store::open(Config {
            dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        })
        .expect("open");

        let w = store.new_writer();
        let scope = w.begin();
        w.insert_kv(b"a", b"").expect("insert");
        drop(scope);

        let snap = store.new_snapshot();
        store
            .create_recovery_point(&snap, b"00000000m", 1, || {})
            .expect("rp");

        let point = store.recovery_points().pop().expect("point");
        let restored = store.rollback(&point).expect("rollback");

        let reader = store.new_reader();
        let err = reader.snapshot_iterator(&snap).expect_err("stale snapshot");
        assert!(matches!(err, StoreError::InvalidSnapshot));
        assert!(reader.snapshot_iterator(&restored).is_ok());

        snap.close().expect("close");
        restored.close().expect("close");
    }
}
