//! End-to-end slice scenarios: mutation paths, snapshots, recovery, and
//! writer accounting.

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use slicedb::codec;
use slicedb::slice::{
    IndexDefn, IndexDefnId, IndexInstId, Inclusion, MutationMeta, PartitionId, SeqVector, Slice,
    SliceId,
};
use slicedb::{SliceConfig, WriterTokens};

fn test_config() -> SliceConfig {
    let mut conf = SliceConfig {
        max_num_writers: 4,
        num_readers: 4,
        disable_persistence: true,
        commit_poll_interval: Duration::from_millis(1),
        ..SliceConfig::default()
    };
    conf.purger.enabled = false;
    conf
}

fn persistent_config() -> SliceConfig {
    SliceConfig {
        disable_persistence: false,
        ..test_config()
    }
}

fn open_slice(dir: &std::path::Path, defn: IndexDefn, conf: SliceConfig) -> Slice {
    Slice::open(
        dir.join("slice"),
        SliceId(1),
        defn,
        IndexInstId(100),
        PartitionId(0),
        1,
        conf,
        WriterTokens::new(),
    )
    .expect("open slice")
}

fn meta(vbucket: u16, seqno: u64, first_snap: bool) -> MutationMeta {
    MutationMeta {
        vbucket,
        seqno,
        first_snap,
    }
}

fn ts(seqno: u64) -> SeqVector {
    SeqVector {
        seqnos: vec![seqno],
        vbuuids: vec![42],
    }
}

fn sec_key(fields: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::new();
    for f in fields {
        codec::push_field(&mut key, f);
    }
    key
}

fn array_key(scalar: &[u8], elems: &[&[u8]]) -> Vec<u8> {
    let mut slot = Vec::new();
    for e in elems {
        codec::push_field(&mut slot, e);
    }
    sec_key(&[scalar, &slot])
}

fn collect_entries(slice: &Slice, info: &slicedb::slice::SnapshotInfo) -> Vec<Vec<u8>> {
    let snap = slice.open_snapshot(info).expect("open snapshot");
    let mut ctx = slice.get_reader_context();
    let mut entries = Vec::new();
    snap.all(&mut ctx, |entry| {
        entries.push(entry.to_vec());
        Ok(())
    })
    .expect("scan");
    ctx.done();
    snap.close().expect("close snapshot");
    entries
}

#[test]
fn primary_insert_of_new_doc() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::primary(IndexDefnId(1), "bkt", "pk");
    let slice = open_slice(dir.path(), defn, test_config());

    slice
        .insert(b"", b"doc1", meta(0, 1, true))
        .expect("insert");
    let info = slice.new_snapshot(ts(1), true).expect("snapshot");
    assert_eq!(info.count, 1);

    let snap = slice.open_snapshot(&info).expect("open snapshot");
    let mut ctx = slice.get_reader_context();
    assert_eq!(snap.count_total(), 1);

    let mut keys = Vec::new();
    snap.all(&mut ctx, |entry| {
        keys.push(entry.to_vec());
        Ok(())
    })
    .expect("scan");
    assert_eq!(keys, vec![b"doc1".to_vec()]);

    ctx.done();
    snap.close().expect("close snapshot");
}

#[test]
fn primary_insert_is_idempotent() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::primary(IndexDefnId(1), "bkt", "pk");
    let slice = open_slice(dir.path(), defn, test_config());

    slice.insert(b"", b"doc1", meta(0, 1, true)).expect("first");
    slice
        .insert(b"", b"doc1", meta(0, 2, true))
        .expect("second");
    let info = slice.new_snapshot(ts(2), false).expect("snapshot");
    assert_eq!(info.count, 1);
}

#[test]
fn scalar_update_observability_across_snapshots() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, test_config());

    let key_a = sec_key(&[b"A"]);
    let key_b = sec_key(&[b"B"]);

    slice
        .insert(&key_a, b"d", meta(3, 1, true))
        .expect("insert A");
    let s1 = slice.new_snapshot(ts(1), true).expect("snapshot 1");
    let snap1 = slice.open_snapshot(&s1).expect("open s1");

    slice
        .insert(&key_b, b"d", meta(3, 2, false))
        .expect("insert B");
    let s2 = slice.new_snapshot(ts(2), true).expect("snapshot 2");
    let snap2 = slice.open_snapshot(&s2).expect("open s2");

    let keys_at = |snap: &std::sync::Arc<slicedb::slice::OpenSnapshot>| {
        let mut ctx = slice.get_reader_context();
        let mut keys = Vec::new();
        snap.all(&mut ctx, |entry| {
            let parsed = codec::SecEntry::parse(entry).expect("parse entry");
            keys.push((parsed.key().to_vec(), parsed.docid().to_vec()));
            Ok(())
        })
        .expect("scan");
        keys
    };

    assert_eq!(keys_at(&snap1), vec![(key_a.clone(), b"d".to_vec())]);
    assert_eq!(keys_at(&snap2), vec![(key_b.clone(), b"d".to_vec())]);

    snap1.close().expect("close s1");
    snap2.close().expect("close s2");
}

#[test]
fn unchanged_key_short_circuits() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, test_config());

    let key = sec_key(&[b"same"]);
    slice.insert(&key, b"d", meta(0, 1, true)).expect("insert");
    slice.new_snapshot(ts(1), false).expect("drain");
    let before = slice.statistics();

    slice
        .insert(&key, b"d", meta(0, 2, false))
        .expect("reinsert");
    let info = slice.new_snapshot(ts(2), false).expect("drain");

    let after = slice.statistics();
    assert_eq!(info.count, 1);
    assert_eq!(before.insert_bytes, after.insert_bytes);
    assert_eq!(before.delete_bytes, after.delete_bytes);
}

#[test]
fn array_update_applies_multiset_diff() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::array(IndexDefnId(3), "bkt", "arr", vec![], 1, false);
    let slice = open_slice(dir.path(), defn, test_config());

    let old = array_key(b"s", &[b"1", b"2", b"2", b"3"]);
    let new = array_key(b"s", &[b"2", b"3", b"3", b"4"]);

    slice.insert(&old, b"d", meta(0, 1, true)).expect("insert");
    let s1 = slice.new_snapshot(ts(1), false).expect("snapshot");
    assert_eq!(s1.count, 3);

    slice.insert(&new, b"d", meta(0, 2, false)).expect("update");
    let s2 = slice.new_snapshot(ts(2), false).expect("snapshot");
    assert_eq!(s2.count, 3);

    let entries = collect_entries(&slice, &s2);
    let parsed: Vec<(Vec<u8>, u16)> = entries
        .iter()
        .map(|e| {
            let p = codec::SecEntry::parse(e).expect("parse");
            (p.key().to_vec(), p.count())
        })
        .collect();

    let expected = vec![
        (sec_key(&[b"s", b"2"]), 1),
        (sec_key(&[b"s", b"3"]), 2),
        (sec_key(&[b"s", b"4"]), 1),
    ];
    assert_eq!(parsed, expected);
}

#[test]
fn oversize_array_key_clears_prior_state() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::array(IndexDefnId(3), "bkt", "arr", vec![], 1, false);
    let mut conf = test_config();
    conf.allow_large_keys = false;
    conf.max_array_entry_size = 64;
    let slice = open_slice(dir.path(), defn, conf);

    let small = array_key(b"s", &[b"1"]);
    slice.insert(&small, b"d", meta(0, 1, true)).expect("seed");
    let s1 = slice.new_snapshot(ts(1), false).expect("snapshot");
    assert_eq!(s1.count, 1);

    let huge_elem = vec![7u8; 256];
    let huge = array_key(b"s", &[&huge_elem]);
    slice.insert(&huge, b"d", meta(0, 2, false)).expect("huge");
    let s2 = slice.new_snapshot(ts(2), false).expect("snapshot");
    assert_eq!(s2.count, 0);

    // The doc is fully forgotten: re-inserting as not-first-snap works
    // from a clean back index.
    slice.insert(&small, b"d", meta(0, 3, false)).expect("again");
    let s3 = slice.new_snapshot(ts(3), false).expect("snapshot");
    assert_eq!(s3.count, 1);
}

#[test]
fn descending_field_round_trips_through_update() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![true]);
    let slice = open_slice(dir.path(), defn, test_config());

    let key_a = sec_key(&[b"aa"]);
    let key_b = sec_key(&[b"bb"]);

    slice.insert(&key_a, b"d", meta(0, 1, true)).expect("a");
    slice.insert(&key_b, b"e", meta(1, 2, true)).expect("b");
    let s1 = slice.new_snapshot(ts(2), false).expect("snapshot");
    assert_eq!(s1.count, 2);

    // Descending collation: "bb" sorts before "aa" in storage order.
    let entries = collect_entries(&slice, &s1);
    let docids: Vec<Vec<u8>> = entries
        .iter()
        .map(|e| codec::SecEntry::parse(e).expect("parse").docid().to_vec())
        .collect();
    assert_eq!(docids, vec![b"e".to_vec(), b"d".to_vec()]);

    // Update and delete still find the old entries via the back index.
    slice.insert(&key_b, b"d", meta(0, 3, false)).expect("move");
    let s2 = slice.new_snapshot(ts(3), false).expect("snapshot");
    assert_eq!(s2.count, 2);

    slice.delete(b"d", meta(0, 4, false)).expect("del");
    slice.delete(b"e", meta(1, 5, false)).expect("del");
    let s3 = slice.new_snapshot(ts(5), false).expect("snapshot");
    assert_eq!(s3.count, 0);
}

#[test]
fn scans_cover_lookup_range_and_counts() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, test_config());

    for (i, k) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
        let key = sec_key(&[*k]);
        let docid = format!("doc-{i}");
        slice
            .insert(&key, docid.as_bytes(), meta(i as u16, i as u64 + 1, true))
            .expect("insert");
    }
    let info = slice.new_snapshot(ts(4), false).expect("snapshot");
    let snap = slice.open_snapshot(&info).expect("open");
    let mut ctx = slice.get_reader_context();
    let stop = AtomicBool::new(false);

    assert!(snap
        .exists(&mut ctx, &sec_key(&[b"b"]), &stop)
        .expect("exists"));
    assert!(!snap
        .exists(&mut ctx, &sec_key(&[b"zz"]), &stop)
        .expect("exists"));

    let low = sec_key(&[b"b"]);
    let high = sec_key(&[b"c"]);
    assert_eq!(
        snap.count_range(&mut ctx, &low, &high, Inclusion::Both, &stop)
            .expect("count"),
        2
    );
    assert_eq!(
        snap.count_range(&mut ctx, &low, &high, Inclusion::Neither, &stop)
            .expect("count"),
        0
    );
    assert_eq!(
        snap.count_range(&mut ctx, &low, &high, Inclusion::Low, &stop)
            .expect("count"),
        1
    );
    assert_eq!(
        snap.count_range(&mut ctx, &[], &[], Inclusion::Both, &stop)
            .expect("count"),
        4
    );

    let keys = [&low[..], &high[..]];
    assert_eq!(
        snap.count_lookup(&mut ctx, &keys, &stop).expect("lookup"),
        2
    );

    assert_eq!(
        snap.multi_scan_count(&mut ctx, &[], &[], Inclusion::Both, false, &stop)
            .expect("msc"),
        4
    );

    ctx.done();
    snap.close().expect("close");
}

#[test]
fn scan_cancellation_surfaces_client_cancel() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, test_config());

    slice
        .insert(&sec_key(&[b"a"]), b"d", meta(0, 1, true))
        .expect("insert");
    let info = slice.new_snapshot(ts(1), false).expect("snapshot");
    let snap = slice.open_snapshot(&info).expect("open");
    let mut ctx = slice.get_reader_context();

    let stop = AtomicBool::new(true);
    let err = snap
        .count_range(&mut ctx, &[], &[], Inclusion::Both, &stop)
        .expect_err("cancelled");
    assert!(matches!(err, slicedb::SliceError::ClientCancel));

    ctx.done();
    snap.close().expect("close");
}

#[test]
fn rollback_restores_persisted_snapshot() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, persistent_config());

    for i in 0..10u64 {
        let key = sec_key(&[format!("k{i:03}").as_bytes()]);
        let docid = format!("doc-{i}");
        slice
            .insert(&key, docid.as_bytes(), meta((i % 4) as u16, i + 1, true))
            .expect("insert");
    }
    let committed = slice.new_snapshot(ts(10), true).expect("commit");
    assert_eq!(committed.count, 10);
    let snap = slice.open_snapshot(&committed).expect("open");
    snap.close().expect("close");

    // The persistor runs in the background; wait for the paired point.
    let deadline = Instant::now() + Duration::from_secs(10);
    let snaps = loop {
        let snaps = slice.get_snapshots().expect("get snapshots");
        if !snaps.is_empty() {
            break snaps;
        }
        assert!(Instant::now() < deadline, "recovery point never appeared");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(snaps[0].count, 10);

    for i in 0..1000u64 {
        let key = sec_key(&[format!("extra{i:04}").as_bytes()]);
        let docid = format!("extra-{i}");
        slice
            .insert(&key, docid.as_bytes(), meta((i % 4) as u16, 100 + i, true))
            .expect("insert");
    }
    let later = slice.new_snapshot(ts(1100), false).expect("drain");
    assert_eq!(later.count, 1010);

    slice.rollback(&snaps[0]).expect("rollback");
    let restored = slice.new_snapshot(ts(10), false).expect("snapshot");
    assert_eq!(restored.count, 10);
}

#[test]
fn warm_restart_recovers_from_recovery_point() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);

    {
        let slice = open_slice(dir.path(), defn.clone(), persistent_config());
        for i in 0..5u64 {
            let key = sec_key(&[format!("k{i}").as_bytes()]);
            slice
                .insert(&key, format!("d{i}").as_bytes(), meta(0, i + 1, true))
                .expect("insert");
        }
        let committed = slice.new_snapshot(ts(5), true).expect("commit");
        let snap = slice.open_snapshot(&committed).expect("open");
        snap.close().expect("close");

        let deadline = Instant::now() + Duration::from_secs(10);
        while slice.get_snapshots().expect("get snapshots").is_empty() {
            assert!(Instant::now() < deadline, "recovery point never appeared");
            std::thread::sleep(Duration::from_millis(20));
        }
        slice.close();
    }

    let slice = open_slice(dir.path(), defn, persistent_config());
    let info = slice.new_snapshot(ts(5), false).expect("snapshot");
    assert_eq!(info.count, 5);

    // The recovered forward and back index still pair up: an update
    // replaces rather than duplicates.
    let key = sec_key(&[b"fresh"]);
    slice.insert(&key, b"d0", meta(0, 6, false)).expect("update");
    let after = slice.new_snapshot(ts(6), false).expect("snapshot");
    assert_eq!(after.count, 5);
}

#[test]
fn rollback_to_zero_resets_everything() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, persistent_config());

    for i in 0..8u64 {
        let key = sec_key(&[format!("k{i}").as_bytes()]);
        slice
            .insert(&key, format!("d{i}").as_bytes(), meta(0, i + 1, true))
            .expect("insert");
    }
    let info = slice.new_snapshot(ts(8), false).expect("snapshot");
    assert_eq!(info.count, 8);

    slice.rollback_to_zero().expect("rollback to zero");
    let reset = slice.new_snapshot(ts(0), false).expect("snapshot");
    assert_eq!(reset.count, 0);
    assert_eq!(slice.get_snapshots().expect("snapshots").len(), 0);

    // The slice keeps accepting mutations after the reset.
    slice
        .insert(&sec_key(&[b"again"]), b"d", meta(0, 1, true))
        .expect("insert");
    let again = slice.new_snapshot(ts(1), false).expect("snapshot");
    assert_eq!(again.count, 1);
}

#[test]
fn writer_tokens_are_conserved() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let tokens = WriterTokens::new();

    let conf = test_config();
    let max = conf.max_num_writers;
    let slice = Slice::open(
        dir.path().join("slice"),
        SliceId(1),
        defn,
        IndexInstId(7),
        PartitionId(0),
        1,
        conf,
        tokens.clone(),
    )
    .expect("open slice");

    let in_use = slice.num_writers();
    assert_eq!(
        tokens.available(7).expect("registered") + in_use as i64,
        max as i64
    );

    slice.close();
    assert_eq!(tokens.available(7).expect("registered"), max as i64);
}

#[test]
fn snapshot_refcount_defers_destroy() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let defn = IndexDefn::secondary(IndexDefnId(2), "bkt", "ix", vec![]);
    let slice = open_slice(dir.path(), defn, test_config());
    let path = slice.path().to_path_buf();

    slice
        .insert(&sec_key(&[b"a"]), b"d", meta(0, 1, true))
        .expect("insert");
    let info = slice.new_snapshot(ts(1), false).expect("snapshot");
    let snap = slice.open_snapshot(&info).expect("open");

    slice.destroy();
    assert!(slice.is_soft_deleted());
    assert!(path.exists(), "destroy must defer behind the open snapshot");

    snap.close().expect("close");
    assert!(!path.exists(), "final close performs the deferred destroy");
}
