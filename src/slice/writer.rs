//! Writer pool and the dual-store mutation engine.
//!
//! Each worker owns one writer handle per store plus private encode
//! buffers, and drains a bounded command channel. Mutations route to
//! `vbucket % num_writers`, so one source partition always lands on one
//! worker and keeps its arrival order.

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use log::error;

use crate::codec;
use crate::store::{StoreError, StoreWriter};

use super::{Command, MutOp, SliceInner};

#[derive(Default)]
pub(crate) struct WriterPool {
    /// Spawned workers; entries past `num_writers` are standby.
    pub(crate) workers: Vec<WorkerHandle>,
    /// Active writers receiving routed mutations.
    pub(crate) num_writers: usize,
}

pub(crate) struct WorkerHandle {
    pub(crate) tx: mpsc::SyncSender<Command>,
    join: Option<JoinHandle<()>>,
}

/// Store handles of one worker; split from the scratch buffers so scope
/// guards and buffer borrows stay disjoint.
struct Writers<'a> {
    main: &'a StoreWriter,
    back: Option<&'a StoreWriter>,
}

impl Writers<'_> {
    fn back(&self) -> &StoreWriter {
        self.back.expect("secondary slice has a backstore")
    }
}

/// Per-worker scratch buffers, reused across mutations.
#[derive(Default)]
struct Bufs {
    encode: Vec<u8>,
    back_entry: Vec<u8>,
    collate: Vec<u8>,
}

impl SliceInner {
    pub(crate) fn writers_per_partition(&self) -> usize {
        let max = self.conf.read().max_num_writers;
        max.div_ceil(self.num_partitions.max(1)).max(1)
    }

    /// Spawns the initial writer complement and the tuning sampler.
    pub(crate) fn setup_writers(self: &Arc<Self>) {
        let initial = self.writers_per_partition();
        self.token.decrement(initial, true);
        self.start_writers(initial);
        self.tuner.start_sampler(self);
    }

    /// Grows the active writer count to `target`, spawning workers as
    /// needed. Standby workers past the active count stay parked on their
    /// channels.
    pub(crate) fn start_writers(self: &Arc<Self>, target: usize) {
        let mut pool = self.pool.write();
        if pool.num_writers >= target {
            return;
        }
        while pool.workers.len() < target {
            let id = pool.workers.len();
            pool.workers.push(self.spawn_worker(id));
        }
        pool.num_writers = target;
    }

    pub(crate) fn stop_writers(&self, target: usize) {
        let mut pool = self.pool.write();
        if target >= pool.num_writers {
            return;
        }
        pool.num_writers = target;
    }

    fn spawn_worker(self: &Arc<Self>, id: usize) -> WorkerHandle {
        let per_partition = self.writers_per_partition();
        let queue = self.conf.read().cmd_queue_size(per_partition);
        let (tx, rx) = mpsc::sync_channel(queue);
        let slice = self.clone();
        let join = std::thread::Builder::new()
            .name(format!("slicedb-writer-{}-{}", self.inst_id.0, id))
            .spawn(move || slice.worker_loop(rx))
            .expect("spawn writer worker");
        WorkerHandle {
            tx,
            join: Some(join),
        }
    }

    /// Stops every worker (active and standby) and joins the threads.
    pub(crate) fn free_all_writers(&self) {
        let mut pool = self.pool.write();
        for worker in &pool.workers {
            let (ack_tx, ack_rx) = mpsc::sync_channel(1);
            if worker.tx.send(Command::Stop(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
        for worker in &mut pool.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
        pool.workers.clear();
        pool.num_writers = 0;
    }

    pub(crate) fn restart_writers(self: &Arc<Self>, count: usize) {
        self.start_writers(count);
    }

    /// True when the queue is empty and every active worker has drained
    /// past a probe barrier.
    pub(crate) fn check_all_workers_done(&self) -> bool {
        if self.queued() > 0 {
            return false;
        }
        let pool = self.pool.read();
        for worker in pool.workers.iter().take(pool.num_writers) {
            let (tx, rx) = mpsc::sync_channel(1);
            if worker.tx.send(Command::Probe(tx)).is_ok() {
                let _ = rx.recv();
            }
        }
        true
    }

    /// Blocks until the mutation queue is fully drained.
    pub(crate) fn wait_persist(&self) {
        if self.check_all_workers_done() {
            return;
        }
        let poll = self.conf.read().commit_poll_interval;
        loop {
            if self.check_all_workers_done() {
                return;
            }
            std::thread::sleep(poll);
        }
    }

    fn worker_loop(self: Arc<Self>, rx: mpsc::Receiver<Command>) {
        let main = self.mainstore.new_writer();
        let back = self.backstore.as_ref().map(|b| b.new_writer());
        let writers = Writers {
            main: &main,
            back: back.as_ref(),
        };
        let mut bufs = Bufs::default();

        while let Ok(cmd) = rx.recv() {
            match cmd {
                Command::Mutation(m) => {
                    let t0 = Instant::now();
                    let nmut = match m.op {
                        MutOp::Insert | MutOp::Update => self.insert(
                            &writers,
                            &mut bufs,
                            &m.key,
                            &m.docid,
                            m.op == MutOp::Insert,
                        ),
                        MutOp::Delete => self.delete(&writers, &mut bufs, &m.docid),
                    };
                    let elapsed = t0.elapsed();
                    self.total_flush_time_ns
                        .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                    self.q_count.fetch_sub(1, Ordering::SeqCst);
                    self.tuner.record_drain(elapsed, nmut);
                }
                Command::Probe(tx) => {
                    let _ = tx.send(true);
                }
                Command::Stop(tx) => {
                    let _ = tx.send(true);
                    break;
                }
            }
        }
    }

    fn insert(
        &self,
        w: &Writers<'_>,
        bufs: &mut Bufs,
        key: &[u8],
        docid: &[u8],
        init: bool,
    ) -> usize {
        let nmut = if self.defn.is_primary {
            self.insert_primary(w, bufs, docid)
        } else if key.is_empty() {
            // A vanished secondary key degrades to a delete.
            self.delete(w, bufs, docid)
        } else if self.defn.is_array {
            self.insert_sec_array(w, bufs, key, docid, init)
        } else {
            self.insert_sec(w, bufs, key, docid, init)
        };
        self.log_writer_stat();
        nmut
    }

    fn delete(&self, w: &Writers<'_>, bufs: &mut Bufs, docid: &[u8]) -> usize {
        let nmut = if self.defn.is_primary {
            self.delete_primary(w, bufs, docid)
        } else if !self.defn.is_array {
            self.delete_sec(w, bufs, docid, None).0
        } else {
            self.delete_sec_array(w, bufs, docid)
        };
        self.log_writer_stat();
        nmut
    }

    fn insert_primary(&self, w: &Writers<'_>, bufs: &mut Bufs, docid: &[u8]) -> usize {
        if let Err(err) = codec::primary_entry(docid, &mut bufs.encode) {
            panic!("primary entry encode failed: {err}");
        }

        let _scope = w.main.begin();
        match w.main.lookup_kv(&bufs.encode) {
            Err(StoreError::NotFound) => {
                if let Err(err) = w.main.insert_kv(&bufs.encode, &[]) {
                    self.check_fatal_db_error(err);
                }
                self.insert_bytes
                    .fetch_add(bufs.encode.len() as u64, Ordering::Relaxed);
                self.dirty.store(true, Ordering::SeqCst);
                1
            }
            Ok(_) | Err(StoreError::NoValue) => 0,
            Err(err) => self.check_fatal_db_error(err),
        }
    }

    fn insert_sec(
        &self,
        w: &Writers<'_>,
        bufs: &mut Bufs,
        key: &[u8],
        docid: &[u8],
        init: bool,
    ) -> usize {
        let mut ndel = 0;
        // A doc seen before may already carry an entry; drop it first, and
        // short-circuit entirely when the indexed key is unchanged.
        if !init {
            let (nd, changed) = self.delete_sec(w, bufs, docid, Some(key));
            if !changed {
                return 0;
            }
            ndel = nd;
        }

        let cap = self.conf.read().secondary_len_cap();
        if let Err(err) =
            codec::secondary_entry(key, docid, 1, &self.defn.desc, cap, &mut bufs.encode)
        {
            error!(
                "slice {:?}:{:?}:{:?} skipping docid {:?}: {}",
                self.id,
                self.inst_id,
                self.partition_id,
                String::from_utf8_lossy(docid),
                err
            );
            return ndel;
        }

        if !key.is_empty() {
            let _m = w.main.begin();
            let back = w.back();
            let _b = back.begin();

            if let Err(err) = w.main.insert_kv(&bufs.encode, &[]) {
                self.check_fatal_db_error(err);
            }
            if let Err(err) = codec::entry_to_back_entry(&bufs.encode, &mut bufs.back_entry) {
                panic!("back entry projection failed: {err}");
            }
            if let Err(err) = back.insert_kv(docid, &bufs.back_entry) {
                self.check_fatal_db_error(err);
            }
            self.insert_bytes
                .fetch_add((docid.len() + bufs.encode.len()) as u64, Ordering::Relaxed);
        }

        self.dirty.store(true, Ordering::SeqCst);
        1
    }

    fn insert_sec_array(
        &self,
        w: &Writers<'_>,
        bufs: &mut Bufs,
        key: &[u8],
        docid: &[u8],
        init: bool,
    ) -> usize {
        let (allow_large, max_array, scalar_cap) = {
            let conf = self.conf.read();
            (
                conf.allow_large_keys,
                conf.max_array_entry_size,
                conf.secondary_len_cap(),
            )
        };

        if !allow_large && key.len() > max_array {
            error!(
                "slice {:?}:{:?}:{:?} encoded array key too long ({} > {}), skipping docid {:?}",
                self.id,
                self.inst_id,
                self.partition_id,
                key.len(),
                max_array,
                String::from_utf8_lossy(docid)
            );
            self.delete_sec_array(w, bufs, docid);
            return 0;
        }

        let _m = w.main.begin();
        let _b = w.back().begin();

        let mut old_key: Option<Vec<u8>> = None;
        if !init {
            match w.back().lookup_kv(docid) {
                Ok(v) => old_key = Some(v.to_vec()),
                Err(StoreError::NotFound) | Err(StoreError::NoValue) => {}
                Err(err) => self.check_fatal_db_error(err),
            }
        }

        if let Some(old) = &old_key {
            if old.as_slice() == key {
                return 0;
            }
        }

        let pos = self.defn.array_expr_position;
        let distinct = self.defn.array_distinct;

        let mut old_entries: Vec<Vec<u8>> = Vec::new();
        let mut old_counts: Vec<u16> = Vec::new();
        if let Some(old) = &mut old_key {
            // The back index holds the storage (collated) form.
            if let Err(err) = codec::reverse_collate(old, &self.defn.desc) {
                panic!("stored array key failed to decollate: {err}");
            }
            match codec::array_index_items(old, pos, distinct, None) {
                Ok((entries, counts)) => {
                    old_entries = entries;
                    old_counts = counts;
                }
                Err(err) => {
                    error!(
                        "slice {:?}:{:?}:{:?} error expanding old array keys, \
                         skipping docid {:?}: {}",
                        self.id,
                        self.inst_id,
                        self.partition_id,
                        String::from_utf8_lossy(docid),
                        err
                    );
                    self.delete_sec_array(w, bufs, docid);
                    return 0;
                }
            }
        }

        let (new_entries, new_counts) = match codec::array_index_items(
            key,
            pos,
            distinct,
            (!allow_large).then_some(max_array),
        ) {
            Ok(split) => split,
            Err(err) => {
                error!(
                    "slice {:?}:{:?}:{:?} error expanding new array keys, \
                     skipping docid {:?}: {}",
                    self.id,
                    self.inst_id,
                    self.partition_id,
                    String::from_utf8_lossy(docid),
                    err
                );
                self.delete_sec_array(w, bufs, docid);
                return 0;
            }
        };

        let (to_add, to_delete) = if old_entries.is_empty() {
            (new_entries.into_iter().map(Some).collect(), Vec::new())
        } else if new_entries.is_empty() {
            (Vec::new(), old_entries.into_iter().map(Some).collect())
        } else {
            codec::compare_array_entries_with_count(
                new_entries,
                old_entries,
                &new_counts,
                &old_counts,
            )
        };

        let mut nmut = 0usize;

        for (i, item) in to_delete.iter().enumerate() {
            let Some(item) = item else { continue };
            match codec::secondary_entry(
                item,
                docid,
                old_counts[i],
                &self.defn.desc,
                None,
                &mut bufs.encode,
            ) {
                Ok(()) => {
                    if let Err(err) = w.main.delete_kv(&bufs.encode) {
                        self.check_fatal_db_error(err);
                    }
                    self.delete_bytes
                        .fetch_add(bufs.encode.len() as u64, Ordering::Relaxed);
                    nmut += 1;
                }
                Err(err) => {
                    self.rollback_array_deletes(w, bufs, docid, &to_delete, &old_counts, i);
                    error!(
                        "slice {:?}:{:?}:{:?} error forming entry to delete, \
                         skipping docid {:?}: {}",
                        self.id,
                        self.inst_id,
                        self.partition_id,
                        String::from_utf8_lossy(docid),
                        err
                    );
                    self.delete_sec_array(w, bufs, docid);
                    return 0;
                }
            }
        }

        for (i, item) in to_add.iter().enumerate() {
            let Some(item) = item else { continue };
            match codec::secondary_entry(
                item,
                docid,
                new_counts[i],
                &self.defn.desc,
                scalar_cap,
                &mut bufs.encode,
            ) {
                Ok(()) => {
                    if let Err(err) = w.main.insert_kv(&bufs.encode, &[]) {
                        self.check_fatal_db_error(err);
                    }
                    self.insert_bytes
                        .fetch_add(bufs.encode.len() as u64, Ordering::Relaxed);
                    nmut += 1;
                }
                Err(err) => {
                    self.rollback_array_deletes(
                        w,
                        bufs,
                        docid,
                        &to_delete,
                        &old_counts,
                        to_delete.len(),
                    );
                    self.rollback_array_adds(w, bufs, docid, &to_add, &new_counts, i);
                    error!(
                        "slice {:?}:{:?}:{:?} error forming entry to add, \
                         skipping docid {:?}: {}",
                        self.id,
                        self.inst_id,
                        self.partition_id,
                        String::from_utf8_lossy(docid),
                        err
                    );
                    self.delete_sec_array(w, bufs, docid);
                    return 0;
                }
            }
        }

        // Point the back index at the new key, in storage form.
        bufs.collate.clear();
        bufs.collate.extend_from_slice(key);
        if let Err(err) = codec::reverse_collate(&mut bufs.collate, &self.defn.desc) {
            panic!("new array key failed to collate: {err}");
        }
        if old_key.is_some() {
            if let Err(err) = w.back().delete_kv(docid) {
                self.check_fatal_db_error(err);
            }
            self.delete_bytes
                .fetch_add(docid.len() as u64, Ordering::Relaxed);
        }
        if let Err(err) = w.back().insert_kv(docid, &bufs.collate) {
            self.check_fatal_db_error(err);
        }
        self.insert_bytes
            .fetch_add((docid.len() + key.len()) as u64, Ordering::Relaxed);

        self.dirty.store(true, Ordering::SeqCst);
        nmut
    }

    /// Re-inserts entries deleted by a partially applied array update.
    /// `upto` is exclusive. Codec failures here cannot be recovered from.
    fn rollback_array_deletes(
        &self,
        w: &Writers<'_>,
        bufs: &mut Bufs,
        docid: &[u8],
        to_delete: &[Option<Vec<u8>>],
        counts: &[u16],
        upto: usize,
    ) {
        for (i, item) in to_delete.iter().enumerate().take(upto) {
            let Some(item) = item else { continue };
            if let Err(err) =
                codec::secondary_entry(item, docid, counts[i], &self.defn.desc, None, &mut bufs.encode)
            {
                panic!("array delete rollback encode failed: {err}");
            }
            if let Err(err) = w.main.insert_kv(&bufs.encode, &[]) {
                self.check_fatal_db_error(err);
            }
        }
    }

    /// Deletes entries inserted by a partially applied array update.
    /// `upto` is exclusive.
    fn rollback_array_adds(
        &self,
        w: &Writers<'_>,
        bufs: &mut Bufs,
        docid: &[u8],
        to_add: &[Option<Vec<u8>>],
        counts: &[u16],
        upto: usize,
    ) {
        for (i, item) in to_add.iter().enumerate().take(upto) {
            let Some(item) = item else { continue };
            if let Err(err) =
                codec::secondary_entry(item, docid, counts[i], &self.defn.desc, None, &mut bufs.encode)
            {
                panic!("array add rollback encode failed: {err}");
            }
            if let Err(err) = w.main.delete_kv(&bufs.encode) {
                self.check_fatal_db_error(err);
            }
        }
    }

    fn delete_primary(&self, w: &Writers<'_>, bufs: &mut Bufs, docid: &[u8]) -> usize {
        assert!(!docid.is_empty(), "nil primary key on delete");
        if let Err(err) = codec::primary_entry(docid, &mut bufs.encode) {
            panic!("primary entry encode failed: {err}");
        }

        let _scope = w.main.begin();
        match w.main.lookup_kv(&bufs.encode) {
            // Present with no payload: the entry exists, delete it.
            Err(StoreError::NoValue) => {
                if let Err(err) = w.main.delete_kv(&bufs.encode) {
                    self.check_fatal_db_error(err);
                }
                self.delete_bytes
                    .fetch_add(bufs.encode.len() as u64, Ordering::Relaxed);
                self.dirty.store(true, Ordering::SeqCst);
                1
            }
            Ok(_) | Err(StoreError::NotFound) => 0,
            Err(err) => self.check_fatal_db_error(err),
        }
    }

    /// Deletes a doc's entry from both stores. With `compare_key` set,
    /// reports `(0, false)` when the stored back entry already matches —
    /// the "unchanged" signal the insert path short-circuits on.
    fn delete_sec(
        &self,
        w: &Writers<'_>,
        bufs: &mut Bufs,
        docid: &[u8],
        compare_key: Option<&[u8]>,
    ) -> (usize, bool) {
        let back = w.back();
        let _b = back.begin();

        match back.lookup_kv(docid) {
            Ok(bentry) => {
                if let Some(ck) = compare_key {
                    if codec::has_equal_back_entry(ck, &bentry) {
                        return (0, false);
                    }
                }
                self.delete_bytes
                    .fetch_add(docid.len() as u64, Ordering::Relaxed);
                let _m = w.main.begin();
                if let Err(err) = back.delete_kv(docid) {
                    self.check_fatal_db_error(err);
                }
                if let Err(err) = codec::back_entry_to_entry(docid, &bentry, &mut bufs.encode) {
                    panic!("stored back entry failed to decode: {err}");
                }
                if let Err(err) = w.main.delete_kv(&bufs.encode) {
                    self.check_fatal_db_error(err);
                }
            }
            Err(StoreError::NotFound) | Err(StoreError::NoValue) => {}
            Err(err) => self.check_fatal_db_error(err),
        }

        self.dirty.store(true, Ordering::SeqCst);
        (1, true)
    }

    fn delete_sec_array(&self, w: &Writers<'_>, bufs: &mut Bufs, docid: &[u8]) -> usize {
        let back = w.back();
        let _b = back.begin();

        let mut old = match back.lookup_kv(docid) {
            Ok(v) => v.to_vec(),
            Err(StoreError::NotFound) | Err(StoreError::NoValue) => return 0,
            Err(err) => self.check_fatal_db_error(err),
        };

        if let Err(err) = codec::reverse_collate(&mut old, &self.defn.desc) {
            panic!("stored array key failed to decollate: {err}");
        }
        let (entries, counts) = match codec::array_index_items(
            &old,
            self.defn.array_expr_position,
            self.defn.array_distinct,
            None,
        ) {
            Ok(split) => split,
            Err(err) => panic!("stored array key failed to expand: {err}"),
        };

        let _m = w.main.begin();
        for (i, item) in entries.iter().enumerate() {
            if let Err(err) =
                codec::secondary_entry(item, docid, counts[i], &self.defn.desc, None, &mut bufs.encode)
            {
                panic!("entry for stored array key failed to encode: {err}");
            }
            if let Err(err) = w.main.delete_kv(&bufs.encode) {
                self.check_fatal_db_error(err);
            }
            self.delete_bytes
                .fetch_add(bufs.encode.len() as u64, Ordering::Relaxed);
        }

        if let Err(err) = back.delete_kv(docid) {
            self.check_fatal_db_error(err);
        }
        self.delete_bytes
            .fetch_add(docid.len() as u64, Ordering::Relaxed);
        self.dirty.store(true, Ordering::SeqCst);
        entries.len()
    }
}
