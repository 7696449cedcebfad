//! Adaptive writer-pool tuning.
//!
//! A sampler thread turns per-worker drain-time and item counters into
//! sliding-window drain and mutation rates. At commit boundaries the
//! slice compares the two and grows or shrinks the pool by one writer,
//! subject to the instance's token quota and memory-pressure guards.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use super::config::SliceConfig;
use super::SliceInner;

const MIN_FREE_MEMORY: f64 = 20.0 * 1024.0 * 1024.0;

/// Fixed-size sliding window of rate samples.
#[derive(Debug)]
pub(crate) struct Sample {
    values: Vec<f64>,
    pos: usize,
    filled: usize,
}

impl Sample {
    pub fn new(size: usize) -> Self {
        Self {
            values: vec![0.0; size.max(1)],
            pos: 0,
            filled: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.values[self.pos] = value;
        self.pos = (self.pos + 1) % self.values.len();
        self.filled = (self.filled + 1).min(self.values.len());
    }

    fn last_n(&self, count: usize) -> impl Iterator<Item = f64> + '_ {
        let n = count.min(self.filled);
        (1..=n).map(move |back| {
            let at = (self.pos + self.values.len() - back) % self.values.len();
            self.values[at]
        })
    }

    pub fn window_mean(&self, count: usize) -> f64 {
        let n = count.min(self.filled);
        if n == 0 {
            return 0.0;
        }
        self.last_n(count).sum::<f64>() / n as f64
    }

    pub fn window_stddev(&self, count: usize) -> f64 {
        let n = count.min(self.filled);
        if n == 0 {
            return 0.0;
        }
        let mean = self.window_mean(count);
        let var = self.last_n(count).map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        var.sqrt()
    }
}

/// Host memory readings; refreshed from `/proc/meminfo` and overridable
/// for tests. Unknown totals read as abundant so the guards stay open.
#[derive(Debug)]
pub(crate) struct MemoryGauge {
    total: AtomicU64,
    avail: AtomicU64,
    pinned: std::sync::atomic::AtomicBool,
}

impl MemoryGauge {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(u64::MAX),
            avail: AtomicU64::new(u64::MAX),
            pinned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn refresh(&self) {
        if self.pinned.load(Ordering::Relaxed) {
            return;
        }
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return;
        };
        let mut total = None;
        let mut avail = None;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                avail = parse_kb(rest);
            }
        }
        if let (Some(total), Some(avail)) = (total, avail) {
            self.total.store(total, Ordering::Relaxed);
            self.avail.store(avail, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn avail(&self) -> u64 {
        self.avail.load(Ordering::Relaxed)
    }

    /// Pins the gauge to fixed readings; `refresh` becomes a no-op.
    pub fn set_for_tests(&self, total: u64, avail: u64) {
        self.pinned.store(true, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.avail.store(avail, Ordering::Relaxed);
    }
}

fn parse_kb(rest: &str) -> Option<u64> {
    let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kb * 1024)
}

#[derive(Debug)]
struct TunerState {
    drain_rate: Sample,
    mutation_rate: Sample,
    minimum_drain_rate: f64,
    saturate_count: i32,
    num_expand: u64,
    num_reduce: u64,
    last_check: Option<Instant>,
}

pub(crate) struct Tuner {
    enabled: bool,
    adjust_interval: Duration,
    sampling_window: Duration,
    sampling_interval: Duration,
    snap_interval: Duration,
    scaling_factor: f64,
    threshold: i32,
    max_num_writers: usize,

    drain_time_ns: AtomicI64,
    num_items: AtomicI64,

    state: Mutex<TunerState>,
    pub(crate) memory: MemoryGauge,
    sampler_stop: Mutex<Option<mpsc::Sender<()>>>,
    sampler_join: Mutex<Option<JoinHandle<()>>>,
}

impl Tuner {
    pub fn new(conf: &SliceConfig) -> Self {
        let tuning = &conf.writer_tuning;
        let window = (tuning.sampling_window.as_nanos()
            / tuning.sampling_interval.as_nanos().max(1)) as usize;
        Self {
            enabled: tuning.enable,
            adjust_interval: tuning.adjust_interval,
            sampling_window: tuning.sampling_window,
            sampling_interval: tuning.sampling_interval,
            snap_interval: conf.snap_interval,
            scaling_factor: tuning.scaling_factor,
            threshold: tuning.throttling_threshold,
            max_num_writers: conf.max_num_writers,
            drain_time_ns: AtomicI64::new(0),
            num_items: AtomicI64::new(0),
            state: Mutex::new(TunerState {
                drain_rate: Sample::new(window),
                mutation_rate: Sample::new(window),
                minimum_drain_rate: 0.0,
                saturate_count: 0,
                num_expand: 0,
                num_reduce: 0,
                last_check: None,
            }),
            memory: MemoryGauge::new(),
            sampler_stop: Mutex::new(None),
            sampler_join: Mutex::new(None),
        }
    }

    /// Accumulates one mutation's drain time and item count.
    pub fn record_drain(&self, elapsed: Duration, nmut: usize) {
        if !self.enabled {
            return;
        }
        self.drain_time_ns
            .fetch_add(elapsed.as_nanos() as i64, Ordering::Relaxed);
        self.num_items.fetch_add(nmut as i64, Ordering::Relaxed);
    }

    pub fn start_sampler(&self, slice: &Arc<SliceInner>) {
        if !self.enabled {
            return;
        }
        let (tx, rx) = mpsc::channel();
        *self.sampler_stop.lock() = Some(tx);

        let interval = self.sampling_interval;
        let slice = slice.clone();
        let join = std::thread::Builder::new()
            .name(format!("slicedb-sampler-{}", slice.inst_id.0))
            .spawn(move || {
                let mut last = Instant::now();
                let mut last_log = last;
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    let now = Instant::now();
                    let need_log = now.duration_since(last_log) >= Duration::from_secs(60);
                    slice.update_sample(now.duration_since(last), need_log);
                    last = now;
                    if need_log {
                        last_log = now;
                    }
                }
            })
            .expect("spawn tuning sampler");
        *self.sampler_join.lock() = Some(join);
    }

    pub fn stop_sampler(&self) {
        self.sampler_stop.lock().take();
        if let Some(join) = self.sampler_join.lock().take() {
            let _ = join.join();
        }
    }
}

impl SliceInner {
    /// Commit-boundary hook: asserts quiescence and runs one adjustment
    /// round when tuning is enabled.
    pub(crate) fn flush_done(self: &Arc<Self>) {
        if !self.tuner.enabled {
            return;
        }
        self.wait_persist();
        assert_eq!(
            self.queued(),
            0,
            "slice invariant violation - commit with pending mutations"
        );
        self.adjust_writers();
    }

    /// Folds the accumulated counters into the rate windows.
    pub(crate) fn update_sample(&self, elapsed: Duration, need_log: bool) {
        let tuner = &self.tuner;
        let mut state = tuner.state.lock();
        self.tuner.memory.refresh();

        let drain_ns = tuner.drain_time_ns.swap(0, Ordering::SeqCst) as f64;
        let items = tuner.num_items.swap(0, Ordering::SeqCst) as f64;
        let num_writers = self.pool.read().num_writers.max(1);
        let snap_ns = tuner.snap_interval.as_nanos() as f64;

        // Drain rate: items written per writer per snapshot interval.
        let drain_rate = if drain_ns > 0.0 {
            items / drain_ns * snap_ns
        } else {
            0.0
        };
        state.drain_rate.update(drain_rate / num_writers as f64);

        // Mutation rate: items enqueued per snapshot interval.
        let mutation_rate = items / elapsed.as_nanos().max(1) as f64 * snap_ns;
        state.mutation_rate.update(mutation_rate);

        if need_log {
            let pool = self.pool.read();
            info!(
                "slice {:?}:{:?} writers {} standby {} token {} expanded {} reduced {}",
                self.inst_id,
                self.partition_id,
                pool.num_writers,
                pool.workers.len() - pool.num_writers,
                self.token.num(),
                state.num_expand,
                state.num_reduce
            );
            drop(pool);
            self.log_sample(&state, num_writers);
            state.num_expand = 0;
            state.num_reduce = 0;
        }
    }

    fn log_sample(&self, state: &TunerState, num_writers: usize) {
        info!(
            "slice {:?}:{:?} mutation rate {:.2}/{:.2} drain rate {:.2}/{:.2} \
             saturate count {} minimum drain rate {:.2}",
            self.inst_id,
            self.partition_id,
            self.adjusted_mean_mutation_rate(state),
            self.adjusted_aggregate(&state.mutation_rate, self.tuner.adjust_interval, true),
            self.adjusted_mean_drain_rate(state) * num_writers as f64,
            self.adjusted_aggregate(&state.drain_rate, Duration::from_secs(1), true),
            state.saturate_count,
            state.minimum_drain_rate
        );
    }

    /// One adjustment round; no-op until `adjust_interval` has elapsed
    /// since the last.
    pub(crate) fn adjust_writers(self: &Arc<Self>) {
        let tuner = &self.tuner;
        let mut state = tuner.state.lock();

        let now = Instant::now();
        let due = match state.last_check {
            None => true,
            Some(at) => now.duration_since(at) > tuner.adjust_interval,
        };
        if !due {
            return;
        }
        state.last_check = Some(now);

        tuner.memory.refresh();
        self.meet_minimum_drain_rate(&mut state);

        let needed = self.num_writers_needed(&state);
        let needed = self.adjust_needed(needed);

        let num = self.pool.read().num_writers;
        if num < tuner.max_num_writers && needed > num {
            self.expand_writers(&mut state);
        } else if num > 1 && needed < num {
            self.reduce_writers(&mut state);
        }
    }

    /// Tracks misses against the minimum drain rate. The minimum is an
    /// easy-to-reach target; sustained misses mean the drain rate has
    /// saturated or is trending down.
    fn meet_minimum_drain_rate(&self, state: &mut TunerState) {
        let num = self.pool.read().num_writers as f64;
        let recent =
            self.adjusted_aggregate(&state.drain_rate, self.tuner.adjust_interval, false);
        if recent * num < state.minimum_drain_rate {
            if state.saturate_count < self.tuner.threshold {
                state.saturate_count += 1;
            }
        } else if state.saturate_count > 0 {
            state.saturate_count -= 1;
        }
    }

    /// Writers needed to keep up: `ceil(mutation rate / drain rate per
    /// writer)`, clamped to `[1, max]`.
    fn num_writers_needed(&self, state: &TunerState) -> usize {
        let mutation = self.adjusted_mean_mutation_rate(state);
        let drain = self.adjusted_mean_drain_rate(state);

        if drain > 0.0 {
            let needed = (mutation / drain).ceil() as usize;
            return needed.clamp(1, self.tuner.max_num_writers);
        }
        if mutation <= 0.0 {
            return 1;
        }
        self.pool.read().num_writers
    }

    /// Applies the quota and memory guards to the raw demand estimate.
    fn adjust_needed(&self, needed: usize) -> usize {
        let num = self.pool.read().num_writers;

        // Over-subscribed quota: probabilistically volunteer a writer so
        // the largest pools shed first.
        if self.token.num() < 0
            && num as f64 / self.tuner.max_num_writers as f64 > rand::random::<f64>()
        {
            return num.saturating_sub(1);
        }

        if self.minimum_memory() && needed > num {
            return num;
        }

        if self.memory_full() && needed > num && needed > self.writers_per_partition() {
            if num > self.writers_per_partition() {
                return num;
            }
            return self.writers_per_partition();
        }

        needed
    }

    /// Grows by one writer if a token can be reserved.
    fn expand_writers(self: &Arc<Self>, state: &mut TunerState) {
        let num = self.pool.read().num_writers;
        let mean = self.adjusted_mean_drain_rate(state) * num as f64;
        if mean <= 0.0 {
            return;
        }
        if self.token.decrement(1, false) == 0 {
            return;
        }

        self.start_writers(num + 1);
        state.minimum_drain_rate = self.compute_minimum_drain_rate(state, num);
        state.num_expand += 1;

        let pool = self.pool.read();
        log::debug!(
            "slice {:?}:{:?} expand writers {} -> {} (standby {}) token {}",
            self.inst_id,
            self.partition_id,
            num,
            pool.num_writers,
            pool.workers.len() - pool.num_writers,
            self.token.num()
        );
    }

    /// Shrinks by one writer; always succeeds and refunds the token.
    fn reduce_writers(&self, state: &mut TunerState) {
        let num = self.pool.read().num_writers;
        self.stop_writers(num - 1);
        self.token.increment(1);
        state.minimum_drain_rate = self.compute_minimum_drain_rate(state, num);
        state.num_reduce += 1;

        let pool = self.pool.read();
        log::debug!(
            "slice {:?}:{:?} reduce writers {} -> {} (standby {}) token {}",
            self.inst_id,
            self.partition_id,
            num,
            pool.num_writers,
            pool.workers.len() - pool.num_writers,
            self.token.num()
        );
    }

    /// Projects the post-adjustment minimum drain rate from the trailing
    /// mean. Growth adds only a fraction of the projected gain so the
    /// target stays easy to reach.
    fn compute_minimum_drain_rate(&self, state: &TunerState, last_num_writers: usize) -> f64 {
        let num = self.pool.read().num_writers;
        let mean = self.adjusted_mean_drain_rate(state) * last_num_writers as f64;
        let projected = mean * num as f64 / last_num_writers.max(1) as f64;

        if num > last_num_writers {
            return mean + (projected - mean) * self.tuner.scaling_factor;
        }
        projected
    }

    fn adjusted_mean_drain_rate(&self, state: &TunerState) -> f64 {
        self.adjusted_aggregate(&state.drain_rate, Duration::from_secs(1), false)
    }

    fn adjusted_mean_mutation_rate(&self, state: &TunerState) -> f64 {
        self.adjusted_aggregate(&state.mutation_rate, self.tuner.adjust_interval, false)
    }

    /// Windowed aggregate over `interval`, widened under memory pressure
    /// to smooth out transient drops.
    fn adjusted_aggregate(&self, sample: &Sample, interval: Duration, stddev: bool) -> f64 {
        let tuner = &self.tuner;
        let mut count = (interval.as_nanos() / tuner.sampling_interval.as_nanos().max(1))
            .max(1) as usize;

        let avail = tuner.memory.avail() as f64;
        let limit = tuner.memory.total() as f64;
        if avail < limit * 0.20 && avail > 0.0 {
            count *= (limit / avail.max(1.0)) as usize;
            let full = (tuner.sampling_window.as_nanos()
                / tuner.sampling_interval.as_nanos().max(1)) as usize;
            count = count.min(full);
        }

        if stddev {
            sample.window_stddev(count)
        } else {
            sample.window_mean(count)
        }
    }

    fn memory_limit(&self) -> f64 {
        self.tuner.memory.total() as f64
    }

    fn memory_avail(&self) -> f64 {
        self.tuner.memory.avail() as f64
    }

    fn memory_full(&self) -> bool {
        self.memory_avail() < self.memory_limit() * 0.05
    }

    fn minimum_memory(&self) -> bool {
        self.memory_avail() <= MIN_FREE_MEMORY
    }
}
