//! Slice configuration.
//!
//! Config loading lives above this crate; the slice consumes an already
//! typed settings snapshot. The running config is read under a dedicated
//! config lock and swapped wholesale by `Slice::update_config`.

use std::path::Path;
use std::time::Duration;

use crate::store;

#[derive(Debug, Clone)]
pub struct SliceConfig {
    /// Upper bound on the writer pool; also the instance's token grant.
    pub max_num_writers: usize,
    /// Total mutation buffering across one partition's writers.
    pub slice_buf_size: u64,
    pub num_readers: usize,
    pub disable_persistence: bool,
    /// Recovery points retained per store.
    pub max_rollbacks: usize,

    /// In-memory snapshot cadence; drain and mutation rates are expressed
    /// per this interval.
    pub snap_interval: Duration,
    /// Poll cadence while waiting for the mutation queue to drain.
    pub commit_poll_interval: Duration,
    pub persistence_cpu_percent: usize,

    pub allow_large_keys: bool,
    pub max_secondary_entry_size: usize,
    pub max_array_entry_size: usize,

    /// When set, log cleaning runs only through `Slice::compact`.
    pub manual_compaction: bool,
    pub auto_tune_lss_cleaner: bool,
    pub lss_cleaner_concurrency: usize,

    pub main: IndexStoreSettings,
    pub back: IndexStoreSettings,
    pub purger: PurgerSettings,
    pub writer_tuning: WriterTuningSettings,
}

/// Per-store page and log-cleaner tuning; main and back index carry
/// independent copies.
#[derive(Debug, Clone)]
pub struct IndexStoreSettings {
    pub max_num_page_deltas: usize,
    pub page_split_threshold: usize,
    pub page_merge_threshold: usize,
    pub max_lss_page_segments: usize,
    pub lss_fragmentation: u8,
    pub max_lss_fragmentation: u8,
}

#[derive(Debug, Clone)]
pub struct PurgerSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub compact_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct WriterTuningSettings {
    pub enable: bool,
    pub adjust_interval: Duration,
    pub sampling_window: Duration,
    pub sampling_interval: Duration,
    pub scaling_factor: f64,
    pub throttling_threshold: i32,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            max_num_writers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            slice_buf_size: 1024,
            num_readers: 16,
            disable_persistence: false,
            max_rollbacks: 5,
            snap_interval: Duration::from_millis(100),
            commit_poll_interval: Duration::from_millis(10),
            persistence_cpu_percent: 50,
            allow_large_keys: false,
            max_secondary_entry_size: 4608,
            max_array_entry_size: 10240,
            manual_compaction: false,
            auto_tune_lss_cleaner: false,
            lss_cleaner_concurrency: 4,
            main: IndexStoreSettings::default(),
            back: IndexStoreSettings {
                // The back index sees one write per document, not one per
                // entry; smaller pages keep its delta chains short.
                max_num_page_deltas: 30,
                page_split_threshold: 100,
                ..IndexStoreSettings::default()
            },
            purger: PurgerSettings::default(),
            writer_tuning: WriterTuningSettings::default(),
        }
    }
}

impl Default for IndexStoreSettings {
    fn default() -> Self {
        Self {
            max_num_page_deltas: 200,
            page_split_threshold: 400,
            page_merge_threshold: 25,
            max_lss_page_segments: 4,
            lss_fragmentation: 30,
            max_lss_fragmentation: 70,
        }
    }
}

impl Default for PurgerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            high_threshold: 0.7,
            low_threshold: 0.5,
            compact_ratio: 1.5,
        }
    }
}

impl Default for WriterTuningSettings {
    fn default() -> Self {
        Self {
            enable: false,
            adjust_interval: Duration::from_millis(100),
            sampling_window: Duration::from_millis(1000),
            sampling_interval: Duration::from_millis(100),
            scaling_factor: 0.1,
            throttling_threshold: 10,
        }
    }
}

impl SliceConfig {
    /// Builds one store's config. `subdir` is `mainIndex` or `docIndex`;
    /// persistence is disabled by passing no base path.
    pub(crate) fn store_config(
        &self,
        base: Option<&Path>,
        subdir: &str,
        log_prefix: String,
        settings: &IndexStoreSettings,
        num_partitions: usize,
    ) -> store::Config {
        store::Config {
            dir: base.map(|p| p.join(subdir)),
            log_prefix,
            auto_lss_cleaning: !self.manual_compaction,
            lss_cleaner_threshold: settings.lss_fragmentation,
            lss_cleaner_max_threshold: settings.max_lss_fragmentation,
            lss_cleaner_min_size: 16 * 1024 * 1024,
            // Multi-partition instances keep per-store cleaning single
            // threaded; the host runs many of them.
            lss_cleaner_concurrency: if num_partitions != 1 {
                1
            } else {
                self.lss_cleaner_concurrency
            },
            max_page_items: settings.page_split_threshold,
            min_page_items: settings.page_merge_threshold,
            checkpoint_interval: Duration::from_secs(600),
            purger_enabled: self.purger.enabled,
            purger_interval: self.purger.interval,
            purge_threshold: self.purger.high_threshold,
            purge_low_threshold: self.purger.low_threshold,
        }
    }

    /// Entry-size cap for scalar secondary keys, `None` when large keys
    /// are allowed.
    pub(crate) fn secondary_len_cap(&self) -> Option<usize> {
        if self.allow_large_keys {
            None
        } else {
            Some(self.max_secondary_entry_size)
        }
    }

    /// Per-worker command queue capacity.
    pub(crate) fn cmd_queue_size(&self, writers_per_partition: usize) -> usize {
        let per = self.slice_buf_size.max(writers_per_partition as u64);
        (per / writers_per_partition as u64).max(1) as usize
    }
}
