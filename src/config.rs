// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    compaction::filter::CompactionFilterFactory, CompressionType, LevelController,
    SequenceNumberCounter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration of the compaction core
///
/// Use [`Config::new`], chain builder methods, then [`Config::open`].
#[derive(Clone)]
pub struct Config {
    /// Data directory (tables + manifest)
    pub path: PathBuf,

    /// Number of levels, including L0 (minimum 2)
    pub max_levels: usize,

    /// Number of L0 tables that triggers L0 -> L1 compaction
    pub num_level_zero_tables: usize,

    /// Number of L0 tables at which foreground installs stall
    ///
    /// Must be strictly greater than `num_level_zero_tables`.
    pub num_level_zero_tables_stall: usize,

    /// Target size of L1 in bytes; deeper levels grow by
    /// `level_size_multiplier`
    pub level_one_size: u64,

    /// Growth factor between level target sizes
    pub level_size_multiplier: u64,

    /// File size cap for tables produced by compaction
    pub max_table_size: u64,

    /// Number of background compaction workers
    pub num_compactors: usize,

    /// Debug knob: workers return immediately without compacting
    pub do_not_compact: bool,

    /// Data block compression per level; the last entry applies to all
    /// deeper levels
    pub compression_per_level: Vec<CompressionType>,

    /// Open without write capability; no compaction, no L0 installs,
    /// no orphan file cleanup
    pub read_only: bool,

    /// Bot-side tables at least this large that no top table truly
    /// collides with are left in place instead of being rewritten
    pub min_skipped_table_size: u64,

    /// Cap on `top + bot` bytes when growing a compaction
    pub max_compaction_expand_size: u64,

    /// Compaction write throughput in bytes per second, 0 = unlimited
    pub compaction_throughput: u64,

    /// Uncompressed target size of table data blocks
    pub block_size: u32,

    /// Bloom filter density of written tables
    pub bloom_bits_per_key: u8,

    /// Shared block cache capacity in bytes
    pub block_cache_bytes: u64,

    /// Optional compaction filter plug-in
    pub compaction_filter_factory: Option<Arc<dyn CompactionFilterFactory>>,
}

impl Config {
    /// Creates a new configuration for the given data directory.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_levels: 7,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 15,
            level_one_size: /* 64 MiB */ 64 * 1_024 * 1_024,
            level_size_multiplier: 10,
            max_table_size: /* 64 MiB */ 64 * 1_024 * 1_024,
            num_compactors: 4,
            do_not_compact: false,
            compression_per_level: vec![CompressionType::None],
            read_only: false,
            min_skipped_table_size: /* 1 MiB */ 1_024 * 1_024,
            max_compaction_expand_size: /* 1 GiB */ 1_024 * 1_024 * 1_024,
            compaction_throughput: 0,
            block_size: /* 4 KiB */ 4_096,
            bloom_bits_per_key: 10,
            block_cache_bytes: /* 32 MiB */ 32 * 1_024 * 1_024,
            compaction_filter_factory: None,
        }
    }

    /// Sets the level count.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn max_levels(mut self, n: usize) -> Self {
        assert!(n >= 2, "need at least two levels");
        self.max_levels = n;
        self
    }

    /// Sets the L0 compaction trigger.
    #[must_use]
    pub fn num_level_zero_tables(mut self, n: usize) -> Self {
        self.num_level_zero_tables = n;
        self
    }

    /// Sets the L0 stall threshold.
    #[must_use]
    pub fn num_level_zero_tables_stall(mut self, n: usize) -> Self {
        self.num_level_zero_tables_stall = n;
        self
    }

    /// Sets the L1 target size.
    #[must_use]
    pub fn level_one_size(mut self, bytes: u64) -> Self {
        self.level_one_size = bytes;
        self
    }

    /// Sets the growth factor between levels.
    #[must_use]
    pub fn level_size_multiplier(mut self, n: u64) -> Self {
        self.level_size_multiplier = n;
        self
    }

    /// Sets the table file size cap during compaction.
    #[must_use]
    pub fn max_table_size(mut self, bytes: u64) -> Self {
        self.max_table_size = bytes;
        self
    }

    /// Sets the number of compaction workers.
    #[must_use]
    pub fn num_compactors(mut self, n: usize) -> Self {
        self.num_compactors = n;
        self
    }

    /// Disables background compaction (for tests and debugging).
    #[must_use]
    pub fn do_not_compact(mut self, b: bool) -> Self {
        self.do_not_compact = b;
        self
    }

    /// Sets per-level compression; the last entry applies to all deeper levels.
    #[must_use]
    pub fn compression_per_level(mut self, levels: Vec<CompressionType>) -> Self {
        self.compression_per_level = levels;
        self
    }

    /// Opens the tree without write capability.
    #[must_use]
    pub fn read_only(mut self, b: bool) -> Self {
        self.read_only = b;
        self
    }

    /// Sets the skipped-table size threshold.
    ///
    /// Smaller values keep level cardinality low, larger values save
    /// write amplification; the sweet spot is workload-dependent.
    #[must_use]
    pub fn min_skipped_table_size(mut self, bytes: u64) -> Self {
        self.min_skipped_table_size = bytes;
        self
    }

    /// Sets the cap on total bytes pulled into one compaction.
    #[must_use]
    pub fn max_compaction_expand_size(mut self, bytes: u64) -> Self {
        self.max_compaction_expand_size = bytes;
        self
    }

    /// Sets the compaction write throughput limit (0 = unlimited).
    #[must_use]
    pub fn compaction_throughput(mut self, bytes_per_sec: u64) -> Self {
        self.compaction_throughput = bytes_per_sec;
        self
    }

    /// Sets the data block size of written tables.
    #[must_use]
    pub fn block_size(mut self, bytes: u32) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the bloom filter density of written tables.
    #[must_use]
    pub fn bloom_bits_per_key(mut self, bits: u8) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    /// Sets the block cache capacity.
    #[must_use]
    pub fn block_cache_bytes(mut self, bytes: u64) -> Self {
        self.block_cache_bytes = bytes;
        self
    }

    /// Installs a compaction filter plug-in.
    #[must_use]
    pub fn compaction_filter_factory(mut self, factory: Arc<dyn CompactionFilterFactory>) -> Self {
        self.compaction_filter_factory = Some(factory);
        self
    }

    /// Returns the compression used for tables at the given level.
    #[must_use]
    pub fn compression_for_level(&self, level: usize) -> CompressionType {
        self.compression_per_level
            .get(level)
            .or_else(|| self.compression_per_level.last())
            .copied()
            .unwrap_or_default()
    }

    /// Returns the target size of the given level (1-based levels; L0 has none).
    #[must_use]
    pub fn level_max_size(&self, level: usize) -> u64 {
        if level == 0 {
            return 0;
        }

        let mut size = self.level_one_size;
        for _ in 1..level {
            size = size.saturating_mul(self.level_size_multiplier);
        }
        size
    }

    /// Opens the level structure, recovering from the manifest.
    ///
    /// `compact_safe_ts` is the MVCC watermark below which old versions
    /// of a key may be collapsed during compaction.
    ///
    /// # Panics
    ///
    /// Panics if the stall threshold is not strictly greater than the
    /// compaction trigger.
    pub fn open(self, compact_safe_ts: SequenceNumberCounter) -> crate::Result<LevelController> {
        assert!(
            self.num_level_zero_tables_stall > self.num_level_zero_tables,
            "stall threshold must be greater than the L0 compaction trigger",
        );

        LevelController::open(self, compact_safe_ts)
    }
}
