// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The level structure and its controller

pub mod handler;

use crate::{
    compaction::{
        builder::{compact_build_tables, BuildContext},
        filler::{fill_tables, fill_tables_l0, FillContext},
        picker::{pick_compact_levels, CompactionPriority},
        split_hints, CompactStatus, CompactionDef, DiscardStats,
    },
    epoch::{EpochGuard, ResourceManager},
    file::{fsync_directory, parse_table_file_name, table_file_path},
    manifest::{ManifestChange, ManifestFile},
    merge::Merger,
    stop_signal::StopSignal,
    table::writer::{TableWriter, WriterOptions},
    BlockCache, Config, HashMap, HashSet, InternalValue, KeyRange, RateLimiter, SeqNo,
    SequenceNumberCounter, Table, TableId, UserKey,
};
use handler::LevelHandler;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{Receiver, SyncSender},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

/// How long a worker sleeps after doing useful work
const COMPACT_TICK: Duration = Duration::from_millis(300);

/// How long a worker sleeps when there was nothing to do (or an error)
const IDLE_TICK: Duration = Duration::from_secs(3);

/// Foreground stall poll interval
const STALL_POLL: Duration = Duration::from_millis(10);

/// Diagnostic snapshot of one table
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableInfo {
    /// Table ID
    pub id: TableId,

    /// Level the table lives at
    pub level: usize,

    /// Smallest user key
    pub smallest: UserKey,

    /// Biggest user key
    pub biggest: UserKey,

    /// File size in bytes
    pub file_size: u64,
}

/// Organizes tables into levels and schedules compactions between them
///
/// This is the root object of the crate; see the crate docs for the
/// overall data flow.
pub struct LevelController {
    config: Config,

    levels: Vec<Arc<LevelHandler>>,
    status: CompactStatus,
    manifest: ManifestFile,

    next_table_id: AtomicU64,
    resource_manager: ResourceManager,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<BlockCache>,

    safe_ts: SequenceNumberCounter,
    stop_signal: StopSignal,

    stall_micros: AtomicU64,
    last_unstalled: Mutex<Instant>,

    discard_tx: Mutex<Option<SyncSender<DiscardStats>>>,
}

impl LevelController {
    /// Opens the level structure, reconciling disk state with the manifest.
    pub(crate) fn open(config: Config, safe_ts: SequenceNumberCounter) -> crate::Result<Self> {
        if !config.read_only {
            std::fs::create_dir_all(&config.path)?;
        }

        let manifest = ManifestFile::open(&config.path, config.read_only)?;
        let tables = manifest.tables();

        Self::revert_to_manifest(&config, &tables)?;

        let cache = Arc::new(BlockCache::with_capacity_bytes(
            config.block_cache_bytes,
            config.block_size,
        ));

        let levels = (0..config.max_levels)
            .map(|level| Arc::new(LevelHandler::new(level, config.level_max_size(level))))
            .collect::<Vec<_>>();

        let mut level_tables: Vec<Vec<Table>> = vec![vec![]; config.max_levels];
        let mut max_id = 0;

        for (&id, tm) in &tables {
            max_id = max_id.max(id);

            let level = usize::from(tm.level);
            let level = if level < config.max_levels {
                level
            } else {
                log::warn!(
                    "Table {id} was recorded at level {level}, but only {} levels are configured",
                    config.max_levels,
                );
                config.max_levels - 1
            };

            let path = table_file_path(&config.path, id);
            let table = Table::open(&path, id, tm.compression, cache.clone())?;

            if let Some(slot) = level_tables.get_mut(level) {
                slot.push(table);
            }
        }

        for (handler, tables) in levels.iter().zip(level_tables) {
            handler.init_tables(tables);
        }

        let controller = Self {
            status: CompactStatus::new(config.max_levels),
            levels,
            manifest,
            next_table_id: AtomicU64::new(max_id + 1),
            resource_manager: ResourceManager::default(),
            rate_limiter: Arc::new(RateLimiter::new(config.compaction_throughput)),
            cache,
            safe_ts,
            stop_signal: StopSignal::default(),
            stall_micros: AtomicU64::new(0),
            last_unstalled: Mutex::new(Instant::now()),
            discard_tx: Mutex::new(None),
            config,
        };

        controller.validate()?;

        if !controller.config.read_only {
            fsync_directory(&controller.config.path)?;
        }

        log::info!(
            "Opened level structure with {} tables over {} levels",
            tables.len(),
            controller.config.max_levels,
        );

        Ok(controller)
    }

    /// Reconciles the data directory with the manifest: every referenced
    /// file must exist, every unreferenced table file is deleted.
    fn revert_to_manifest(
        config: &Config,
        tables: &HashMap<TableId, crate::manifest::TableManifest>,
    ) -> crate::Result<()> {
        let mut on_disk = HashSet::default();

        for dirent in std::fs::read_dir(&config.path)? {
            if let Some(id) = parse_table_file_name(&dirent?.path()) {
                on_disk.insert(id);
            }
        }

        for &id in tables.keys() {
            if !on_disk.contains(&id) {
                return Err(crate::Error::TableMissing(id));
            }
        }

        for id in on_disk {
            if !tables.contains_key(&id) {
                let path = table_file_path(&config.path, id);

                if config.read_only {
                    log::debug!("Would sweep orphaned table file {path:?} (read-only)");
                } else {
                    log::debug!("Sweeping orphaned table file {path:?}");
                    std::fs::remove_file(path)?;
                }
            }
        }

        Ok(())
    }

    /// The stop signal shared with all workers.
    #[must_use]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop_signal
    }

    /// Reserves a fresh table ID.
    #[must_use]
    pub fn reserve_table_id(&self) -> TableId {
        self.next_table_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Creates a writer for a new L0 table (a memtable flush).
    pub fn new_l0_writer(&self) -> crate::Result<TableWriter> {
        if self.config.read_only {
            return Err(crate::Error::ReadOnly);
        }

        let id = self.reserve_table_id();

        TableWriter::new(
            &table_file_path(&self.config.path, id),
            id,
            WriterOptions {
                block_size: self.config.block_size,
                bloom_bits_per_key: self.config.bloom_bits_per_key,
                compression: self.config.compression_for_level(0),
                rate_limiter: None,
            },
        )
    }

    /// Opens a finished L0 table file through the shared block cache.
    pub fn open_table(&self, id: TableId) -> crate::Result<Table> {
        Table::open(
            &table_file_path(&self.config.path, id),
            id,
            self.config.compression_for_level(0),
            self.cache.clone(),
        )
    }

    /// Returns `true` while L0 has enough tables to be compacted.
    #[must_use]
    pub fn is_l0_compactable(&self) -> bool {
        self.levels
            .first()
            .is_some_and(|l0| l0.table_count() >= self.config.num_level_zero_tables)
    }

    /// Installs a freshly flushed table into L0.
    ///
    /// The table is first recorded in the manifest, then added to the
    /// level. When L0 is at the stall threshold, this blocks until
    /// background compaction has drained it below the compaction
    /// trigger; stalling is the only backpressure writers observe.
    #[allow(clippy::expect_used)]
    pub fn add_l0_table(&self, table: Table) -> crate::Result<()> {
        if self.config.read_only {
            return Err(crate::Error::ReadOnly);
        }

        let Some(l0) = self.levels.first() else {
            return Err(crate::Error::LevelValidation("no levels".into()));
        };

        self.manifest.add_changes(&[ManifestChange::Create {
            id: table.id(),
            level: 0,
            compression: table.compression(),
        }])?;

        let stall_limit = self.config.num_level_zero_tables_stall;

        if l0.try_add_l0_table(table.clone(), stall_limit) {
            return Ok(());
        }

        let stall_start = Instant::now();
        let mut last_log = Instant::now();

        log::info!(
            "L0 is full ({} tables), stalling writes",
            l0.table_count(),
        );

        loop {
            while self.is_l0_compactable() {
                std::thread::sleep(STALL_POLL);

                if last_log.elapsed() >= Duration::from_secs(1) {
                    log::info!(
                        "Still stalled, L0 has {} tables, stalled for {:?}",
                        l0.table_count(),
                        stall_start.elapsed(),
                    );
                    last_log = Instant::now();
                }
            }

            if l0.try_add_l0_table(table.clone(), stall_limit) {
                break;
            }
        }

        let stalled_for = stall_start.elapsed();

        #[allow(clippy::cast_possible_truncation)]
        self.stall_micros
            .fetch_add(stalled_for.as_micros() as u64, Ordering::AcqRel);

        *self.last_unstalled.lock().expect("lock is poisoned") = Instant::now();

        log::info!("Stall resolved after {stalled_for:?}");

        Ok(())
    }

    /// Total time foreground installs have spent stalled.
    #[must_use]
    pub fn stall_duration(&self) -> Duration {
        Duration::from_micros(self.stall_micros.load(Ordering::Acquire))
    }

    /// Point lookup across all levels.
    ///
    /// Levels are probed in ascending order, so the newest version wins.
    /// The returned item may be a tombstone; `None` only means the key
    /// was never written.
    pub fn get(&self, key: &[u8], seqno: SeqNo) -> crate::Result<Option<InternalValue>> {
        for level in &self.levels {
            if let Some(item) = level.get(key, seqno)? {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Creates a merged iterator over every table of every level.
    ///
    /// Yields all versions, uncollapsed, in `(user key asc, seqno desc)`
    /// order.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = crate::Result<InternalValue>> + 'static {
        let mut iters = vec![];
        for level in &self.levels {
            iters.extend(level.iterators());
        }

        Merger::new(iters)
    }

    /// Diagnostic snapshot of all tables, sorted by (level, id).
    #[must_use]
    pub fn get_table_info(&self) -> Vec<TableInfo> {
        let mut infos = vec![];

        for handler in &self.levels {
            for table in handler.tables() {
                infos.push(TableInfo {
                    id: table.id(),
                    level: handler.level(),
                    smallest: table.key_range().min().clone(),
                    biggest: table.key_range().max().clone(),
                    file_size: table.file_size(),
                });
            }
        }

        infos.sort_by_key(|info| (info.level, info.id));
        infos
    }

    /// Re-checks the level invariants: per-level sortedness and
    /// disjointness, and that no table is listed at two levels.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = HashSet::default();

        for handler in &self.levels {
            handler.validate()?;

            for table in handler.tables() {
                if !seen.insert(table.id()) {
                    return Err(crate::Error::LevelValidation(format!(
                        "table {} appears in multiple levels",
                        table.id(),
                    )));
                }
            }
        }

        Ok(())
    }

    /// Attaches a bounded receiver for discard statistics.
    ///
    /// Compactions block on the channel when it is full; slow blob GC
    /// consumers backpressure compaction, nothing else.
    #[allow(clippy::expect_used)]
    pub fn subscribe_discard_stats(&self, capacity: usize) -> Receiver<DiscardStats> {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        *self.discard_tx.lock().expect("lock is poisoned") = Some(tx);
        rx
    }

    /// Spawns the background compaction workers.
    ///
    /// The first half of the workers serve levels in ascending order
    /// (upper levels can stall foreground writes); the second half chase
    /// the highest score instead.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn spawn_compactors(this: &Arc<Self>) -> Vec<std::thread::JoinHandle<()>> {
        if this.config.read_only {
            log::warn!("Not spawning compactors in read-only mode");
            return vec![];
        }

        (0..this.config.num_compactors)
            .map(|worker_id| {
                let controller = this.clone();

                std::thread::Builder::new()
                    .name(format!("compactor-{worker_id}"))
                    .spawn(move || controller.compaction_worker(worker_id))
                    .expect("failed to spawn compaction worker")
            })
            .collect()
    }

    fn compaction_worker(&self, worker_id: usize) {
        if self.config.do_not_compact {
            log::warn!("Compaction is disabled (do_not_compact)");
            return;
        }

        log::debug!("Compaction worker {worker_id} started");

        let sort_by_score = worker_id >= self.config.num_compactors / 2;

        while !self.stop_signal.is_stopped() {
            let mut priorities = pick_compact_levels(
                &self.levels,
                &self.status,
                self.config.num_level_zero_tables,
            );

            if sort_by_score {
                priorities.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }

            let mut ran = false;

            for priority in priorities {
                if self.stop_signal.is_stopped() {
                    break;
                }

                match self.do_compact(&priority) {
                    Ok(true) => {
                        ran = true;
                        break;
                    }
                    Ok(false) => {
                        // Nothing claimable at this level right now
                    }
                    Err(e) => {
                        log::error!(
                            "Compaction of L{} failed: {e:?}, backing off",
                            priority.level,
                        );
                        self.stop_signal.sleep(IDLE_TICK);
                        break;
                    }
                }
            }

            self.stop_signal
                .sleep(if ran { COMPACT_TICK } else { IDLE_TICK });
        }

        log::debug!("Compaction worker {worker_id} stopped");
    }

    /// Runs a single compaction of the given level, if one can be planned.
    ///
    /// Returns `Ok(false)` if no compatible table set could be claimed;
    /// that is not an error.
    pub fn compact_once(&self, level: usize) -> crate::Result<bool> {
        self.do_compact(&CompactionPriority { level, score: 1.0 })
    }

    /// Plans and runs one compaction for the given priority.
    fn do_compact(&self, priority: &CompactionPriority) -> crate::Result<bool> {
        let level = priority.level;
        assert!(
            level + 1 < self.config.max_levels,
            "cannot compact out of the last level",
        );

        let (Some(this), Some(next)) = (self.levels.get(level), self.levels.get(level + 1))
        else {
            return Ok(false);
        };

        let guard = self.resource_manager.acquire();

        let fill_ctx = FillContext {
            status: &self.status,
            min_skipped_table_size: self.config.min_skipped_table_size,
            max_compaction_expand_size: self.config.max_compaction_expand_size,
        };

        let mut cd = CompactionDef::new(level, level + 1);

        let filled = if level == 0 {
            fill_tables_l0(&mut cd, this, next, &fill_ctx)
        } else {
            fill_tables(&mut cd, this, next, &fill_ctx)
        };

        if !filled {
            return Ok(false);
        }

        log::debug!(
            "Compacting L{} -> L{}: {} top, {} bot, {} skipped (score {:.2})",
            cd.this_level,
            cd.next_level,
            cd.top.len(),
            cd.bot.len(),
            cd.skipped.len(),
            priority.score,
        );

        let result = self.run_compact_def(&cd, &guard);
        self.status.delete(&cd);

        result
    }

    /// Executes a planned compaction: build (or move), commit to the
    /// manifest, then mutate the levels.
    fn run_compact_def(&self, cd: &CompactionDef, guard: &EpochGuard) -> crate::Result<bool> {
        let start = Instant::now();

        let (Some(this), Some(next)) = (
            self.levels.get(cd.this_level),
            self.levels.get(cd.next_level),
        ) else {
            return Ok(false);
        };

        if cd.is_move_down() {
            #[allow(clippy::cast_possible_truncation)]
            let changes = cd
                .top
                .iter()
                .map(|t| ManifestChange::MoveDown {
                    id: t.id(),
                    level: cd.next_level as u8,
                })
                .collect::<Vec<_>>();

            self.manifest.add_changes(&changes)?;

            next.replace_tables(cd.top.clone(), &[], guard);
            this.delete_tables(&cd.top, guard, true);

            log::debug!(
                "Moved {} tables down to L{} in {:?}",
                cd.top.len(),
                cd.next_level,
                start.elapsed(),
            );

            return Ok(true);
        }

        let out = compact_build_tables(cd, self.build_context(cd))?;

        if out.cancelled {
            for table in out.tables {
                table.mark_deleted();
            }
            return Ok(false);
        }

        let compression = self.config.compression_for_level(cd.next_level);

        #[allow(clippy::cast_possible_truncation)]
        let mut changes = out
            .tables
            .iter()
            .map(|t| ManifestChange::Create {
                id: t.id(),
                level: cd.next_level as u8,
                compression,
            })
            .collect::<Vec<_>>();

        changes.extend(cd.input_tables().map(|t| ManifestChange::Delete { id: t.id() }));

        if let Err(e) = self.manifest.add_changes(&changes) {
            // The new files are not referenced anywhere; delete them again
            for table in &out.tables {
                table.mark_deleted();
            }
            return Err(e);
        }

        // In-memory level mutation cannot fail; a reader sees the moved
        // range either at the old level or at the new one, never neither
        next.replace_tables(out.tables.clone(), &cd.bot, guard);
        this.delete_tables(&cd.top, guard, false);

        self.forward_discard_stats(out.discard_stats);

        log::debug!(
            "Compacted L{} -> L{}: {} input tables -> {} output tables in {:?}",
            cd.this_level,
            cd.next_level,
            cd.top.len() + cd.bot.len(),
            out.tables.len(),
            start.elapsed(),
        );

        Ok(true)
    }

    fn build_context(&self, cd: &CompactionDef) -> BuildContext<'_> {
        let mut span = cd.this_range.clone();
        span.extend(&cd.next_range);

        let filter = self
            .config
            .compaction_filter_factory
            .as_ref()
            .map(|factory| factory.create_filter(cd.next_level, span.min(), span.max()));

        let guards = filter.as_ref().map(|f| f.guards()).unwrap_or_default();

        BuildContext {
            dir: &self.config.path,
            writer_opts: WriterOptions {
                block_size: self.config.block_size,
                bloom_bits_per_key: self.config.bloom_bits_per_key,
                compression: self.config.compression_for_level(cd.next_level),
                rate_limiter: Some(self.rate_limiter.clone()),
            },
            cache: self.cache.clone(),
            next_table_id: &self.next_table_id,
            safe_ts: self.safe_ts.get(),
            has_overlap: self.check_overlap(cd),
            filter,
            guards,
            split_hints: split_hints(cd),
            max_table_size: self.config.max_table_size,
            stop_signal: self.stop_signal.clone(),
        }
    }

    /// Whether any level strictly deeper than the destination holds keys
    /// in the compacted range. If not, tombstones and stale versions can
    /// be dropped for good.
    fn check_overlap(&self, cd: &CompactionDef) -> bool {
        let mut range = KeyRange::empty();
        for table in &cd.top {
            range.extend(table.key_range());
        }

        for handler in self.levels.iter().skip(cd.next_level + 1) {
            let (left, right) = handler.overlapping_tables(&range);
            if right > left {
                return true;
            }
        }

        false
    }

    /// Runs compactions until no level wants one anymore.
    ///
    /// Only useful in tests and for offline reorganization; normally the
    /// background workers keep the tree in shape.
    pub fn compact_until_stable(&self) -> crate::Result<()> {
        loop {
            let priorities = pick_compact_levels(
                &self.levels,
                &self.status,
                self.config.num_level_zero_tables,
            );

            if priorities.is_empty() {
                return Ok(());
            }

            let mut ran = false;
            for priority in priorities {
                ran |= self.do_compact(&priority)?;
            }

            if !ran {
                return Ok(());
            }
        }
    }

    fn forward_discard_stats(&self, stats: DiscardStats) {
        if stats.is_empty() {
            return;
        }

        #[allow(clippy::expect_used)]
        let tx = self.discard_tx.lock().expect("lock is poisoned").clone();

        if let Some(tx) = tx {
            // Bounded channel: a slow blob GC consumer backpressures us here
            if tx.send(stats).is_err() {
                log::debug!("Discard stats receiver is gone, dropping stats");

                #[allow(clippy::expect_used)]
                let mut guard = self.discard_tx.lock().expect("lock is poisoned");
                *guard = None;
            }
        }
    }
}
