// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Runs the merge of a planned compaction and emits new tables
//!
//! The input tables are merged into one globally sorted stream, then
//! replayed into table writers while applying, per key version:
//!
//! 1. version collapsing below the MVCC watermark (`compact_safe_ts`)
//! 2. tombstone elision when no deeper level could resurrect data
//! 3. the user's compaction filter verdicts
//! 4. guard-, hint- and skipped-table-driven file boundaries
//!
//! Entries dropped here that point into blob files are accounted in
//! [`DiscardStats`] for the blob garbage collector.

use super::{
    filter::{search_guard, should_finish_file, CompactionFilter, Guard},
    CompactionDef, DiscardStats,
};
use crate::{
    file::table_file_path,
    merge::{BoxedIterator, Merger},
    stop_signal::StopSignal,
    table::{iter::ConcatIterator, writer::WriterOptions},
    BlockCache, InternalValue, SeqNo, Table, TableId, UserKey,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Everything the builder needs from the controller
pub(crate) struct BuildContext<'a> {
    pub dir: &'a Path,
    pub writer_opts: WriterOptions,
    pub cache: Arc<BlockCache>,
    pub next_table_id: &'a AtomicU64,

    /// MVCC watermark: versions at or below it may be collapsed
    pub safe_ts: SeqNo,

    /// Whether any level deeper than the destination holds keys in the
    /// compacted range; decides tombstone retention
    pub has_overlap: bool,

    pub filter: Option<Box<dyn CompactionFilter>>,
    pub guards: Vec<Guard>,
    pub split_hints: Vec<UserKey>,

    pub max_table_size: u64,
    pub stop_signal: StopSignal,
}

/// Result of a compaction build
pub(crate) struct BuildOutput {
    /// New tables, sorted by smallest key; empty when cancelled
    pub tables: Vec<Table>,

    /// Blob bytes made obsolete by dropped entries
    pub discard_stats: DiscardStats,

    /// The build was interrupted by shutdown; any files already written
    /// are unreferenced and swept as orphans on the next open
    pub cancelled: bool,
}

fn assemble_iterators(cd: &CompactionDef) -> Vec<BoxedIterator<'static>> {
    let mut iters: Vec<BoxedIterator<'static>> = vec![];

    if cd.this_level == 0 {
        // L0 tables overlap; one iterator each, newest first, so the
        // merge's source-index tiebreak prefers the freshest data
        for table in cd.top.iter().rev() {
            iters.push(Box::new(table.iter()));
        }
    } else if !cd.top.is_empty() {
        iters.push(Box::new(ConcatIterator::new(cd.top.clone())));
    }

    if !cd.bot.is_empty() {
        iters.push(Box::new(ConcatIterator::new(cd.bot.clone())));
    }

    iters
}

/// Merges the compaction inputs and writes the output tables.
#[allow(clippy::too_many_lines)]
pub(crate) fn compact_build_tables(
    cd: &CompactionDef,
    mut ctx: BuildContext<'_>,
) -> crate::Result<BuildOutput> {
    let mut iter = Merger::new(assemble_iterators(cd)).peekable();

    let mut new_tables: Vec<Table> = vec![];
    let mut discard_stats = DiscardStats::default();

    let mut hints: VecDeque<UserKey> = ctx.split_hints.drain(..).collect();

    let mut skipped: VecDeque<Table> = {
        let mut skipped = cd.skipped.clone();
        skipped.sort_by(|a, b| a.smallest().cmp(b.smallest()));
        skipped.into()
    };

    let mut cancelled = false;

    'outer: while iter.peek().is_some() {
        if ctx.stop_signal.is_stopped() {
            log::debug!("Stopping amidst compaction because of stop signal");
            cancelled = true;
            break 'outer;
        }

        let id: TableId = ctx.next_table_id.fetch_add(1, Ordering::AcqRel);
        let path = table_file_path(ctx.dir, id);

        let mut writer =
            crate::table::writer::TableWriter::new(&path, id, ctx.writer_opts.clone())?;

        let mut last_user_key: Option<UserKey> = None;
        let mut skip_key: Option<UserKey> = None;
        let mut guard: Option<Guard> = None;

        'inner: loop {
            let item = match iter.peek() {
                Some(Ok(item)) => item.clone(),
                Some(Err(_)) => {
                    #[allow(clippy::expect_used)]
                    return Err(iter
                        .next()
                        .expect("item was peeked")
                        .expect_err("peeked item is an error"));
                }
                None => break 'inner,
            };

            // Older versions of a collapsed key are dropped wholesale
            if let Some(sk) = &skip_key {
                if item.key.user_key == *sk {
                    discard_stats.add(item.key.value_type, &item.value);
                    iter.next();
                    continue 'inner;
                }
                skip_key = None;
            }

            let is_new_user_key = last_user_key
                .as_ref()
                .is_none_or(|last| *last != item.key.user_key);

            if is_new_user_key {
                // Output files must never straddle a skipped table's
                // range; cut the file when crossing one of them
                let mut crossed_skipped = false;
                while let Some(first) = skipped.front() {
                    if first.biggest().user_key <= item.key.user_key {
                        skipped.pop_front();
                        crossed_skipped = true;
                    } else {
                        break;
                    }
                }
                if crossed_skipped && !writer.is_empty() {
                    break 'inner;
                }

                if last_user_key.is_none() {
                    // First key of this file decides the shaping guard
                    guard = search_guard(&item.key.user_key, &ctx.guards).cloned();
                } else {
                    if should_finish_file(
                        &item.key.user_key,
                        last_user_key.as_deref(),
                        guard.as_ref(),
                        writer.estimated_size(),
                        ctx.max_table_size,
                    ) {
                        break 'inner;
                    }

                    // Caller-requested boundaries
                    if hints.front().is_some_and(|hint| item.key.user_key >= *hint) {
                        while hints
                            .front()
                            .is_some_and(|hint| *hint <= item.key.user_key)
                        {
                            hints.pop_front();
                        }

                        if !writer.is_empty() {
                            break 'inner;
                        }
                    }
                }

                last_user_key = Some(item.key.user_key.clone());
            }

            if item.key.seqno <= ctx.safe_ts {
                // This is the newest visible version at the watermark,
                // everything older is shadowed and can go
                skip_key = Some(item.key.user_key.clone());

                if item.is_tombstone() {
                    // Without older versions below, the tombstone has
                    // nothing left to shadow
                    if !ctx.has_overlap {
                        discard_stats.add(item.key.value_type, &item.value);
                        iter.next();
                        continue 'inner;
                    }
                } else if let Some(filter) = &mut ctx.filter {
                    match filter.filter(&item.key.user_key, &item.value, &item.user_meta) {
                        super::filter::FilterVerdict::Keep => {}
                        super::filter::FilterVerdict::Drop => {
                            discard_stats.add(item.key.value_type, &item.value);
                            iter.next();
                            continue 'inner;
                        }
                        super::filter::FilterVerdict::MarkTombstone => {
                            discard_stats.add(item.key.value_type, &item.value);
                            iter.next();

                            if ctx.has_overlap {
                                writer.add(InternalValue::new_tombstone(
                                    item.key.user_key.clone(),
                                    item.key.seqno,
                                ))?;
                            }

                            continue 'inner;
                        }
                    }
                }
            }

            writer.add(item)?;
            iter.next();
        }

        if writer.finish()? {
            let table = Table::open(
                &path,
                id,
                ctx.writer_opts.compression,
                ctx.cache.clone(),
            )?;
            new_tables.push(table);
        }
    }

    crate::file::fsync_directory(ctx.dir)?;

    new_tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));

    Ok(BuildOutput {
        tables: new_tables,
        discard_stats,
        cancelled,
    })
}
