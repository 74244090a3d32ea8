// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction planning and execution
//!
//! A compaction merges a set of tables at level `i` ("top") with the
//! overlapping tables at level `i + 1` ("bot") into new tables at
//! `i + 1`:
//!
//! - [`picker`] scores the levels and decides where work is needed
//! - [`filler`] selects the top set and expands it to a compatible bot set
//! - [`builder`] runs the merge and emits the new tables
//! - [`CompactStatus`] keeps concurrent compactions from claiming
//!   overlapping key ranges

pub(crate) mod builder;
pub mod filler;
pub mod filter;
pub mod picker;
mod status;

pub use status::CompactStatus;

use crate::{
    coding::Decode, value::ValuePointer, HashMap, KeyRange, Table, UserKey, ValueType,
};

/// One planned compaction: the unit of work handed from the filler to the
/// builder
#[derive(Debug)]
pub struct CompactionDef {
    /// Source level
    pub this_level: usize,

    /// Destination level (always `this_level + 1`)
    pub next_level: usize,

    /// Tables moving out of the source level
    pub top: Vec<Table>,

    /// Overlapping tables at the destination level that must be rewritten
    pub bot: Vec<Table>,

    /// Overlapping destination tables that no top table truly collides
    /// with; they stay in place to save write amplification
    pub skipped: Vec<Table>,

    /// Claimed range at the source level
    pub this_range: KeyRange,

    /// Claimed range at the destination level
    pub next_range: KeyRange,

    /// Total bytes of `top`
    pub top_size: u64,

    /// Total bytes of `bot`
    pub bot_size: u64,
}

impl CompactionDef {
    pub(crate) fn new(this_level: usize, next_level: usize) -> Self {
        Self {
            this_level,
            next_level,
            top: vec![],
            bot: vec![],
            skipped: vec![],
            this_range: KeyRange::empty(),
            next_range: KeyRange::empty(),
            top_size: 0,
            bot_size: 0,
        }
    }

    /// A compaction with no bot side degenerates to a pure level move:
    /// no merge, no rewrite, just a manifest entry.
    #[must_use]
    pub fn is_move_down(&self) -> bool {
        self.this_level > 0 && self.bot.is_empty() && self.skipped.is_empty() && !self.top.is_empty()
    }

    /// All input tables (top then bot).
    pub(crate) fn input_tables(&self) -> impl Iterator<Item = &Table> {
        self.top.iter().chain(self.bot.iter())
    }
}

/// Bytes made obsolete in blob files by one compaction
///
/// Whenever compaction drops an entry whose value is a [`ValuePointer`],
/// the pointed-to bytes become garbage; the blob GC uses these counters to
/// decide which blob files to rewrite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscardStats {
    /// Discarded bytes per blob file ID
    pub discarded_bytes: HashMap<u64, u64>,
}

impl DiscardStats {
    /// Returns `true` if nothing was discarded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.discarded_bytes.is_empty()
    }

    /// Accounts for a dropped entry, if it is a blob pointer.
    pub(crate) fn add(&mut self, value_type: ValueType, value: &[u8]) {
        if value_type != ValueType::ValuePointer {
            return;
        }

        match ValuePointer::decode_from(&mut &*value) {
            Ok(vptr) => {
                *self.discarded_bytes.entry(vptr.blob_file_id).or_default() +=
                    u64::from(vptr.len);
            }
            Err(e) => {
                log::debug!("Ignoring malformed value pointer in discard stats: {e:?}");
            }
        }
    }
}

/// Computes file-boundary hints from the bot set, so large merges produce
/// output aligned to existing table boundaries.
pub(crate) fn split_hints(cd: &CompactionDef) -> Vec<UserKey> {
    // One split every ~5 bot tables, but not more granular than 3
    let width = (cd.bot.len().div_ceil(5)).max(3);

    let mut hints = vec![];

    for (idx, table) in cd.bot.iter().enumerate() {
        // The last boundary is the end of the input anyway
        if idx + 1 == cd.bot.len() {
            break;
        }

        if idx % width == width - 1 {
            hints.push(table.biggest().user_key.clone());
        }
    }

    hints
}
