// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scores the levels to decide where compaction is needed most

use super::CompactStatus;
use crate::{level::handler::LevelHandler, KeyRange};
use std::sync::Arc;

/// A level that wants compaction, and how urgently
#[derive(Clone, Debug, PartialEq)]
pub struct CompactionPriority {
    /// Source level
    pub level: usize,

    /// >= 1.0 means the level is over its target
    pub score: f64,
}

/// Computes per-level compaction priorities.
///
/// - L0 is scored by table count against the compaction trigger, and only
///   while no other compaction has already claimed all of L0.
/// - Deeper levels are scored by size over target, minus the bytes that
///   in-flight compactions are already moving away.
///
/// The result preserves ascending level order; the last level is never a
/// source.
#[must_use]
pub(crate) fn pick_compact_levels(
    levels: &[Arc<LevelHandler>],
    status: &CompactStatus,
    l0_trigger: usize,
) -> Vec<CompactionPriority> {
    let mut priorities = Vec::with_capacity(levels.len());

    if let Some(l0) = levels.first() {
        let table_count = l0.table_count();

        if table_count >= l0_trigger && !status.overlaps_with(0, &KeyRange::inf()) {
            #[allow(clippy::cast_precision_loss)]
            let score = table_count as f64 / l0_trigger as f64;

            priorities.push(CompactionPriority { level: 0, score });
        }
    }

    // The last level has nowhere to compact into
    let last = levels.len().saturating_sub(1);

    for handler in levels.get(1..last).unwrap_or_default() {
        let delta = status.delta_size(handler.level());
        let total_size = handler.total_size();

        if total_size >= handler.max_total_size() + delta {
            #[allow(clippy::cast_precision_loss)]
            let score = (total_size - delta) as f64 / handler.max_total_size() as f64;

            priorities.push(CompactionPriority {
                level: handler.level(),
                score,
            });
        }
    }

    priorities
}
