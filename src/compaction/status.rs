// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::CompactionDef;
use crate::KeyRange;
use std::sync::RwLock;

/// Claimed key ranges of one level
#[derive(Debug, Default)]
struct LevelCompactStatus {
    ranges: Vec<KeyRange>,

    /// Bytes of top tables currently being moved out of this level
    delta_size: u64,
}

impl LevelCompactStatus {
    fn overlaps_with(&self, range: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps_with(range))
    }

    fn remove(&mut self, range: &KeyRange) -> bool {
        if let Some(idx) = self.ranges.iter().position(|r| r == range) {
            self.ranges.swap_remove(idx);
            true
        } else {
            false
        }
    }
}

/// Tracks which key ranges are claimed by in-flight compactions
///
/// Claiming is the only synchronization between compaction workers: a
/// worker that cannot atomically claim both the source and destination
/// range of its plan simply drops the plan and retries on the next tick.
pub struct CompactStatus {
    levels: RwLock<Vec<LevelCompactStatus>>,
}

impl CompactStatus {
    /// Creates a status tracker for `level_count` levels.
    #[must_use]
    pub fn new(level_count: usize) -> Self {
        let mut levels = Vec::with_capacity(level_count);
        levels.resize_with(level_count, LevelCompactStatus::default);

        Self {
            levels: RwLock::new(levels),
        }
    }

    /// Returns `true` if any claimed range at `level` overlaps `range`.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn overlaps_with(&self, level: usize, range: &KeyRange) -> bool {
        let levels = self.levels.read().expect("lock is poisoned");
        levels.get(level).is_some_and(|l| l.overlaps_with(range))
    }

    /// Bytes of top tables currently being compacted away from `level`.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn delta_size(&self, level: usize) -> u64 {
        let levels = self.levels.read().expect("lock is poisoned");
        levels.get(level).map_or(0, |l| l.delta_size)
    }

    /// Atomically claims the ranges of a compaction plan.
    ///
    /// Fails (returning `false`) if a conflicting compaction already
    /// claimed an overlapping range at the source or destination level.
    /// On success, all involved tables are flagged as compacting.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn compare_and_add(&self, cd: &CompactionDef) -> bool {
        let mut levels = self.levels.write().expect("lock is poisoned");

        debug_assert!(cd.next_level < levels.len(), "level out of bounds");

        {
            let this = levels.get(cd.this_level);
            let next = levels.get(cd.next_level);

            if this.is_some_and(|l| l.overlaps_with(&cd.this_range))
                || next.is_some_and(|l| l.overlaps_with(&cd.next_range))
            {
                return false;
            }
        }

        if let Some(this) = levels.get_mut(cd.this_level) {
            this.ranges.push(cd.this_range.clone());
            this.delta_size += cd.top_size;
        }
        if let Some(next) = levels.get_mut(cd.next_level) {
            next.ranges.push(cd.next_range.clone());
        }

        for table in cd.input_tables().chain(cd.skipped.iter()) {
            table.mark_compacting(true);
        }

        true
    }

    /// Releases the claims of a compaction plan.
    #[allow(clippy::expect_used)]
    pub fn delete(&self, cd: &CompactionDef) {
        let mut levels = self.levels.write().expect("lock is poisoned");

        if let Some(this) = levels.get_mut(cd.this_level) {
            let found = this.remove(&cd.this_range);
            debug_assert!(found, "this_range was not claimed");

            this.delta_size = this.delta_size.saturating_sub(cd.top_size);
        }
        if let Some(next) = levels.get_mut(cd.next_level) {
            let found = next.remove(&cd.next_range);
            debug_assert!(found, "next_range was not claimed");
        }

        for table in cd.input_tables().chain(cd.skipped.iter()) {
            table.mark_compacting(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionDef;
    use crate::KeyRange;
    use test_log::test;

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new((a.into(), b.into()))
    }

    fn def(this_level: usize, this: KeyRange, next: KeyRange, top_size: u64) -> CompactionDef {
        let mut cd = CompactionDef::new(this_level, this_level + 1);
        cd.this_range = this;
        cd.next_range = next;
        cd.top_size = top_size;
        cd
    }

    #[test]
    fn status_claims_and_releases() {
        let status = CompactStatus::new(3);

        let cd = def(1, range("a", "f"), range("a", "g"), 100);
        assert!(status.compare_and_add(&cd));
        assert_eq!(100, status.delta_size(1));
        assert!(status.overlaps_with(1, &range("e", "x")));
        assert!(status.overlaps_with(2, &range("a", "b")));

        status.delete(&cd);
        assert_eq!(0, status.delta_size(1));
        assert!(!status.overlaps_with(1, &range("e", "x")));
    }

    #[test]
    fn status_rejects_conflicting_this_range() {
        let status = CompactStatus::new(3);

        assert!(status.compare_and_add(&def(1, range("a", "f"), range("a", "g"), 0)));
        assert!(!status.compare_and_add(&def(1, range("e", "j"), range("x", "z"), 0)));

        // Disjoint claim is fine
        assert!(status.compare_and_add(&def(1, range("g", "j"), range("h", "k"), 0)));
    }

    #[test]
    fn status_rejects_conflicting_next_range() {
        let status = CompactStatus::new(4);

        // L1 -> L2 claims (a..g) at level 2
        assert!(status.compare_and_add(&def(1, range("a", "f"), range("a", "g"), 0)));

        // L2 -> L3 with overlapping source range at level 2 must fail
        assert!(!status.compare_and_add(&def(2, range("f", "m"), range("f", "n"), 0)));
    }

    #[test]
    fn status_inf_blocks_whole_level() {
        let status = CompactStatus::new(2);

        assert!(status.compare_and_add(&def(0, KeyRange::inf(), range("a", "z"), 0)));
        assert!(!status.compare_and_add(&def(0, KeyRange::inf(), range("x", "z"), 0)));
        assert!(status.overlaps_with(0, &KeyRange::inf()));
    }
}
