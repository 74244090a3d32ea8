// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-level table bookkeeping

use crate::{
    binary_search::partition_point,
    epoch::EpochGuard,
    merge::BoxedIterator,
    table::iter::ConcatIterator,
    HashSet, InternalValue, KeyRange, SeqNo, Table,
};
use std::sync::RwLock;

/// Returns the `[left, right)` index window of tables whose range
/// overlaps the query range.
///
/// Requires the tables to be sorted by key and pairwise disjoint, so it
/// must not be used for L0.
pub(crate) fn overlapping_range(tables: &[Table], range: &KeyRange) -> (usize, usize) {
    if range.is_inf() {
        return (0, tables.len());
    }
    if range.is_empty() {
        return (0, 0);
    }

    let left = partition_point(tables, |t| t.key_range().max() < range.min());
    let right = partition_point(tables, |t| t.key_range().min() <= range.max());

    (left, right.max(left))
}

#[derive(Default)]
struct LevelInner {
    tables: Vec<Table>,
    total_size: u64,
}

impl LevelInner {
    fn recompute_size(&mut self) {
        self.total_size = self.tables.iter().map(Table::file_size).sum();
    }
}

/// Holds the sorted set of tables at one level and serves reads on it
///
/// L0 is sorted by table ID (flush order) and may contain overlapping
/// tables; every deeper level is sorted by smallest key with pairwise
/// disjoint ranges.
pub struct LevelHandler {
    level: usize,

    /// Target size; 0 for L0, which is scored by table count instead
    max_total_size: u64,

    inner: RwLock<LevelInner>,
}

impl LevelHandler {
    pub(crate) fn new(level: usize, max_total_size: u64) -> Self {
        Self {
            level,
            max_total_size,
            inner: RwLock::new(LevelInner::default()),
        }
    }

    /// The level index.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// The level's target size in bytes.
    #[must_use]
    pub fn max_total_size(&self) -> u64 {
        self.max_total_size
    }

    fn sort_tables(&self, tables: &mut [Table]) {
        if self.level == 0 {
            tables.sort_by_key(Table::id);
        } else {
            tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));
        }
    }

    /// Replaces the level's tables wholesale (used at open).
    #[allow(clippy::expect_used)]
    pub(crate) fn init_tables(&self, mut tables: Vec<Table>) {
        self.sort_tables(&mut tables);

        let mut inner = self.inner.write().expect("lock is poisoned");
        inner.tables = tables;
        inner.recompute_size();
    }

    /// Number of tables at this level.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.inner.read().expect("lock is poisoned").tables.len()
    }

    /// Total bytes at this level.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.inner.read().expect("lock is poisoned").total_size
    }

    /// Takes a consistent snapshot of the level's tables.
    ///
    /// The snapshot stays valid while held: replaced tables are reclaimed
    /// through the epoch manager, never under a reader.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn tables(&self) -> Vec<Table> {
        self.inner.read().expect("lock is poisoned").tables.clone()
    }

    /// Appends a freshly flushed table to L0, unless the level is at the
    /// stall threshold.
    ///
    /// Returning `false` is not an error: it signals backpressure to the
    /// foreground write path.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub(crate) fn try_add_l0_table(&self, table: Table, stall_limit: usize) -> bool {
        debug_assert_eq!(0, self.level);

        let mut inner = self.inner.write().expect("lock is poisoned");

        if inner.tables.len() >= stall_limit {
            return false;
        }

        inner.total_size += table.file_size();
        inner.tables.push(table);

        true
    }

    /// Removes the rewritten `remove` tables and inserts `new` in sorted
    /// position; removed tables are released through the epoch guard.
    #[allow(clippy::expect_used)]
    pub(crate) fn replace_tables(&self, new: Vec<Table>, remove: &[Table], guard: &EpochGuard) {
        let remove_ids = remove.iter().map(Table::id).collect::<HashSet<_>>();

        let mut inner = self.inner.write().expect("lock is poisoned");

        let mut dropped = vec![];
        inner.tables.retain(|t| {
            if remove_ids.contains(&t.id()) {
                dropped.push(t.clone());
                false
            } else {
                true
            }
        });

        debug_assert_eq!(remove.len(), dropped.len(), "table to replace not found");

        inner.tables.extend(new);

        self.sort_tables(&mut inner.tables);
        inner.recompute_size();

        guard.defer_delete(dropped);
    }

    /// Removes the given tables from this level.
    ///
    /// With `move_only`, the tables were promoted to the next level and
    /// must not be physically deleted, only de-referenced.
    #[allow(clippy::expect_used)]
    pub(crate) fn delete_tables(&self, tables: &[Table], guard: &EpochGuard, move_only: bool) {
        let remove_ids = tables.iter().map(Table::id).collect::<HashSet<_>>();

        let mut inner = self.inner.write().expect("lock is poisoned");

        let mut dropped = vec![];
        inner.tables.retain(|t| {
            if remove_ids.contains(&t.id()) {
                dropped.push(t.clone());
                false
            } else {
                true
            }
        });
        inner.recompute_size();

        if move_only {
            guard.defer_release(dropped);
        } else {
            guard.defer_delete(dropped);
        }
    }

    /// Point lookup within this level.
    ///
    /// L0 probes all overlapping tables (they may each hold versions of
    /// the key) and returns the newest visible one; deeper levels probe
    /// the single table whose disjoint range contains the key.
    #[allow(clippy::expect_used)]
    pub fn get(&self, key: &[u8], seqno: SeqNo) -> crate::Result<Option<InternalValue>> {
        let tables = self.tables();

        if self.level == 0 {
            let mut best: Option<InternalValue> = None;

            // Newest tables first, but versions may be spread over all of L0
            for table in tables.iter().rev() {
                if !table.key_range().contains_key(key) {
                    continue;
                }

                if let Some(item) = table.get(key, seqno)? {
                    let newer = best
                        .as_ref()
                        .is_none_or(|best| item.key.seqno > best.key.seqno);

                    if newer {
                        best = Some(item);
                    }
                }
            }

            return Ok(best);
        }

        let idx = partition_point(&tables, |t| t.key_range().max().as_ref() < key);

        let Some(table) = tables.get(idx) else {
            return Ok(None);
        };

        if !table.key_range().contains_key(key) {
            return Ok(None);
        }

        table.get(key, seqno)
    }

    /// Returns the `[left, right)` window of tables overlapping `range`
    /// (levels >= 1 only).
    #[must_use]
    pub fn overlapping_tables(&self, range: &KeyRange) -> (usize, usize) {
        debug_assert_ne!(0, self.level);
        overlapping_range(&self.tables(), range)
    }

    /// Emits the level's iterators for a full scan.
    ///
    /// L0 yields one iterator per table, newest first; deeper levels
    /// yield a single concatenated iterator.
    #[must_use]
    pub fn iterators(&self) -> Vec<BoxedIterator<'static>> {
        let tables = self.tables();

        if self.level == 0 {
            tables
                .iter()
                .rev()
                .map(|t| Box::new(t.iter()) as BoxedIterator<'static>)
                .collect()
        } else if tables.is_empty() {
            vec![]
        } else {
            vec![Box::new(ConcatIterator::new(tables))]
        }
    }

    /// Re-checks the level's sortedness and disjointness invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.level == 0 {
            return Ok(());
        }

        let tables = self.tables();

        for pair in tables.windows(2) {
            let [a, b] = pair else { continue };

            if a.smallest() >= b.smallest() {
                return Err(crate::Error::LevelValidation(format!(
                    "L{}: table {} is not sorted before table {}",
                    self.level,
                    a.id(),
                    b.id(),
                )));
            }

            if a.key_range().max() >= b.key_range().min() {
                return Err(crate::Error::LevelValidation(format!(
                    "L{}: tables {} and {} have overlapping ranges",
                    self.level,
                    a.id(),
                    b.id(),
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::ResourceManager;
    use crate::table::tests::write_test_table;
    use test_log::test;

    #[test]
    fn handler_l0_stall_limit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = LevelHandler::new(0, 0);

        for id in 0..3 {
            let t = write_test_table(dir.path(), id, &[(b"a", id), (b"b", id)])?;
            assert!(handler.try_add_l0_table(t, 3));
        }

        let t = write_test_table(dir.path(), 99, &[(b"a", 99)])?;
        assert!(!handler.try_add_l0_table(t, 3));
        assert_eq!(3, handler.table_count());

        Ok(())
    }

    #[test]
    fn handler_get_prefers_newest_l0_version() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = LevelHandler::new(0, 0);

        let old = write_test_table(dir.path(), 1, &[(b"k", 1)])?;
        let new = write_test_table(dir.path(), 2, &[(b"k", 5)])?;

        assert!(handler.try_add_l0_table(old, 10));
        assert!(handler.try_add_l0_table(new, 10));

        let hit = handler.get(b"k", u64::MAX)?.expect("should exist");
        assert_eq!(5, hit.key.seqno);

        let old_hit = handler.get(b"k", 3)?.expect("should exist");
        assert_eq!(1, old_hit.key.seqno);

        Ok(())
    }

    #[test]
    fn handler_overlapping_tables_window() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = LevelHandler::new(1, 1_000_000);

        handler.init_tables(vec![
            write_test_table(dir.path(), 1, &[(b"a", 0), (b"c", 0)])?,
            write_test_table(dir.path(), 2, &[(b"e", 0), (b"g", 0)])?,
            write_test_table(dir.path(), 3, &[(b"i", 0), (b"k", 0)])?,
        ]);

        let range = |a: &str, b: &str| KeyRange::new((a.into(), b.into()));

        assert_eq!((0, 1), handler.overlapping_tables(&range("a", "b")));
        assert_eq!((0, 2), handler.overlapping_tables(&range("b", "f")));
        assert_eq!((1, 3), handler.overlapping_tables(&range("g", "z")));
        assert_eq!((3, 3), handler.overlapping_tables(&range("x", "z")));
        assert_eq!((0, 3), handler.overlapping_tables(&KeyRange::inf()));

        // Gap between tables
        assert_eq!((1, 1), handler.overlapping_tables(&range("d", "d")));

        Ok(())
    }

    #[test]
    fn handler_replace_tables_keeps_sorted() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = LevelHandler::new(1, 1_000_000);
        let manager = ResourceManager::default();

        let a = write_test_table(dir.path(), 1, &[(b"a", 0), (b"c", 0)])?;
        let b = write_test_table(dir.path(), 2, &[(b"e", 0), (b"g", 0)])?;
        handler.init_tables(vec![a.clone(), b]);

        let replacement = write_test_table(dir.path(), 3, &[(b"a", 1), (b"d", 1)])?;
        let a_path = a.path().to_path_buf();

        {
            let guard = manager.acquire();
            handler.replace_tables(vec![replacement], &[a], &guard);
        }

        assert_eq!(2, handler.table_count());
        handler.validate()?;

        // The replaced table file is gone after the guard was released
        assert!(!a_path.exists());

        Ok(())
    }

    #[test]
    fn handler_validate_catches_overlap() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = LevelHandler::new(1, 1_000_000);

        handler.init_tables(vec![
            write_test_table(dir.path(), 1, &[(b"a", 0), (b"f", 0)])?,
            write_test_table(dir.path(), 2, &[(b"c", 0), (b"g", 0)])?,
        ]);

        assert!(matches!(
            handler.validate(),
            Err(crate::Error::LevelValidation(_))
        ));

        Ok(())
    }
}
