// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Table iterators

use super::Table;
use crate::{cache::CachedBlock, InternalValue};

/// Iterates over all items of one table, in key order
pub struct TableIter {
    table: Table,
    block_idx: usize,
    block: Option<CachedBlock>,
    pos: usize,
}

impl TableIter {
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            block_idx: 0,
            block: None,
            pos: 0,
        }
    }
}

impl Iterator for TableIter {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(block) = &self.block {
                if let Some(item) = block.get(self.pos) {
                    self.pos += 1;
                    return Some(Ok(item.clone()));
                }

                self.block = None;
                self.block_idx += 1;
            }

            if self.block_idx >= self.table.block_count() {
                return None;
            }

            let block = fail_iter!(self.table.load_block(self.block_idx));
            self.block = Some(block);
            self.pos = 0;
        }
    }
}

/// Chains the iterators of multiple disjoint, sorted tables
///
/// Used for levels `L1+`, where tables are sorted by key range and
/// pairwise disjoint, so simple concatenation yields a sorted stream.
pub struct ConcatIterator {
    tables: Vec<Table>,
    idx: usize,
    current: Option<TableIter>,
}

impl ConcatIterator {
    /// Creates a new concatenating iterator over the given tables.
    #[must_use]
    pub fn new(tables: Vec<Table>) -> Self {
        debug_assert!(
            tables.windows(2).all(|pair| match pair {
                [a, b] => a.smallest() < b.smallest(),
                _ => true,
            }),
            "tables must be sorted by key",
        );

        Self {
            tables,
            idx: 0,
            current: None,
        }
    }
}

impl Iterator for ConcatIterator {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(item) = iter.next() {
                    return Some(item);
                }

                self.current = None;
                self.idx += 1;
            }

            let table = self.tables.get(self.idx)?;
            self.current = Some(table.iter());
        }
    }
}
