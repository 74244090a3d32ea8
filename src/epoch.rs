// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Table;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Epoch-based deferred reclamation of dropped tables
///
/// A worker or reader holds an [`EpochGuard`] while it may take references
/// from a level snapshot. When a compaction drops tables from a level, the
/// files are not unlinked immediately; they are queued with the epoch at
/// drop time and only physically deleted once every guard that was alive
/// at (or before) that epoch has been released.
#[derive(Clone, Default)]
pub struct ResourceManager {
    inner: Arc<Mutex<ManagerInner>>,
}

#[derive(Default)]
struct ManagerInner {
    /// Monotonically increasing epoch
    epoch: u64,

    /// Live guards per epoch
    active: BTreeMap<u64, usize>,

    /// Tables waiting for reclamation, with the epoch they were dropped at
    deferred: VecDeque<DeferredBatch>,
}

struct DeferredBatch {
    epoch: u64,
    tables: Vec<Table>,

    /// Whether files should be unlinked, or just de-referenced (move-down)
    delete_files: bool,
}

impl ManagerInner {
    fn reclaim(&mut self) {
        let min_active = self.active.keys().next().copied();

        while let Some(batch) = self.deferred.front() {
            // A batch dropped at epoch e may still be referenced by guards
            // acquired at or before e
            let reclaimable = match min_active {
                Some(min) => batch.epoch < min,
                None => true,
            };

            if !reclaimable {
                break;
            }

            #[allow(clippy::expect_used)]
            let batch = self.deferred.pop_front().expect("front was just peeked");

            log::trace!(
                "Reclaiming {} tables dropped at epoch {}",
                batch.tables.len(),
                batch.epoch,
            );

            for table in batch.tables {
                if batch.delete_files {
                    table.mark_deleted();
                }
            }
        }
    }
}

impl ResourceManager {
    /// Acquires a guard pinning the current epoch.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn acquire(&self) -> EpochGuard {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let epoch = inner.epoch;
        *inner.active.entry(epoch).or_insert(0) += 1;

        EpochGuard {
            manager: self.inner.clone(),
            epoch,
        }
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    fn deferred_len(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").deferred.len()
    }
}

/// Scoped epoch acquisition, released on drop
///
/// Tables scheduled through a guard are reclaimed once no guard from the
/// same or an earlier epoch is alive.
pub struct EpochGuard {
    manager: Arc<Mutex<ManagerInner>>,
    epoch: u64,
}

impl EpochGuard {
    /// Schedules tables for deferred deletion.
    ///
    /// The table files are unlinked once reclaimed.
    pub fn defer_delete(&self, tables: Vec<Table>) {
        self.defer(tables, true);
    }

    /// Schedules tables for deferred release without deleting the files.
    ///
    /// Used for move-downs, where the same file lives on at a deeper level.
    pub fn defer_release(&self, tables: Vec<Table>) {
        self.defer(tables, false);
    }

    #[allow(clippy::expect_used)]
    fn defer(&self, tables: Vec<Table>, delete_files: bool) {
        if tables.is_empty() {
            return;
        }

        let mut inner = self.manager.lock().expect("lock is poisoned");

        // Bump the epoch so guards acquired from now on are known to not
        // reference the dropped tables
        let epoch = inner.epoch;
        inner.epoch += 1;

        inner.deferred.push_back(DeferredBatch {
            epoch,
            tables,
            delete_files,
        });
    }
}

impl Drop for EpochGuard {
    #[allow(clippy::expect_used)]
    fn drop(&mut self) {
        let mut inner = self.manager.lock().expect("lock is poisoned");

        if let Some(count) = inner.active.get_mut(&self.epoch) {
            *count -= 1;
            if *count == 0 {
                inner.active.remove(&self.epoch);
            }
        }

        inner.reclaim();
    }
}
