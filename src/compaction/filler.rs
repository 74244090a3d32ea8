// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Selects the input tables of a compaction
//!
//! Given a source level, the filler picks a "top" set of tables there and
//! expands it to the compatible "bot" set at the next level, then claims
//! both ranges in the [`CompactStatus`]. A claim failure is not an error;
//! the worker simply retries on its next tick.

use super::{CompactStatus, CompactionDef};
use crate::{
    level::handler::{overlapping_range, LevelHandler},
    KeyRange, Table,
};

/// Filler tunables, lifted out of the config
pub(crate) struct FillContext<'a> {
    pub status: &'a CompactStatus,

    /// Bot tables at least this large without a true top collision are
    /// skipped instead of rewritten
    pub min_skipped_table_size: u64,

    /// Cap on `top + bot` bytes when growing a compaction
    pub max_compaction_expand_size: u64,
}

fn tables_key_range(tables: &[Table]) -> KeyRange {
    let mut range = KeyRange::empty();
    for table in tables {
        range.extend(table.key_range());
    }
    range
}

fn tables_size(tables: &[Table]) -> u64 {
    tables.iter().map(Table::file_size).sum()
}

/// Splits the overlapping bot-side candidates into `bot` (rewritten) and
/// `skipped` (left in place).
///
/// A candidate whose range no top table actually intersects does not have
/// to be rewritten; doing so anyway would be pure write amplification.
/// Small candidates are still folded in, so level cardinality stays
/// bounded.
pub(crate) fn fill_bottom_tables(
    cd: &mut CompactionDef,
    overlapping: &[Table],
    min_skipped_table_size: u64,
) {
    cd.bot.clear();
    cd.skipped.clear();

    for table in overlapping {
        let collides = cd.top.iter().any(|top| top.overlaps(table.key_range()));

        if collides || table.file_size() < min_skipped_table_size {
            cd.bot.push(table.clone());
        } else {
            cd.skipped.push(table.clone());
        }
    }

    cd.bot_size = tables_size(&cd.bot);
}

/// Plans an L0 -> L1 compaction: all of L0 is the top set.
///
/// Because L0 tables overlap each other, the whole level is claimed with
/// the `inf` sentinel; only one L0 compaction runs at a time.
#[must_use]
pub(crate) fn fill_tables_l0(
    cd: &mut CompactionDef,
    this: &LevelHandler,
    next: &LevelHandler,
    ctx: &FillContext<'_>,
) -> bool {
    debug_assert_eq!(0, cd.this_level);

    let top = this.tables();
    if top.is_empty() {
        return false;
    }

    cd.this_range = KeyRange::inf();
    cd.top_size = tables_size(&top);

    let key_range = tables_key_range(&top);
    cd.top = top;

    let next_tables = next.tables();
    let (left, right) = overlapping_range(&next_tables, &key_range);
    let overlapping = next_tables.get(left..right).unwrap_or_default();

    fill_bottom_tables(cd, overlapping, ctx.min_skipped_table_size);

    cd.next_range = if overlapping.is_empty() {
        // Bottom-most for this range; claim the span the new tables will cover
        key_range
    } else {
        tables_key_range(overlapping)
    };

    ctx.status.compare_and_add(cd)
}

/// Plans a compaction from a level >= 1.
///
/// The seed is the single table with the best `top_size / bot_size` ratio
/// (greedy write-amplification minimization); the top set is then grown
/// to both sides while the ratio does not degrade and the total stays
/// under the expansion cap.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn fill_tables(
    cd: &mut CompactionDef,
    this: &LevelHandler,
    next: &LevelHandler,
    ctx: &FillContext<'_>,
) -> bool {
    debug_assert!(cd.this_level >= 1);

    let this_tables = this.tables();
    let next_tables = next.tables();

    if this_tables.is_empty() {
        return false;
    }

    // Seed selection
    let mut seed: Option<(usize, (usize, usize), u64, f64)> = None;

    for (idx, table) in this_tables.iter().enumerate() {
        if table.is_compacting() {
            continue;
        }

        let (left, right) = overlapping_range(&next_tables, table.key_range());
        let window = next_tables.get(left..right).unwrap_or_default();

        if window.iter().any(Table::is_compacting) {
            continue;
        }

        let bot_size = tables_size(window);
        let ratio = table.file_size() as f64 / bot_size.max(1) as f64;

        let better = seed.as_ref().is_none_or(|(_, _, _, best)| ratio > *best);
        if better {
            seed = Some((idx, (left, right), bot_size, ratio));
        }
    }

    let Some((seed_idx, (mut bot_left, mut bot_right), mut bot_size, mut ratio)) = seed else {
        return false;
    };

    let mut top_lo = seed_idx;
    let mut top_hi = seed_idx;
    let mut top_size = this_tables
        .get(seed_idx)
        .map(Table::file_size)
        .unwrap_or_default();

    // Expand leftward
    while top_lo > 0 {
        let Some(candidate) = this_tables.get(top_lo - 1) else {
            break;
        };

        if candidate.is_compacting() {
            break;
        }

        let (left, right) = overlapping_range(&next_tables, candidate.key_range());

        // The candidate's bot window must connect to ours, otherwise the
        // output would straddle an untouched next-level table
        if right < bot_left {
            break;
        }

        let new_bots = next_tables.get(left..bot_left).unwrap_or_default();
        if new_bots.iter().any(Table::is_compacting) {
            break;
        }

        let new_top_size = top_size + candidate.file_size();
        let new_bot_size = bot_size + tables_size(new_bots);
        let new_ratio = new_top_size as f64 / new_bot_size.max(1) as f64;

        if new_ratio < ratio || new_top_size + new_bot_size > ctx.max_compaction_expand_size {
            break;
        }

        top_lo -= 1;
        top_size = new_top_size;
        bot_size = new_bot_size;
        bot_left = left.min(bot_left);
        ratio = new_ratio;
    }

    // Expand rightward
    while top_hi + 1 < this_tables.len() {
        let Some(candidate) = this_tables.get(top_hi + 1) else {
            break;
        };

        if candidate.is_compacting() {
            break;
        }

        let (left, right) = overlapping_range(&next_tables, candidate.key_range());

        if left > bot_right {
            break;
        }

        let new_bots = next_tables.get(bot_right..right).unwrap_or_default();
        if new_bots.iter().any(Table::is_compacting) {
            break;
        }

        let new_top_size = top_size + candidate.file_size();
        let new_bot_size = bot_size + tables_size(new_bots);
        let new_ratio = new_top_size as f64 / new_bot_size.max(1) as f64;

        if new_ratio < ratio || new_top_size + new_bot_size > ctx.max_compaction_expand_size {
            break;
        }

        top_hi += 1;
        top_size = new_top_size;
        bot_size = new_bot_size;
        bot_right = right.max(bot_right);
        ratio = new_ratio;
    }

    cd.top = this_tables
        .get(top_lo..=top_hi)
        .unwrap_or_default()
        .to_vec();
    cd.top_size = top_size;
    cd.this_range = tables_key_range(&cd.top);

    let overlapping = next_tables.get(bot_left..bot_right).unwrap_or_default();
    fill_bottom_tables(cd, overlapping, ctx.min_skipped_table_size);

    cd.next_range = if overlapping.is_empty() {
        cd.this_range.clone()
    } else {
        tables_key_range(overlapping)
    };

    ctx.status.compare_and_add(cd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionDef;
    use crate::table::tests::write_sized_table;
    use crate::HashSet;
    use test_log::test;

    const KIB: usize = 1_024;

    fn ctx(status: &CompactStatus) -> FillContext<'_> {
        FillContext {
            status,
            min_skipped_table_size: 1_024 * 1_024,
            max_compaction_expand_size: 1_024 * 1_024 * 1_024,
        }
    }

    fn ids(tables: &[crate::Table]) -> HashSet<crate::TableId> {
        tables.iter().map(crate::Table::id).collect()
    }

    #[test]
    fn filler_seed_maximizes_ratio() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let this = LevelHandler::new(1, 0);
        this.init_tables(vec![
            write_sized_table(dir.path(), 1, "a", "b", 10 * KIB)?,
            write_sized_table(dir.path(), 2, "c", "d", 100 * KIB)?,
            write_sized_table(dir.path(), 3, "e", "f", 10 * KIB)?,
        ]);

        let next = LevelHandler::new(2, 0);
        next.init_tables(vec![
            write_sized_table(dir.path(), 4, "a", "b", 10 * KIB)?,
            write_sized_table(dir.path(), 5, "c", "d", 1_000 * KIB)?,
            write_sized_table(dir.path(), 6, "e", "f", 10 * KIB)?,
        ]);

        let status = CompactStatus::new(3);

        let mut cd = CompactionDef::new(1, 2);
        assert!(fill_tables(&mut cd, &this, &next, &ctx(&status)));

        // B (10:100 ratio against the huge Y) must not be part of the pick
        assert!(!ids(&cd.top).contains(&2));
        assert!(!ids(&cd.bot).contains(&5));

        // The seed is one of the unit-ratio tables
        assert!(ids(&cd.top).contains(&1) || ids(&cd.top).contains(&3));

        Ok(())
    }

    #[test]
    fn filler_expands_into_free_neighbor() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Two top tables, empty next level: expansion is free and the
        // result degenerates to a move-down
        let this = LevelHandler::new(1, 0);
        this.init_tables(vec![
            write_sized_table(dir.path(), 1, "a", "b", 10 * KIB)?,
            write_sized_table(dir.path(), 2, "c", "d", 10 * KIB)?,
        ]);

        let next = LevelHandler::new(2, 0);

        let status = CompactStatus::new(3);

        let mut cd = CompactionDef::new(1, 2);
        assert!(fill_tables(&mut cd, &this, &next, &ctx(&status)));

        assert_eq!(ids(&cd.top), [1, 2].into_iter().collect());
        assert!(cd.bot.is_empty());
        assert!(cd.is_move_down());

        Ok(())
    }

    #[test]
    fn filler_expand_stops_at_expand_size_cap() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let this = LevelHandler::new(1, 0);
        this.init_tables(vec![
            write_sized_table(dir.path(), 1, "a", "b", 10 * KIB)?,
            write_sized_table(dir.path(), 2, "c", "d", 10 * KIB)?,
        ]);

        let next = LevelHandler::new(2, 0);

        let status = CompactStatus::new(3);
        let ctx = FillContext {
            status: &status,
            min_skipped_table_size: 1_024 * 1_024,
            // Only fits a single table
            max_compaction_expand_size: 12 * KIB as u64,
        };

        let mut cd = CompactionDef::new(1, 2);
        assert!(fill_tables(&mut cd, &this, &next, &ctx));

        assert_eq!(1, cd.top.len());

        Ok(())
    }

    #[test]
    fn filler_splits_bot_and_skipped() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // The top set's union spans [a..z] with a hole between c and x.
        // Next-level tables inside the hole overlap the union range but
        // no individual top table.
        let top_left = write_sized_table(dir.path(), 1, "a", "c", 10 * KIB)?;
        let top_right = write_sized_table(dir.path(), 5, "x", "z", 10 * KIB)?;

        let colliding = write_sized_table(dir.path(), 2, "a", "b", 10 * KIB)?;
        let big_hole = write_sized_table(dir.path(), 3, "m", "o", 64 * KIB)?;
        let small_hole = write_sized_table(dir.path(), 4, "q", "s", 10 * KIB)?;

        let mut cd = CompactionDef::new(1, 2);
        cd.top = vec![top_left, top_right];

        fill_bottom_tables(
            &mut cd,
            &[colliding, big_hole, small_hole],
            32 * KIB as u64,
        );

        assert_eq!(ids(&cd.skipped), [3].into_iter().collect());
        assert_eq!(ids(&cd.bot), [2, 4].into_iter().collect());

        Ok(())
    }

    #[test]
    fn filler_bot_all_colliding() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let top = write_sized_table(dir.path(), 1, "a", "f", 10 * KIB)?;
        let x = write_sized_table(dir.path(), 2, "a", "b", 10 * KIB)?;
        let y = write_sized_table(dir.path(), 3, "e", "g", 10 * KIB)?;

        let mut cd = CompactionDef::new(1, 2);
        cd.top = vec![top];

        fill_bottom_tables(&mut cd, &[x, y], 0);

        assert_eq!(2, cd.bot.len());
        assert!(cd.skipped.is_empty());

        Ok(())
    }

    #[test]
    fn filler_l0_takes_whole_level() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let this = LevelHandler::new(0, 0);
        assert!(this.try_add_l0_table(
            write_sized_table(dir.path(), 1, "a", "m", 10 * KIB)?,
            100,
        ));
        assert!(this.try_add_l0_table(
            write_sized_table(dir.path(), 2, "c", "z", 10 * KIB)?,
            100,
        ));

        let next = LevelHandler::new(1, 0);
        next.init_tables(vec![
            write_sized_table(dir.path(), 3, "d", "f", 10 * KIB)?,
            write_sized_table(dir.path(), 4, "x", "y", 10 * KIB)?,
        ]);

        let status = CompactStatus::new(2);

        let mut cd = CompactionDef::new(0, 1);
        assert!(fill_tables_l0(&mut cd, &this, &next, &ctx(&status)));

        assert_eq!(2, cd.top.len());
        assert!(cd.this_range.is_inf());
        assert_eq!(2, cd.bot.len());

        // A second L0 fill must fail on the claimed inf range
        let mut other = CompactionDef::new(0, 1);
        assert!(!fill_tables_l0(&mut other, &this, &next, &ctx(&status)));

        Ok(())
    }

    #[test]
    fn filler_respects_compacting_flags() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let busy = write_sized_table(dir.path(), 1, "a", "b", 10 * KIB)?;
        busy.mark_compacting(true);

        let this = LevelHandler::new(1, 0);
        this.init_tables(vec![busy]);

        let next = LevelHandler::new(2, 0);

        let status = CompactStatus::new(3);

        let mut cd = CompactionDef::new(1, 2);
        assert!(!fill_tables(&mut cd, &this, &next, &ctx(&status)));

        Ok(())
    }
}
