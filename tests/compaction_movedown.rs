mod common;

use common::flush_l0;
use strata::{Config, SequenceNumberCounter};
use test_log::test;

/// A table compacted into an empty level is promoted without a rewrite:
/// same file id, same size, just a deeper level.
#[test]
fn compaction_move_down_keeps_file() -> strata::Result<()> {
    let folder = tempfile::tempdir()?;

    let controller = Config::new(&folder).open(SequenceNumberCounter::default())?;

    flush_l0(&controller, &[("a", "1", 1), ("b", "2", 1)])?;

    // L0 -> L1 rewrites (L0 is never moved), everything after is a move
    assert!(controller.compact_once(0)?);

    let info = controller.get_table_info();
    assert_eq!(1, info.len());

    let l1_table = info.first().cloned().expect("should exist");
    assert_eq!(1, l1_table.level);

    for next in 2..=4 {
        assert!(controller.compact_once(next - 1)?);

        let info = controller.get_table_info();
        assert_eq!(1, info.len());

        let moved = info.first().cloned().expect("should exist");
        assert_eq!(next, moved.level);

        // Same file, no rewrite
        assert_eq!(l1_table.id, moved.id);
        assert_eq!(l1_table.file_size, moved.file_size);
    }

    // Data stays readable throughout
    let item = controller.get(b"a", u64::MAX)?.expect("should exist");
    assert_eq!(b"1" as &[u8], &*item.value);

    controller.validate()?;

    Ok(())
}

/// The moved table file must still exist on disk under its old id.
#[test]
fn compaction_move_down_survives_reopen() -> strata::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let controller = Config::new(&folder).open(SequenceNumberCounter::default())?;

        flush_l0(&controller, &[("a", "1", 1), ("b", "2", 1)])?;
        assert!(controller.compact_once(0)?);
        assert!(controller.compact_once(1)?);
    }

    let controller = Config::new(&folder).open(SequenceNumberCounter::default())?;

    let info = controller.get_table_info();
    assert_eq!(1, info.len());
    assert_eq!(2, info.first().expect("should exist").level);

    let item = controller.get(b"b", u64::MAX)?.expect("should exist");
    assert_eq!(b"2" as &[u8], &*item.value);

    Ok(())
}
