mod common;

use common::flush_l0;
use strata::{Config, Error, LevelController, SequenceNumberCounter};
use std::sync::Arc;
use test_log::test;

#[test]
fn read_only_serves_reads_but_rejects_writes() -> strata::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let controller = Config::new(&folder).open(SequenceNumberCounter::default())?;
        flush_l0(&controller, &[("a", "v", 1), ("b", "w", 2)])?;
    }

    let controller = Arc::new(
        Config::new(&folder)
            .read_only(true)
            .open(SequenceNumberCounter::default())?,
    );

    assert!(controller.get(b"a", u64::MAX)?.is_some());
    assert_eq!(1, controller.get_table_info().len());

    assert!(matches!(
        controller.new_l0_writer(),
        Err(Error::ReadOnly)
    ));

    assert!(LevelController::spawn_compactors(&controller).is_empty());

    Ok(())
}

#[test]
fn read_only_requires_existing_manifest() {
    let folder = tempfile::tempdir().expect("should create tempdir");

    assert!(matches!(
        Config::new(&folder)
            .read_only(true)
            .open(SequenceNumberCounter::default()),
        Err(Error::ReadOnly)
    ));
}
