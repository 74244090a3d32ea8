mod common;

use common::flush_l0;
use strata::{
    CompactionFilter, CompactionFilterFactory, Config, FilterVerdict, SequenceNumberCounter,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use test_log::test;

/// Drops every value tagged with the `tmp/` key prefix.
struct DropTemp {
    seen: Arc<AtomicUsize>,
}

impl CompactionFilter for DropTemp {
    fn filter(&mut self, user_key: &[u8], _: &[u8], _: &[u8]) -> FilterVerdict {
        self.seen.fetch_add(1, Ordering::AcqRel);

        if user_key.starts_with(b"tmp/") {
            FilterVerdict::Drop
        } else {
            FilterVerdict::Keep
        }
    }
}

struct DropTempFactory {
    seen: Arc<AtomicUsize>,
}

impl CompactionFilterFactory for DropTempFactory {
    fn create_filter(&self, _: usize, _: &[u8], _: &[u8]) -> Box<dyn CompactionFilter> {
        Box::new(DropTemp {
            seen: self.seen.clone(),
        })
    }
}

#[test]
fn filter_drops_matching_keys_during_compaction() -> strata::Result<()> {
    let folder = tempfile::tempdir()?;

    let seen = Arc::new(AtomicUsize::new(0));

    let safe_ts = SequenceNumberCounter::default();
    let controller = Config::new(&folder)
        .compaction_filter_factory(Arc::new(DropTempFactory { seen: seen.clone() }))
        .open(safe_ts.clone())?;

    flush_l0(
        &controller,
        &[("keep/a", "v", 1), ("tmp/a", "v", 2), ("tmp/b", "v", 3)],
    )?;

    safe_ts.set(10);
    assert!(controller.compact_once(0)?);

    // The filter saw every newest-visible version
    assert_eq!(3, seen.load(Ordering::Acquire));

    assert!(controller.get(b"keep/a", u64::MAX)?.is_some());
    assert!(controller.get(b"tmp/a", u64::MAX)?.is_none());
    assert!(controller.get(b"tmp/b", u64::MAX)?.is_none());

    Ok(())
}

/// Items above the watermark are not offered to the filter, so snapshot
/// readers never lose data they can still see.
#[test]
fn filter_does_not_see_unstable_versions() -> strata::Result<()> {
    let folder = tempfile::tempdir()?;

    let seen = Arc::new(AtomicUsize::new(0));

    let safe_ts = SequenceNumberCounter::default();
    let controller = Config::new(&folder)
        .compaction_filter_factory(Arc::new(DropTempFactory { seen: seen.clone() }))
        .open(safe_ts)?;

    flush_l0(&controller, &[("tmp/a", "v", 5)])?;

    // Watermark stays at 0: nothing is visible-stable yet
    assert!(controller.compact_once(0)?);

    assert_eq!(0, seen.load(Ordering::Acquire));
    assert!(controller.get(b"tmp/a", u64::MAX)?.is_some());

    Ok(())
}
