// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction filter plug-in
//!
//! A filter gets to see every newest-visible version that compaction is
//! about to carry over and may drop it or turn it into a tombstone.
//! Through [`Guard`]s it can additionally shape the produced table files
//! so that keys sharing a prefix end up in dedicated tables.

use crate::UserKey;

/// Verdict returned by a [`CompactionFilter`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterVerdict {
    /// Keep the item
    Keep,

    /// Drop the item
    Drop,

    /// Drop the item, but write a tombstone in its place if deeper
    /// levels may still hold older versions
    MarkTombstone,
}

/// Trait for compaction filter objects
///
/// The filter only sees the newest visible version of each user key;
/// older versions below the watermark are collapsed before it runs.
pub trait CompactionFilter: Send {
    /// Decides what happens to an item during compaction.
    fn filter(&mut self, user_key: &[u8], value: &[u8], user_meta: &[u8]) -> FilterVerdict;

    /// Returns the guards that shape output file boundaries.
    fn guards(&self) -> Vec<Guard> {
        vec![]
    }
}

/// Creates one [`CompactionFilter`] per compaction
pub trait CompactionFilterFactory: Send + Sync {
    /// Creates a filter for a compaction into `next_level` covering the
    /// given user-key span.
    fn create_filter(
        &self,
        next_level: usize,
        smallest: &[u8],
        biggest: &[u8],
    ) -> Box<dyn CompactionFilter>;
}

/// A key-prefix hint directing compaction to produce tables aligned to
/// that prefix for locality
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Guard {
    /// Keys sharing this prefix are shaped by this guard
    pub prefix: UserKey,

    /// Tables are cut when this many leading bytes change
    pub match_len: usize,

    /// Minimum file size before a `match_len` boundary forces a cut
    pub min_size: u64,
}

/// Finds the applicable guard for a key: the longest prefix match wins.
#[must_use]
pub(crate) fn search_guard<'a>(key: &[u8], guards: &'a [Guard]) -> Option<&'a Guard> {
    guards
        .iter()
        .filter(|g| key.starts_with(&g.prefix))
        .max_by_key(|g| g.prefix.len())
}

/// Decides whether the builder should cut the current output file before
/// appending `key`.
///
/// Only ever called on user-key changes, so all versions of a key always
/// share a file.
#[must_use]
pub(crate) fn should_finish_file(
    key: &[u8],
    last_key: Option<&[u8]>,
    guard: Option<&Guard>,
    current_size: u64,
    max_table_size: u64,
) -> bool {
    let Some(last_key) = last_key else {
        return false;
    };

    let mut effective_max = max_table_size;

    if let Some(guard) = guard {
        // Leaving the guard's prefix region always cuts
        if !key.starts_with(&guard.prefix) {
            return true;
        }

        // Crossing a match_len boundary lowers the cap, preferring a cut
        // once the file carries at least min_size bytes
        let ml = guard.match_len;
        if ml > 0 && last_key.get(..ml) != key.get(..ml) && max_table_size > guard.min_size {
            effective_max = guard.min_size;
        }
    }

    current_size > effective_max
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn guard(prefix: &str, match_len: usize, min_size: u64) -> Guard {
        Guard {
            prefix: prefix.into(),
            match_len,
            min_size,
        }
    }

    #[test]
    fn search_guard_longest_prefix_wins() {
        let guards = [guard("u/", 3, 100), guard("u/a", 4, 100), guard("x/", 3, 100)];

        assert_eq!(guards.get(1), search_guard(b"u/abc", &guards));
        assert_eq!(guards.first(), search_guard(b"u/zzz", &guards));
        assert_eq!(guards.get(2), search_guard(b"x/abc", &guards));
        assert_eq!(None, search_guard(b"zzz", &guards));
    }

    #[test]
    fn finish_file_needs_last_key() {
        assert!(!should_finish_file(b"a", None, None, u64::MAX, 100));
    }

    #[test]
    fn finish_file_on_size_cap() {
        assert!(!should_finish_file(b"b", Some(b"a"), None, 100, 100));
        assert!(should_finish_file(b"b", Some(b"a"), None, 101, 100));
    }

    #[test]
    fn finish_file_on_prefix_exit() {
        let g = guard("u/", 3, 1_024);

        // Key left the guarded region entirely
        assert!(should_finish_file(
            b"v/aa",
            Some(b"u/zz"),
            Some(&g),
            0,
            u64::MAX,
        ));
    }

    #[test]
    fn finish_file_on_match_len_boundary() {
        let g = guard("u/", 3, 1_024);

        // 3-byte prefixes differ ("u/a" vs "u/b"); cap drops to min_size
        assert!(should_finish_file(
            b"u/b1",
            Some(b"u/a9"),
            Some(&g),
            2_000,
            1_024 * 1_024 * 1_024,
        ));

        // Same boundary crossing, but the file is still small
        assert!(!should_finish_file(
            b"u/b1",
            Some(b"u/a9"),
            Some(&g),
            500,
            1_024 * 1_024 * 1_024,
        ));

        // No boundary crossing
        assert!(!should_finish_file(
            b"u/a9",
            Some(b"u/a1"),
            Some(&g),
            2_000,
            1_024 * 1_024 * 1_024,
        ));
    }
}
