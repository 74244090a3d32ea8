// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Leveled-compaction core for log-structured merge-trees.
//!
//! ##### NOTE
//!
//! > This crate only provides the multi-level structure and compaction
//! > machinery of an LSM-based storage engine, not a full engine.
//! > It does not ship with a write-ahead log or memtable; new L0 tables
//! > are built by the caller (typically from a flushed write buffer) and
//! > handed to [`LevelController::add_l0_table`].
//!
//! ##### About
//!
//! Immutable sorted tables (SSTs) are organized into levels `L0..Lmax-1`.
//! `L0` is the sink for flushed write buffers and may contain tables with
//! overlapping key ranges; every deeper level is a sorted run of tables
//! with pairwise-disjoint ranges.
//!
//! Background workers continuously score levels, select a set of tables at
//! level `i` ("top") plus the overlapping tables at level `i + 1` ("bot"),
//! and merge them into new tables at `i + 1`. Old versions of a key are
//! collapsed once they fall below the MVCC watermark, tombstones are
//! elided when nothing below could resurrect older data, and a durable
//! manifest records every table creation, deletion and move so that a
//! crash at any point recovers to a consistent tree.
//!
//! # Example usage
//!
//! ```
//! use strata::{Config, SequenceNumberCounter, ValueType};
//! # use std::sync::Arc;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! // The watermark below which old key versions may be collapsed,
//! // typically fed by the transaction oracle
//! let safe_ts = SequenceNumberCounter::default();
//!
//! let controller = Arc::new(Config::new(&folder).open(safe_ts.clone())?);
//!
//! // Install a flushed table into L0
//! let mut writer = controller.new_l0_writer()?;
//! writer.add(strata::InternalValue::from_components(
//!     "my_key", "my_value", 0, ValueType::Value,
//! ))?;
//! let id = writer.id();
//! writer.finish()?;
//! controller.add_l0_table(controller.open_table(id)?)?;
//!
//! let item = controller.get(b"my_key", u64::MAX)?;
//! assert!(item.is_some());
//!
//! // Start background compaction workers
//! let workers = strata::LevelController::spawn_compactors(&controller);
//!
//! controller.stop_signal().send();
//! for worker in workers {
//!     worker.join().expect("worker should not panic");
//! }
//! #
//! # Ok::<(), strata::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod binary_search;
mod bloom;
mod cache;
mod coding;

pub mod compaction;

mod compression;
mod config;
mod epoch;
mod error;
mod file;
mod key;
mod key_range;

#[doc(hidden)]
pub mod level;

mod manifest;

#[doc(hidden)]
pub mod merge;

mod rate_limiter;
mod seqno;
mod slice;

#[doc(hidden)]
pub mod stop_signal;

pub mod table;

mod value;

/// [`FxHashMap`](rustc_hash::FxHashMap) with a faster hash function
pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// [`FxHashSet`](rustc_hash::FxHashSet) with a faster hash function
pub type HashSet<K> = rustc_hash::FxHashSet<K>;

/// Monotonically increasing table identifier
pub type TableId = u64;

#[doc(hidden)]
pub use {key::InternalKey, merge::BoxedIterator};

pub use {
    cache::BlockCache,
    compaction::filter::{CompactionFilter, CompactionFilterFactory, FilterVerdict, Guard},
    compaction::DiscardStats,
    compression::CompressionType,
    config::Config,
    epoch::{EpochGuard, ResourceManager},
    error::{Error, Result},
    key_range::KeyRange,
    level::LevelController,
    manifest::ManifestChange,
    rate_limiter::RateLimiter,
    seqno::SequenceNumberCounter,
    slice::Slice,
    table::{writer::TableWriter, Table},
    value::{InternalValue, SeqNo, UserKey, UserValue, ValuePointer, ValueType},
};
