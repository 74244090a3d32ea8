// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{InternalValue, TableId};
use quick_cache::sync::Cache as QuickCache;
use quick_cache::Weighter;
use std::sync::Arc;

/// A decoded data block, shared between readers
pub type CachedBlock = Arc<[InternalValue]>;

// (Table ID, block offset)
type CacheKey = (TableId, u64);

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, CachedBlock> for BlockWeighter {
    fn weight(&self, _: &CacheKey, block: &CachedBlock) -> u64 {
        block
            .iter()
            .map(|item| item.encoded_size() as u64)
            .sum::<u64>()
            .max(1)
    }
}

/// Block cache, shared between all tables of a tree
///
/// Caches decompressed & decoded data blocks, keyed by table ID and
/// block offset, so consecutive queries to nearby data skip the disk.
pub struct BlockCache {
    data: QuickCache<CacheKey, CachedBlock, BlockWeighter, rustc_hash::FxBuildHasher>,

    /// Capacity in bytes
    capacity: u64,
}

impl BlockCache {
    /// Creates a new block cache with roughly `bytes` capacity, assuming
    /// blocks of `block_size` bytes.
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64, block_size: u32) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::cast_possible_truncation)]
        let estimated_items = (bytes / u64::from(block_size.max(1))).max(16) as usize;

        // NOTE: Nothing we can do if it fails
        #[allow(clippy::expect_used)]
        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(estimated_items)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let data = QuickCache::with_options(
            opts,
            BlockWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data,
            capacity: bytes,
        }
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    /// Returns the cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if there are no cached blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[doc(hidden)]
    pub fn insert(&self, key: CacheKey, block: CachedBlock) {
        self.data.insert(key, block);
    }

    #[doc(hidden)]
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CachedBlock> {
        self.data.get(key)
    }
}
