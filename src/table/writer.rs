// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Table writing

use super::{BLOCK_CHECKSUM_SIZE, TRAILER_SIZE};
use crate::{
    bloom::{self, BloomFilter},
    coding::Encode,
    file::MAGIC_BYTES,
    key::InternalKey,
    CompressionType, InternalValue, RateLimiter, TableId,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use varint_rs::VarintWriter;

/// Options for [`TableWriter`]
#[derive(Clone)]
pub struct WriterOptions {
    /// Uncompressed target size of data blocks
    pub block_size: u32,

    /// Bloom filter density
    pub bloom_bits_per_key: u8,

    /// Data block compression
    pub compression: CompressionType,

    /// Compaction I/O rate limiter
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: /* 4 KiB */ 4_096,
            bloom_bits_per_key: 10,
            compression: CompressionType::None,
            rate_limiter: None,
        }
    }
}

/// Streaming writer producing one table file
///
/// Items must be added in ascending internal-key order. An empty writer
/// removes its file again on [`TableWriter::finish`].
pub struct TableWriter {
    id: TableId,
    path: PathBuf,
    file: BufWriter<File>,
    opts: WriterOptions,

    block_buf: Vec<u8>,
    block_end_key: Option<InternalKey>,

    index: Vec<(InternalKey, u64, u32)>,
    bloom: bloom::Builder,

    offset: u64,
    item_count: u64,

    smallest: Option<InternalKey>,
    last_key: Option<InternalKey>,

    last_hashed_key: Option<crate::UserKey>,
}

impl TableWriter {
    /// Creates a new table writer at the given path.
    pub fn new(path: &Path, id: TableId, opts: WriterOptions) -> crate::Result<Self> {
        let file = BufWriter::new(File::create(path)?);

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            opts,
            block_buf: vec![],
            block_end_key: None,
            index: vec![],
            bloom: bloom::Builder::default(),
            offset: 0,
            item_count: 0,
            smallest: None,
            last_key: None,
            last_hashed_key: None,
        })
    }

    /// ID of the table being written.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Path of the table file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if nothing was added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    /// Number of items added so far.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Estimated on-disk size of the file so far.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block_buf.len() as u64
    }

    /// Appends an item.
    pub fn add(&mut self, item: InternalValue) -> crate::Result<()> {
        debug_assert!(
            self.last_key.as_ref().is_none_or(|last| *last < item.key),
            "items must be added in ascending key order",
        );

        if self.smallest.is_none() {
            self.smallest = Some(item.key.clone());
        }

        // Only hash each user key once, no matter how many versions it has
        let rehash = self
            .last_hashed_key
            .as_ref()
            .is_none_or(|key| *key != item.key.user_key);

        if rehash {
            self.bloom.add(BloomFilter::get_hash(&item.key.user_key));
            self.last_hashed_key = Some(item.key.user_key.clone());
        }

        item.encode_into(&mut self.block_buf)?;

        self.item_count += 1;
        self.block_end_key = Some(item.key.clone());
        self.last_key = Some(item.key);

        if self.block_buf.len() >= self.opts.block_size as usize {
            self.flush_block()?;
        }

        Ok(())
    }

    fn flush_block(&mut self) -> crate::Result<()> {
        let Some(end_key) = self.block_end_key.take() else {
            return Ok(());
        };

        let payload = self.opts.compression.compress(&self.block_buf);
        self.block_buf.clear();

        let len = self.write_checked_block(&payload)?;
        self.index.push((end_key, self.offset, len));
        self.offset += u64::from(len);

        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_checked_block(&mut self, payload: &[u8]) -> crate::Result<u32> {
        let len = payload.len() as u64 + BLOCK_CHECKSUM_SIZE;

        if let Some(limiter) = &self.opts.rate_limiter {
            limiter.take(len);
        }

        self.file.write_all(payload)?;
        self.file
            .write_u64::<LittleEndian>(xxhash_rust::xxh3::xxh3_64(payload))?;

        Ok(len as u32)
    }

    /// Finalizes the file, fsyncing it.
    ///
    /// Returns `false` if nothing was written; the (empty) file is
    /// removed in that case.
    #[allow(clippy::expect_used)]
    pub fn finish(mut self) -> crate::Result<bool> {
        if self.is_empty() {
            drop(self.file);
            std::fs::remove_file(&self.path)?;
            return Ok(false);
        }

        self.flush_block()?;

        // Index
        let index_offset = self.offset;
        let index_len = {
            let mut payload = vec![];

            #[allow(clippy::cast_possible_truncation)]
            payload.write_u32_varint(self.index.len() as u32)?;

            for (end_key, offset, len) in std::mem::take(&mut self.index) {
                end_key.encode_into(&mut payload)?;
                payload.write_u64_varint(offset)?;
                payload.write_u32_varint(len)?;
            }

            self.write_checked_block(&payload)?
        };
        self.offset += u64::from(index_len);

        // Filter
        let filter_offset = self.offset;
        let filter_len = {
            let filter = std::mem::take(&mut self.bloom).build(self.opts.bloom_bits_per_key);
            let payload = filter.encode_into_vec();
            self.write_checked_block(&payload)?
        };
        self.offset += u64::from(filter_len);

        // Meta
        let meta_offset = self.offset;
        let meta_len = {
            let mut payload = vec![];
            payload.write_u64_varint(self.item_count)?;

            self.smallest
                .as_ref()
                .expect("writer is not empty")
                .encode_into(&mut payload)?;
            self.last_key
                .as_ref()
                .expect("writer is not empty")
                .encode_into(&mut payload)?;

            self.write_checked_block(&payload)?
        };
        self.offset += u64::from(meta_len);

        // Trailer
        {
            let mut trailer = Vec::with_capacity(TRAILER_SIZE as usize);
            trailer.write_u64::<LittleEndian>(index_offset)?;
            trailer.write_u32::<LittleEndian>(index_len)?;
            trailer.write_u64::<LittleEndian>(filter_offset)?;
            trailer.write_u32::<LittleEndian>(filter_len)?;
            trailer.write_u64::<LittleEndian>(meta_offset)?;
            trailer.write_u32::<LittleEndian>(meta_len)?;
            trailer.write_u8(u8::from(self.opts.compression))?;
            trailer.write_all(&MAGIC_BYTES)?;

            debug_assert_eq!(TRAILER_SIZE as usize, trailer.len());

            self.file.write_all(&trailer)?;
        }

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        log::trace!(
            "Finished table {:06} with {} items, ~{} bytes",
            self.id,
            self.item_count,
            self.offset + TRAILER_SIZE,
        );

        Ok(true)
    }
}
