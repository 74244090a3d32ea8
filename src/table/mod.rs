// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Immutable sorted table (SST) reading and writing
//!
//! A table file consists of a sequence of data blocks, followed by a
//! sparse index block (one entry per data block), a bloom filter block,
//! a meta block and a fixed-size trailer:
//!
//! ```text
//! [data block]* [index] [filter] [meta] [trailer]
//! ```
//!
//! Every block is stored as `payload ++ xxh3(payload)`; data block
//! payloads may additionally be compressed.

pub mod iter;
pub mod writer;

use crate::{
    binary_search::partition_point,
    bloom::BloomFilter,
    cache::CachedBlock,
    coding::{Decode, DecodeError},
    file::read_exact_at,
    key::InternalKey,
    BlockCache, CompressionType, InternalValue, KeyRange, SeqNo, TableId, ValueType,
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use varint_rs::VarintReader;

/// Size of the fixed trailer at the end of every table file
pub(crate) const TRAILER_SIZE: u64 = 8 + 4 + 8 + 4 + 8 + 4 + 1 + crate::file::MAGIC_BYTES.len() as u64;

/// Extra bytes appended to each stored block
pub(crate) const BLOCK_CHECKSUM_SIZE: u64 = 8;

#[derive(Debug)]
pub(crate) struct IndexEntry {
    /// Last key of the block
    pub end_key: InternalKey,

    pub offset: u64,
    pub len: u32,
}

pub(crate) struct TableInner {
    id: TableId,
    path: PathBuf,
    file: File,
    file_size: u64,
    compression: CompressionType,

    index: Vec<IndexEntry>,
    filter: BloomFilter,

    item_count: u64,
    smallest: InternalKey,
    biggest: InternalKey,
    key_range: KeyRange,

    cache: Arc<BlockCache>,

    /// Set while the table participates in an in-flight compaction
    is_compacting: AtomicBool,

    /// Set once the table was dropped from the manifest; the file is
    /// unlinked when the last reference goes away
    is_deleted: AtomicBool,
}

impl Drop for TableInner {
    fn drop(&mut self) {
        if self.is_deleted.load(Ordering::Acquire) {
            log::trace!("Unlinking dropped table file {:?}", self.path);

            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to unlink table file {:?}: {e}", self.path);
            }
        }
    }
}

/// An immutable sorted table
///
/// Cheap to clone; the underlying file handle, index and filter are
/// shared between clones.
#[derive(Clone)]
pub struct Table(Arc<TableInner>);

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Table:{}({})", self.id(), self.key_range())
    }
}

impl Table {
    /// Opens a table file.
    pub fn open(
        path: &Path,
        id: TableId,
        expected_compression: CompressionType,
        cache: Arc<BlockCache>,
    ) -> crate::Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < TRAILER_SIZE {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                "table file is too short",
            )));
        }

        let mut trailer = vec![0; TRAILER_SIZE as usize];
        read_exact_at(&file, &mut trailer, file_size - TRAILER_SIZE)?;

        let mut reader = &trailer[..];
        let index_offset = reader.read_u64::<LittleEndian>()?;
        let index_len = reader.read_u32::<LittleEndian>()?;
        let filter_offset = reader.read_u64::<LittleEndian>()?;
        let filter_len = reader.read_u32::<LittleEndian>()?;
        let meta_offset = reader.read_u64::<LittleEndian>()?;
        let meta_len = reader.read_u32::<LittleEndian>()?;
        let compression = reader.read_u8()?;

        let mut magic = [0u8; crate::file::MAGIC_BYTES.len()];
        std::io::Read::read_exact(&mut reader, &mut magic)?;

        if magic != crate::file::MAGIC_BYTES {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                "table magic mismatch",
            )));
        }

        let compression: CompressionType = compression
            .try_into()
            .map_err(|()| crate::Error::Decode(DecodeError::InvalidHeader("unknown compression")))?;

        if compression != expected_compression {
            log::warn!(
                "Table {id} compression {compression} does not match manifest ({expected_compression})",
            );
        }

        // Index
        let index_payload = read_verified_block(&file, index_offset, index_len)?;
        let mut reader = &index_payload[..];
        let block_count = reader.read_u32_varint()?;

        let mut index = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            let end_key = InternalKey::decode_from(&mut reader).map_err(crate::Error::Decode)?;
            let offset = reader.read_u64_varint()?;
            let len = reader.read_u32_varint()?;
            index.push(IndexEntry {
                end_key,
                offset,
                len,
            });
        }

        // Filter
        let filter_payload = read_verified_block(&file, filter_offset, filter_len)?;
        let filter =
            BloomFilter::decode_from(&mut &filter_payload[..]).map_err(crate::Error::Decode)?;

        // Meta
        let meta_payload = read_verified_block(&file, meta_offset, meta_len)?;
        let mut reader = &meta_payload[..];
        let item_count = reader.read_u64_varint()?;
        let smallest = InternalKey::decode_from(&mut reader).map_err(crate::Error::Decode)?;
        let biggest = InternalKey::decode_from(&mut reader).map_err(crate::Error::Decode)?;

        let key_range = KeyRange::new((smallest.user_key.clone(), biggest.user_key.clone()));

        Ok(Self(Arc::new(TableInner {
            id,
            path: path.to_path_buf(),
            file,
            file_size,
            compression,
            index,
            filter,
            item_count,
            smallest,
            biggest,
            key_range,
            cache,
            is_compacting: AtomicBool::new(false),
            is_deleted: AtomicBool::new(false),
        })))
    }

    /// Table ID.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.0.id
    }

    /// Path of the table file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Size of the table file in bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.0.file_size
    }

    /// Compression of the data blocks.
    #[must_use]
    pub fn compression(&self) -> CompressionType {
        self.0.compression
    }

    /// Number of items in the table.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.0.item_count
    }

    /// First (smallest) key of the table.
    #[must_use]
    pub fn smallest(&self) -> &InternalKey {
        &self.0.smallest
    }

    /// Last (biggest) key of the table.
    #[must_use]
    pub fn biggest(&self) -> &InternalKey {
        &self.0.biggest
    }

    /// The user-key range spanned by the table.
    #[must_use]
    pub fn key_range(&self) -> &KeyRange {
        &self.0.key_range
    }

    /// Returns `true` if the table's range overlaps the given range.
    #[must_use]
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        self.0.key_range.overlaps_with(range)
    }

    /// Flags the table as participating in a compaction.
    pub fn mark_compacting(&self, compacting: bool) {
        self.0.is_compacting.store(compacting, Ordering::Release);
    }

    /// Returns `true` while the table participates in a compaction.
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.0.is_compacting.load(Ordering::Acquire)
    }

    /// Flags the table file for deletion once the last reference is gone.
    pub fn mark_deleted(&self) {
        self.0.is_deleted.store(true, Ordering::Release);
    }

    /// Returns `true` if the key may be contained, consulting the bloom filter.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.0.filter.contains_hash(BloomFilter::get_hash(key))
    }

    /// Point lookup: returns the newest version of `key` with a
    /// sequence number at or below `seqno`.
    pub fn get(&self, key: &[u8], seqno: SeqNo) -> crate::Result<Option<InternalValue>> {
        if !self.key_range().contains_key(key) {
            return Ok(None);
        }

        if !self.may_contain(key) {
            return Ok(None);
        }

        let search_key = InternalKey::new(key, seqno, ValueType::Value);

        let block_idx = partition_point(&self.0.index, |e| e.end_key < search_key);
        let Some(_) = self.0.index.get(block_idx) else {
            return Ok(None);
        };

        let block = self.load_block(block_idx)?;
        let pos = partition_point(&block, |item| item.key < search_key);

        Ok(block
            .get(pos)
            .filter(|item| item.key.user_key == key)
            .cloned())
    }

    /// Loads (and caches) the data block at the given index position.
    pub(crate) fn load_block(&self, block_idx: usize) -> crate::Result<CachedBlock> {
        let Some(entry) = self.0.index.get(block_idx) else {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                "block index out of range",
            )));
        };

        if let Some(block) = self.0.cache.get(&(self.0.id, entry.offset)) {
            return Ok(block);
        }

        let payload = read_verified_block(&self.0.file, entry.offset, entry.len)?;
        let payload = self.0.compression.decompress(&payload)?;

        let mut reader = &payload[..];
        let mut items = vec![];

        while !reader.is_empty() {
            items.push(InternalValue::decode_from(&mut reader).map_err(crate::Error::Decode)?);
        }

        let block: CachedBlock = Arc::from(items);
        self.0.cache.insert((self.0.id, entry.offset), block.clone());

        Ok(block)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.0.index.len()
    }

    /// Creates an iterator over the whole table.
    #[must_use]
    pub fn iter(&self) -> iter::TableIter {
        iter::TableIter::new(self.clone())
    }
}

/// Reads a length-delimited block and verifies its trailing checksum.
fn read_verified_block(file: &File, offset: u64, len: u32) -> crate::Result<Vec<u8>> {
    if u64::from(len) < BLOCK_CHECKSUM_SIZE {
        return Err(crate::Error::Decode(DecodeError::InvalidHeader(
            "block is too short",
        )));
    }

    let mut buf = vec![0; len as usize];
    read_exact_at(file, &mut buf, offset)?;

    let payload_len = buf.len() - BLOCK_CHECKSUM_SIZE as usize;
    let checksum_bytes = buf.split_off(payload_len);

    let expected = (&checksum_bytes[..]).read_u64::<LittleEndian>()?;
    let got = xxhash_rust::xxh3::xxh3_64(&buf);

    if got != expected {
        return Err(crate::Error::InvalidChecksum((got, expected)));
    }

    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::writer::{TableWriter, WriterOptions};
    use super::*;
    use crate::{InternalValue, SeqNo, ValueType};
    use test_log::test;

    pub(crate) fn test_cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::with_capacity_bytes(1_024 * 1_024, 4_096))
    }

    /// Builds a table where each `(key, seqno)` maps to the key itself as value.
    pub(crate) fn write_test_table(
        dir: &Path,
        id: TableId,
        items: &[(&[u8], SeqNo)],
    ) -> crate::Result<Table> {
        let mut items = items
            .iter()
            .map(|(key, seqno)| {
                InternalValue::from_components(*key, *key, *seqno, ValueType::Value)
            })
            .collect::<Vec<_>>();
        items.sort();

        let path = crate::file::table_file_path(dir, id);
        let mut writer = TableWriter::new(&path, id, WriterOptions::default())?;

        for item in items {
            writer.add(item)?;
        }
        writer.finish()?;

        Table::open(&path, id, CompressionType::None, test_cache())
    }

    /// Builds a table spanning `[first, last]` with roughly `approx_size` bytes.
    pub(crate) fn write_sized_table(
        dir: &Path,
        id: TableId,
        first: &str,
        last: &str,
        approx_size: usize,
    ) -> crate::Result<Table> {
        assert!(first < last);

        let path = crate::file::table_file_path(dir, id);
        let mut writer = TableWriter::new(&path, id, WriterOptions::default())?;

        let padding = vec![0u8; approx_size / 2];
        for key in [first, last] {
            writer.add(InternalValue::from_components(
                key.as_bytes(),
                padding.clone(),
                0,
                ValueType::Value,
            ))?;
        }
        writer.finish()?;

        Table::open(&path, id, CompressionType::None, test_cache())
    }

    #[test]
    fn table_write_open_get() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let table = write_test_table(dir.path(), 1, &[(b"a", 5), (b"b", 3), (b"c", 9)])?;

        assert_eq!(3, table.item_count());
        assert_eq!(b"a", &*table.smallest().user_key);
        assert_eq!(b"c", &*table.biggest().user_key);

        let hit = table.get(b"b", SeqNo::MAX)?.expect("should exist");
        assert_eq!(hit.value, b"b" as &[u8]);
        assert_eq!(3, hit.key.seqno);

        assert!(table.get(b"d", SeqNo::MAX)?.is_none());

        Ok(())
    }

    #[test]
    fn table_get_respects_snapshot_seqno() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = crate::file::table_file_path(dir.path(), 1);
        let mut writer = TableWriter::new(&path, 1, WriterOptions::default())?;

        writer.add(InternalValue::from_components(
            *b"a",
            *b"new",
            10,
            ValueType::Value,
        ))?;
        writer.add(InternalValue::from_components(
            *b"a",
            *b"old",
            5,
            ValueType::Value,
        ))?;
        writer.finish()?;

        let table = Table::open(&path, 1, CompressionType::None, test_cache())?;

        assert_eq!(
            b"new" as &[u8],
            &*table.get(b"a", SeqNo::MAX)?.expect("should exist").value,
        );
        assert_eq!(
            b"old" as &[u8],
            &*table.get(b"a", 7)?.expect("should exist").value,
        );
        assert!(table.get(b"a", 3)?.is_none());

        Ok(())
    }

    #[test]
    fn table_iter_yields_sorted_items() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = crate::file::table_file_path(dir.path(), 1);

        let mut writer = TableWriter::new(
            &path,
            1,
            WriterOptions {
                // Tiny blocks, so the iterator crosses block boundaries
                block_size: 32,
                ..Default::default()
            },
        )?;

        let mut expected = vec![];
        for i in 0..100u32 {
            let key = format!("key{i:03}");
            let item = InternalValue::from_components(
                key.as_bytes(),
                key.as_bytes(),
                u64::from(i),
                ValueType::Value,
            );
            expected.push(item.clone());
            writer.add(item)?;
        }
        writer.finish()?;

        let table = Table::open(&path, 1, CompressionType::None, test_cache())?;
        assert!(table.block_count() > 1);

        let got = table.iter().collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(expected, got);

        Ok(())
    }

    #[test]
    fn table_empty_writer_removes_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = crate::file::table_file_path(dir.path(), 1);
        let writer = TableWriter::new(&path, 1, WriterOptions::default())?;

        assert!(writer.is_empty());
        assert!(!writer.finish()?);
        assert!(!path.exists());

        Ok(())
    }

    #[test]
    fn table_corruption_is_detected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let table = write_test_table(dir.path(), 1, &[(b"a", 0), (b"b", 0)])?;
        let path = table.path().to_path_buf();
        drop(table);

        // Flip a byte in the first data block
        let mut bytes = std::fs::read(&path)?;
        if let Some(byte) = bytes.get_mut(3) {
            *byte ^= 0xFF;
        }
        std::fs::write(&path, bytes)?;

        let table = Table::open(&path, 1, CompressionType::None, test_cache())?;
        assert!(matches!(
            table.get(b"a", SeqNo::MAX),
            Err(crate::Error::InvalidChecksum(_))
        ));

        Ok(())
    }
}
