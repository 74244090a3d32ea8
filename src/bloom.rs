// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Two hashes that are mixed to simulate `k` hash functions
pub type CompositeHash = (u64, u64);

/// A standard bloom filter over user keys
///
/// The filter uses double hashing instead of `k` hash functions.
#[derive(Debug, PartialEq)]
pub struct BloomFilter {
    /// Raw bit array
    bytes: crate::Slice,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl BloomFilter {
    /// Returns `true` if the hash may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains_hash(&self, hash: CompositeHash) -> bool {
        let (mut h1, mut h2) = hash;

        for i in 1..=(self.k as u64) {
            let idx = h1 % (self.m as u64);

            #[allow(clippy::cast_possible_truncation)]
            if !self.has_bit(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }

        true
    }

    /// Returns `true` if the key may be contained.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(Self::get_hash(key))
    }

    fn has_bit(&self, idx: usize) -> bool {
        let byte = self.bytes.get(idx / 8).copied().unwrap_or_default();
        (byte & (1 << (idx % 8))) > 0
    }

    /// Gets the composite hash of a key.
    #[must_use]
    pub fn get_hash(key: &[u8]) -> CompositeHash {
        let h0 = xxhash_rust::xxh3::xxh3_128(key);
        #[allow(clippy::cast_possible_truncation)]
        let h1 = (h0 >> 64) as u64;
        #[allow(clippy::cast_possible_truncation)]
        let h2 = h0 as u64;
        (h1, h2)
    }
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.m as u64)?;
        writer.write_u64::<LittleEndian>(self.k as u64)?;
        writer.write_all(&self.bytes)?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let m = reader.read_u64::<LittleEndian>()? as usize;
        #[allow(clippy::cast_possible_truncation)]
        let k = reader.read_u64::<LittleEndian>()? as usize;

        let bytes = crate::Slice::from_reader(reader, m.div_ceil(8))?;

        Ok(Self { bytes, m, k })
    }
}

/// Buffers key hashes until the item count is known, then builds the filter
#[derive(Debug, Default)]
pub struct Builder {
    hashes: Vec<CompositeHash>,
}

impl Builder {
    /// Adds a key hash.
    pub fn add(&mut self, hash: CompositeHash) {
        self.hashes.push(hash);
    }

    /// Number of buffered hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns `true` if no hashes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Builds the filter with the given number of bits per key.
    #[must_use]
    pub fn build(self, bits_per_key: u8) -> BloomFilter {
        // ln(2) * bits per key approximates the optimal hash count
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let k = ((f64::from(bits_per_key) * std::f64::consts::LN_2).ceil() as usize).clamp(1, 30);

        let m = (self.hashes.len().max(1) * usize::from(bits_per_key)).next_multiple_of(8);

        let mut bytes = vec![0; m / 8];

        for hash in &self.hashes {
            let (mut h1, mut h2) = *hash;

            for i in 1..=(k as u64) {
                let idx = (h1 % (m as u64)) as usize;

                if let Some(byte) = bytes.get_mut(idx / 8) {
                    *byte |= 1 << (idx % 8);
                }

                h1 = h1.wrapping_add(h2);
                h2 = h2.wrapping_mul(i);
            }
        }

        BloomFilter {
            bytes: bytes.into(),
            m,
            k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bloom_basic() {
        let mut builder = Builder::default();

        let keys: &[&[u8]] = &[b"item0", b"item1", b"item2", b"item3", b"item4"];
        for key in keys {
            builder.add(BloomFilter::get_hash(key));
        }

        let filter = builder.build(10);

        for key in keys {
            assert!(filter.contains(key));
        }

        assert!(!filter.contains(b"asdasads"));
        assert!(!filter.contains(b"item10"));
    }

    #[test]
    fn bloom_roundtrip() -> crate::Result<()> {
        let mut builder = Builder::default();
        for i in 0..100u32 {
            builder.add(BloomFilter::get_hash(&i.to_be_bytes()));
        }
        let filter = builder.build(10);

        let bytes = filter.encode_into_vec();
        let decoded = BloomFilter::decode_from(&mut &bytes[..])?;
        assert_eq!(filter, decoded);

        for i in 0..100u32 {
            assert!(decoded.contains(&i.to_be_bytes()));
        }

        Ok(())
    }
}
