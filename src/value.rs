// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    key::InternalKey,
    Slice,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Sequence number - a monotonically increasing counter
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. This enables MVCC.
///
/// Stale versions are lazily garbage-collected during compaction once
/// they fall below the compaction watermark.
pub type SeqNo = u64;

/// Value type (regular value, tombstone or blob pointer)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,

    /// The value is a pointer into an external blob file
    ValuePointer,
}

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            2 => Ok(Self::ValuePointer),
            _ => Err(()),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
            ValueType::ValuePointer => 2,
        }
    }
}

/// Points into a blob file, for values that are stored out of line
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValuePointer {
    /// ID of the blob file
    pub blob_file_id: u64,

    /// Byte offset inside the blob file
    pub offset: u64,

    /// Length of the blob
    pub len: u32,
}

impl Encode for ValuePointer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.blob_file_id)?;
        writer.write_u64_varint(self.offset)?;
        writer.write_u32_varint(self.len)?;
        Ok(())
    }
}

impl Decode for ValuePointer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let blob_file_id = reader.read_u64_varint()?;
        let offset = reader.read_u64_varint()?;
        let len = reader.read_u32_varint()?;

        Ok(Self {
            blob_file_id,
            offset,
            len,
        })
    }
}

/// Internal representation of KV pairs
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Eq)]
pub struct InternalValue {
    /// Internal key
    pub key: InternalKey,

    /// User-defined value - an arbitrary byte array
    ///
    /// Supports up to 2^32 bytes
    pub value: UserValue,

    /// Opaque per-item metadata handed back to compaction filters
    pub user_meta: UserValue,

    /// Unix timestamp in seconds after which the caller considers the
    /// item dead, 0 means no expiration
    ///
    /// Carried through storage and compaction untouched; interpreting it
    /// (e.g. through a compaction filter) is up to the embedding engine.
    pub expires_at: u64,
}

impl InternalValue {
    /// Creates a new [`InternalValue`].
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value length is greater than 2^32.
    pub fn new<V: Into<UserValue>>(key: InternalKey, value: V) -> Self {
        let value = value.into();

        assert!(!key.user_key.is_empty(), "key may not be empty");
        assert!(
            u32::try_from(value.len()).is_ok(),
            "values can be 2^32 bytes in length"
        );

        Self {
            key,
            value,
            user_meta: UserValue::empty(),
            expires_at: 0,
        }
    }

    /// Creates a new [`InternalValue`] from its components.
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value length is greater than 2^32.
    pub fn from_components<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        seqno: SeqNo,
        value_type: ValueType,
    ) -> Self {
        let key = InternalKey::new(user_key, seqno, value_type);
        Self::new(key, value)
    }

    /// Creates a new tombstone.
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16.
    pub fn new_tombstone<K: Into<UserKey>>(key: K, seqno: u64) -> Self {
        let key = InternalKey::new(key, seqno, ValueType::Tombstone);
        Self::new(key, vec![])
    }

    /// Attaches user metadata.
    #[must_use]
    pub fn with_user_meta<V: Into<UserValue>>(mut self, user_meta: V) -> Self {
        self.user_meta = user_meta.into();
        self
    }

    /// Attaches an expiration timestamp (Unix seconds).
    #[must_use]
    pub fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    #[doc(hidden)]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.key.is_tombstone()
    }

    /// On-disk size of the encoded entry, used for size accounting.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        std::mem::size_of::<SeqNo>()
            + std::mem::size_of::<ValueType>()
            + self.key.user_key.len()
            + self.value.len()
            + self.user_meta.len()
    }
}

impl PartialEq for InternalValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for InternalValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.key.cmp(&other.key))
    }
}

// Order by user key, THEN by sequence number descending
impl Ord for InternalValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Debug for InternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} => {:?}",
            self.key,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

impl Encode for InternalValue {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.key.encode_into(writer)?;

        // NOTE: We know user meta and values are limited to 32-bit length
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.user_meta.len() as u32)?;
        writer.write_all(&self.user_meta)?;

        writer.write_u64_varint(self.expires_at)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.value.len() as u32)?;
        writer.write_all(&self.value)?;

        Ok(())
    }
}

impl Decode for InternalValue {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key = InternalKey::decode_from(reader)?;

        let user_meta_len = reader.read_u32_varint()?;
        let user_meta = UserValue::from_reader(reader, user_meta_len as usize)?;

        let expires_at = reader.read_u64_varint()?;

        let value_len = reader.read_u32_varint()?;
        let value = UserValue::from_reader(reader, value_len as usize)?;

        Ok(Self {
            key,
            value,
            user_meta,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn value_roundtrip() -> Result<(), DecodeError> {
        let value = InternalValue::from_components(vec![1, 2, 3], vec![3, 2, 1], 1, ValueType::Value)
            .with_user_meta(vec![9])
            .with_expiry(42);

        let bytes = value.encode_into_vec();
        let decoded = InternalValue::decode_from(&mut &bytes[..])?;

        assert_eq!(value, decoded);
        assert_eq!(decoded.user_meta, [9]);
        assert_eq!(42, decoded.expires_at);

        Ok(())
    }

    #[test]
    fn value_tombstone_roundtrip() -> Result<(), DecodeError> {
        let value = InternalValue::new_tombstone(vec![1, 2, 3], 42);

        let bytes = value.encode_into_vec();
        let decoded = InternalValue::decode_from(&mut &bytes[..])?;

        assert_eq!(value, decoded);
        assert!(decoded.is_tombstone());
        assert!(decoded.value.is_empty());

        Ok(())
    }

    #[test]
    fn value_pointer_roundtrip() -> Result<(), DecodeError> {
        let vptr = ValuePointer {
            blob_file_id: 3,
            offset: 1_024,
            len: 512,
        };

        let bytes = vptr.encode_into_vec();
        let decoded = ValuePointer::decode_from(&mut &bytes[..])?;

        assert_eq!(vptr, decoded);
        Ok(())
    }
}
