// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Compression algorithm applied to table data blocks
///
/// Selected per level through `compression_per_level`, so hot upper levels
/// can stay uncompressed while cold deep levels trade CPU for space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// LZ4 compression (speed-optimized)
    #[cfg(feature = "lz4")]
    Lz4,
}

impl From<CompressionType> for u8 {
    fn from(val: CompressionType) -> Self {
        match val {
            CompressionType::None => 0,

            #[cfg(feature = "lz4")]
            CompressionType::Lz4 => 1,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "no compression"),

            #[cfg(feature = "lz4")]
            Self::Lz4 => write!(f, "lz4"),
        }
    }
}

impl CompressionType {
    /// Compresses a chunk of bytes.
    #[must_use]
    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => data.to_vec(),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    /// Decompresses a chunk of bytes.
    pub fn decompress(self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|_| crate::Error::Decompress(self)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CompressionType;
    use test_log::test;

    #[test]
    fn compression_none_roundtrip() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(10);
        let compressed = CompressionType::None.compress(&data);
        assert_eq!(data, &*CompressionType::None.decompress(&compressed)?);
        Ok(())
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn compression_lz4_roundtrip() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(10);
        let compressed = CompressionType::Lz4.compress(&data);
        assert!(compressed.len() < data.len());
        assert_eq!(data, &*CompressionType::Lz4.decompress(&compressed)?);
        Ok(())
    }
}
