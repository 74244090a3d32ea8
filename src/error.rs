// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    TableId,
};

/// Represents errors that can occur in the compaction core
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(crate::CompressionType),

    /// Invalid checksum value (got, expected)
    InvalidChecksum((u64, u64)),

    /// The manifest references a table file that does not exist on disk
    ///
    /// This is fatal at open time.
    TableMissing(TableId),

    /// A level violated its sortedness or disjointness invariants after open
    LevelValidation(String),

    /// The tree was opened in read-only mode and a write operation was attempted
    ReadOnly,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StrataError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Compaction core result
pub type Result<T> = std::result::Result<T, Error>;
