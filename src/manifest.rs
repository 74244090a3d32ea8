// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::{fsync_directory, rewrite_atomic, MAGIC_BYTES, MANIFEST_FILE},
    CompressionType, HashMap, TableId,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use varint_rs::{VarintReader, VarintWriter};

/// Rewrite the log once this many deletions have accumulated
/// and they outnumber the live tables
const DELETIONS_REWRITE_THRESHOLD: usize = 10_000;

/// A single durable state transition of the level structure
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ManifestChange {
    /// A new table file was created at the given level
    Create {
        /// Table ID
        id: TableId,

        /// Level the table lives at
        level: u8,

        /// Compression its data blocks use
        compression: CompressionType,
    },

    /// A table file is no longer referenced and may be unlinked
    Delete {
        /// Table ID
        id: TableId,
    },

    /// A table was promoted to a deeper level without being rewritten
    MoveDown {
        /// Table ID
        id: TableId,

        /// New (deeper) level
        level: u8,
    },
}

impl Encode for ManifestChange {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Create {
                id,
                level,
                compression,
            } => {
                writer.write_u8(0)?;
                writer.write_u64_varint(*id)?;
                writer.write_u8(*level)?;
                writer.write_u8(u8::from(*compression))?;
            }
            Self::Delete { id } => {
                writer.write_u8(1)?;
                writer.write_u64_varint(*id)?;
            }
            Self::MoveDown { id, level } => {
                writer.write_u8(2)?;
                writer.write_u64_varint(*id)?;
                writer.write_u8(*level)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestChange {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        Ok(match tag {
            0 => {
                let id = reader.read_u64_varint()?;
                let level = reader.read_u8()?;
                let compression = reader.read_u8()?;
                let compression = compression
                    .try_into()
                    .map_err(|()| DecodeError::InvalidTag(("CompressionType", compression)))?;

                Self::Create {
                    id,
                    level,
                    compression,
                }
            }
            1 => Self::Delete {
                id: reader.read_u64_varint()?,
            },
            2 => {
                let id = reader.read_u64_varint()?;
                let level = reader.read_u8()?;
                Self::MoveDown { id, level }
            }
            _ => return Err(DecodeError::InvalidTag(("ManifestChange", tag))),
        })
    }
}

/// What the manifest knows about one table
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableManifest {
    /// Level the table lives at
    pub level: u8,

    /// Compression of its data blocks
    pub compression: CompressionType,
}

/// In-memory view of the replayed manifest log
#[derive(Debug, Default)]
pub struct Manifest {
    /// All live tables
    pub tables: HashMap<TableId, TableManifest>,

    creations: usize,
    deletions: usize,
}

impl Manifest {
    fn apply(&mut self, change: &ManifestChange) -> Result<(), DecodeError> {
        match change {
            ManifestChange::Create {
                id,
                level,
                compression,
            } => {
                if self
                    .tables
                    .insert(
                        *id,
                        TableManifest {
                            level: *level,
                            compression: *compression,
                        },
                    )
                    .is_some()
                {
                    return Err(DecodeError::InvalidHeader("table created twice"));
                }
                self.creations += 1;
            }
            ManifestChange::Delete { id } => {
                if self.tables.remove(id).is_none() {
                    return Err(DecodeError::InvalidHeader("deleted unknown table"));
                }
                self.deletions += 1;
            }
            ManifestChange::MoveDown { id, level } => {
                let Some(entry) = self.tables.get_mut(id) else {
                    return Err(DecodeError::InvalidHeader("moved unknown table"));
                };
                entry.level = *level;
            }
        }
        Ok(())
    }
}

/// The durable manifest log
///
/// Every compaction commits its change set here *before* any level is
/// mutated in memory and before any file is unlinked; the log is therefore
/// the single source of truth during crash recovery.
pub struct ManifestFile {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Append handle, `None` in read-only mode
    file: Option<File>,
    manifest: Manifest,
}

impl ManifestFile {
    /// Opens (or creates) the manifest in `dir` and replays it.
    pub fn open(dir: &Path, read_only: bool) -> crate::Result<Self> {
        let path = dir.join(MANIFEST_FILE);

        let manifest = if path.try_exists()? {
            Self::replay(&path)?
        } else {
            if read_only {
                return Err(crate::Error::ReadOnly);
            }

            log::debug!("Creating fresh manifest at {path:?}");

            let mut file = File::create(&path)?;
            file.write_all(&MAGIC_BYTES)?;
            file.sync_all()?;
            fsync_directory(dir)?;

            Manifest::default()
        };

        let file = if read_only {
            None
        } else {
            Some(OpenOptions::new().append(true).open(&path)?)
        };

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, manifest }),
        })
    }

    fn replay(path: &Path) -> crate::Result<Manifest> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                "manifest magic mismatch",
            )));
        }

        let mut manifest = Manifest::default();
        let mut good_offset = MAGIC_BYTES.len() as u64;

        loop {
            let changes = match Self::read_change_set(&mut reader) {
                Ok(Some(changes)) => changes,
                Ok(None) => break,
                Err(e) => {
                    // A torn tail means we crashed mid-append; everything up
                    // to the last intact change set is authoritative
                    log::warn!("Truncating manifest at offset {good_offset}: {e:?}");

                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(good_offset)?;
                    file.sync_all()?;
                    break;
                }
            };

            for change in &changes {
                manifest.apply(change).map_err(crate::Error::Decode)?;
            }

            good_offset = reader.stream_position()?;
        }

        log::debug!("Replayed manifest: {} live tables", manifest.tables.len());

        Ok(manifest)
    }

    fn read_change_set<R: Read>(reader: &mut R) -> crate::Result<Option<Vec<ManifestChange>>> {
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let expected_checksum = reader.read_u64::<LittleEndian>()?;

        let mut payload = vec![0; len as usize];
        reader.read_exact(&mut payload)?;

        let got_checksum = xxhash_rust::xxh3::xxh3_64(&payload);
        if got_checksum != expected_checksum {
            return Err(crate::Error::InvalidChecksum((
                got_checksum,
                expected_checksum,
            )));
        }

        let mut payload = &payload[..];
        let count = payload.read_u32_varint()?;

        let mut changes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            changes.push(ManifestChange::decode_from(&mut payload)?);
        }

        Ok(Some(changes))
    }

    fn encode_change_set(changes: &[ManifestChange]) -> Result<Vec<u8>, EncodeError> {
        let mut payload = vec![];

        #[allow(clippy::cast_possible_truncation)]
        payload.write_u32_varint(changes.len() as u32)?;

        for change in changes {
            change.encode_into(&mut payload)?;
        }

        let mut record = vec![];

        #[allow(clippy::cast_possible_truncation)]
        record.write_u32::<LittleEndian>(payload.len() as u32)?;
        record.write_u64::<LittleEndian>(xxhash_rust::xxh3::xxh3_64(&payload))?;
        record.write_all(&payload)?;

        Ok(record)
    }

    /// Atomically applies and persists a change set.
    ///
    /// The in-memory view is updated first so an invalid change set is
    /// rejected before anything hits the disk.
    #[allow(clippy::expect_used)]
    pub fn add_changes(&self, changes: &[ManifestChange]) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if inner.file.is_none() {
            return Err(crate::Error::ReadOnly);
        }

        for change in changes {
            inner.manifest.apply(change).map_err(crate::Error::Decode)?;
        }

        let record = Self::encode_change_set(changes)?;

        {
            let Some(file) = &mut inner.file else {
                return Err(crate::Error::ReadOnly);
            };

            file.write_all(&record)?;
            file.sync_all()?;
        }

        if inner.manifest.deletions > DELETIONS_REWRITE_THRESHOLD
            && inner.manifest.deletions > inner.manifest.tables.len()
        {
            self.rewrite(&mut inner)?;
        }

        Ok(())
    }

    /// Compacts the log itself down to one change set of all live tables.
    fn rewrite(&self, inner: &mut Inner) -> crate::Result<()> {
        log::debug!(
            "Rewriting manifest, {} live tables, {} deletions",
            inner.manifest.tables.len(),
            inner.manifest.deletions,
        );

        let mut changes = inner
            .manifest
            .tables
            .iter()
            .map(|(&id, tm)| ManifestChange::Create {
                id,
                level: tm.level,
                compression: tm.compression,
            })
            .collect::<Vec<_>>();

        changes.sort_by_key(|c| match c {
            ManifestChange::Create { id, .. }
            | ManifestChange::Delete { id }
            | ManifestChange::MoveDown { id, .. } => *id,
        });

        let mut content = MAGIC_BYTES.to_vec();
        content.extend(Self::encode_change_set(&changes)?);

        rewrite_atomic(&self.path, &content)?;

        inner.file = Some(OpenOptions::new().append(true).open(&self.path)?);
        inner.manifest.creations = inner.manifest.tables.len();
        inner.manifest.deletions = 0;

        Ok(())
    }

    /// Returns a snapshot of the live tables.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn tables(&self) -> HashMap<TableId, TableManifest> {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .manifest
            .tables
            .clone()
    }

    /// Returns whether the manifest currently references the table.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn contains(&self, id: TableId) -> bool {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .manifest
            .tables
            .contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn manifest_replay_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let manifest = ManifestFile::open(dir.path(), false)?;
            manifest.add_changes(&[
                ManifestChange::Create {
                    id: 1,
                    level: 0,
                    compression: CompressionType::None,
                },
                ManifestChange::Create {
                    id: 2,
                    level: 0,
                    compression: CompressionType::None,
                },
            ])?;
            manifest.add_changes(&[
                ManifestChange::Delete { id: 1 },
                ManifestChange::Create {
                    id: 3,
                    level: 1,
                    compression: CompressionType::None,
                },
                ManifestChange::MoveDown { id: 2, level: 1 },
            ])?;
        }

        let manifest = ManifestFile::open(dir.path(), false)?;
        let tables = manifest.tables();

        assert_eq!(2, tables.len());
        assert!(!tables.contains_key(&1));
        assert_eq!(1, tables.get(&2).map(|t| t.level).unwrap_or_default());
        assert_eq!(1, tables.get(&3).map(|t| t.level).unwrap_or_default());

        Ok(())
    }

    #[test]
    fn manifest_rejects_double_create() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = ManifestFile::open(dir.path(), false)?;

        let create = ManifestChange::Create {
            id: 1,
            level: 0,
            compression: CompressionType::None,
        };

        manifest.add_changes(std::slice::from_ref(&create))?;
        assert!(manifest.add_changes(&[create]).is_err());

        Ok(())
    }

    #[test]
    fn manifest_truncates_torn_tail() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let manifest = ManifestFile::open(dir.path(), false)?;
            manifest.add_changes(&[ManifestChange::Create {
                id: 1,
                level: 0,
                compression: CompressionType::None,
            }])?;
        }

        // Simulate a crash mid-append
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(MANIFEST_FILE))?;
            file.write_all(&[0xAB, 0xCD])?;
        }

        let manifest = ManifestFile::open(dir.path(), false)?;
        assert!(manifest.contains(1));

        // Appending after truncation must work
        manifest.add_changes(&[ManifestChange::Create {
            id: 2,
            level: 0,
            compression: CompressionType::None,
        }])?;

        Ok(())
    }

    #[test]
    fn manifest_read_only() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        assert!(matches!(
            ManifestFile::open(dir.path(), true),
            Err(crate::Error::ReadOnly)
        ));

        {
            let manifest = ManifestFile::open(dir.path(), false)?;
            manifest.add_changes(&[ManifestChange::Create {
                id: 1,
                level: 0,
                compression: CompressionType::None,
            }])?;
        }

        let manifest = ManifestFile::open(dir.path(), true)?;
        assert!(manifest.contains(1));
        assert!(matches!(
            manifest.add_changes(&[ManifestChange::Delete { id: 1 }]),
            Err(crate::Error::ReadOnly)
        ));

        Ok(())
    }
}
