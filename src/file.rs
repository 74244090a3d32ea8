// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::TableId;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const MAGIC_BYTES: [u8; 4] = [b'S', b'T', b'R', 1];

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const TABLE_FILE_EXT: &str = "sst";

/// Builds the file path for a table id, `{id:06}.sst`.
pub fn table_file_path(dir: &Path, id: TableId) -> PathBuf {
    dir.join(format!("{id:06}.{TABLE_FILE_EXT}"))
}

/// Parses a table id back out of a file name.
pub fn parse_table_file_name(path: &Path) -> Option<TableId> {
    if path.extension()? != TABLE_FILE_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<TableId>().ok()
}

/// Reads bytes from a file at the given offset.
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Reads bytes from a file at the given offset.
#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = buf.get_mut(n..).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "read returned more bytes than requested",
                    )
                })?;
                offset += n as u64;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Atomically rewrites a file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    #[allow(clippy::expect_used)]
    let folder = path.parent().expect("should have a parent directory");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
        fsync_directory(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
