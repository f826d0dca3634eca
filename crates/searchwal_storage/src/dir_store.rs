//! Directory-backed segment store.

use crate::error::{StorageError, StorageResult};
use crate::segment::{FileId, SegmentStore};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SEGMENT_EXTENSION: &str = "seg";
const STAMP_EXTENSION: &str = "lsn";
const LOCK_FILE_NAME: &str = "LOCK";

/// A segment store keeping one OS file per index file in a directory.
///
/// Layout:
///
/// ```text
/// <dir>/LOCK            exclusive lock held while the store is open
/// <dir>/0000000a.seg    bytes of file 10
/// <dir>/0000000a.lsn    applied LSN stamp of file 10 (u64, little-endian)
/// ```
///
/// The directory lock makes the holder the sole writer, which is what a
/// standby's redo path requires.
#[derive(Debug)]
pub struct DirectorySegmentStore {
    dir: PathBuf,
    _lock: File,
    io: Mutex<()>,
}

impl DirectorySegmentStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the directory,
    /// or an I/O error if it cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(dir.display().to_string()))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            io: Mutex::new(()),
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, file: FileId) -> PathBuf {
        self.dir
            .join(format!("{:08x}.{SEGMENT_EXTENSION}", file.as_u32()))
    }

    fn stamp_path(&self, file: FileId) -> PathBuf {
        self.dir.join(format!("{:08x}.{STAMP_EXTENSION}", file.as_u32()))
    }

    fn open_existing(&self, file: FileId) -> StorageResult<File> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.segment_path(file))
        {
            Ok(handle) => Ok(handle),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::FileNotFound(file)),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_segment_name(path: &Path) -> Option<FileId> {
    if path.extension()?.to_str()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    u32::from_str_radix(stem, 16).ok().map(FileId::new)
}

impl SegmentStore for DirectorySegmentStore {
    fn allocate_segment(&self, file: FileId, len: u64) -> StorageResult<()> {
        let _guard = self.io.lock();
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.segment_path(file))?;
        handle.set_len(len)?;
        Ok(())
    }

    fn write_range(&self, file: FileId, offset: u64, data: &[u8]) -> StorageResult<()> {
        let _guard = self.io.lock();
        let mut handle = self.open_existing(file)?;
        let size = handle.metadata()?.len();
        if offset > size {
            return Err(StorageError::out_of_bounds(
                file,
                offset,
                data.len() as u64,
                size,
            ));
        }
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(data)?;
        Ok(())
    }

    fn truncate_file(&self, file: FileId, len: u64) -> StorageResult<()> {
        let _guard = self.io.lock();
        let handle = self.open_existing(file)?;
        let size = handle.metadata()?.len();
        if len > size {
            return Err(StorageError::out_of_bounds(file, len, 0, size));
        }
        handle.set_len(len)?;
        Ok(())
    }

    fn remove_file(&self, file: FileId) -> StorageResult<bool> {
        let _guard = self.io.lock();
        match fs::remove_file(self.stamp_path(file)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.segment_path(file)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_range(&self, file: FileId, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let _guard = self.io.lock();
        let mut handle = self.open_existing(file)?;
        let size = handle.metadata()?.len();
        if offset.saturating_add(len) > size {
            return Err(StorageError::out_of_bounds(file, offset, len, size));
        }
        handle.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len as usize];
        handle.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn file_len(&self, file: FileId) -> StorageResult<Option<u64>> {
        match fs::metadata(self.segment_path(file)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn file_ids(&self) -> StorageResult<Vec<FileId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            if let Some(id) = parse_segment_name(&entry?.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn applied_lsn(&self, file: FileId) -> StorageResult<u64> {
        let bytes = match fs::read(self.stamp_path(file)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            StorageError::Corrupted(format!(
                "stamp of {file} has {} bytes, expected 8",
                bytes.len()
            ))
        })?;
        Ok(u64::from_le_bytes(raw))
    }

    fn set_applied_lsn(&self, file: FileId, lsn: u64) -> StorageResult<()> {
        let _guard = self.io.lock();
        if !self.segment_path(file).exists() {
            return Err(StorageError::FileNotFound(file));
        }
        let mut handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.stamp_path(file))?;
        handle.write_all(&lsn.to_le_bytes())?;
        Ok(())
    }

    fn sync_file(&self, file: FileId) -> StorageResult<()> {
        let _guard = self.io.lock();
        self.open_existing(file)?.sync_all()?;
        match File::open(self.stamp_path(file)) {
            Ok(stamp) => stamp.sync_all()?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
