//! Append-only block payload files (`blk00000.dat`, `blk00001.dat`, ...).
//!
//! Each record is `magic(4) | len(u32 le) | payload`. A [`FileLocation`] points at the record
//! header, so a read can check both framing fields before trusting the payload.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const RECORD_MAGIC: [u8; 4] = *b"zblk";
pub const RECORD_HEADER_LEN: u64 = 8;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;
const FILE_PREFIX: &str = "blk";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut file_id = [0u8; 4];
        let mut offset = [0u8; 8];
        let mut len = [0u8; 4];
        file_id.copy_from_slice(&bytes[..4]);
        offset.copy_from_slice(&bytes[4..12]);
        len.copy_from_slice(&bytes[12..]);
        Self {
            file_id: u32::from_le_bytes(file_id),
            offset: u64::from_le_bytes(offset),
            len: u32::from_le_bytes(len),
        }
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    BadMagic(FileLocation),
    LengthMismatch { location: FileLocation, stored: u32 },
    TooLarge(usize),
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "block file i/o: {err}"),
            FlatFileError::BadMagic(location) => write!(
                f,
                "no block record at file {} offset {}",
                location.file_id, location.offset
            ),
            FlatFileError::LengthMismatch { location, stored } => write!(
                f,
                "block record at file {} offset {} has length {stored}, expected {}",
                location.file_id, location.offset, location.len
            ),
            FlatFileError::TooLarge(len) => write!(f, "block payload of {len} bytes is too large"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    max_file_size: u64,
    cursor: Mutex<Cursor>,
}

/// Position of the next append.
struct Cursor {
    file_id: u32,
    len: u64,
}

impl FlatFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FlatFileError> {
        Self::open_with_max_size(dir, DEFAULT_MAX_FILE_SIZE)
    }

    pub fn open_with_max_size(
        dir: impl Into<PathBuf>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let cursor = resume_cursor(&dir, max_file_size)?;
        zcore_log::log_debug!(
            "block files at {} resume in file {} at {}",
            dir.display(),
            cursor.file_id,
            cursor.len
        );
        Ok(Self {
            dir,
            max_file_size,
            cursor: Mutex::new(cursor),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one record and syncs it to disk before returning its location.
    pub fn append(&self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(payload.len()).map_err(|_| FlatFileError::TooLarge(payload.len()))?;
        let record_len = RECORD_HEADER_LEN + u64::from(len);

        let mut cursor = self.cursor.lock().expect("block file cursor");
        if cursor.len > 0 && cursor.len + record_len > self.max_file_size {
            cursor.file_id += 1;
            cursor.len = 0;
        }
        let location = FileLocation {
            file_id: cursor.file_id,
            offset: cursor.len,
            len,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(location.file_id))?;
        let mut record = Vec::with_capacity(record_len as usize);
        record.extend_from_slice(&RECORD_MAGIC);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(payload);
        file.write_all(&record)?;
        file.sync_data()?;

        cursor.len += record_len;
        Ok(location)
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        let mut file = File::open(self.file_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[..4] != RECORD_MAGIC {
            return Err(FlatFileError::BadMagic(location));
        }
        let stored = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if stored != location.len {
            return Err(FlatFileError::LengthMismatch { location, stored });
        }
        let mut payload = vec![0u8; stored as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        file_path(&self.dir, file_id)
    }
}

fn file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{file_id:05}.dat"))
}

fn resume_cursor(dir: &Path, max_file_size: u64) -> Result<Cursor, FlatFileError> {
    let mut last = None;
    let mut file_id = 0u32;
    loop {
        let path = file_path(dir, file_id);
        if !path.is_file() {
            break;
        }
        last = Some((file_id, std::fs::metadata(&path)?.len()));
        file_id += 1;
    }
    Ok(match last {
        Some((file_id, len)) if len >= max_file_size => Cursor {
            file_id: file_id + 1,
            len: 0,
        },
        Some((file_id, len)) => Cursor { file_id, len },
        None => Cursor { file_id: 0, len: 0 },
    })
}
