#![forbid(unsafe_code)]
//! Byte-addressed device I/O.
//!
//! Provides the [`ByteDevice`] trait with pread/pwrite semantics, a
//! file-backed implementation, and an in-memory device used throughout the
//! rescue test suites.

use btr_error::{BtrError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Reads and writes take `&self`; implementations that buffer internally
/// handle their own locking.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let len_u64 =
        u64::try_from(len).map_err(|_| BtrError::InvalidArgument(format!("{op} length overflows u64")))?;
    let end = offset
        .checked_add(len_u64)
        .ok_or_else(|| BtrError::InvalidArgument(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(BtrError::InvalidArgument(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Falls back to a read-only open when the
/// device cannot be opened for writing.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Open for reading only, failing instead of silently downgrading.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(BtrError::InvalidArgument(
                "device opened read-only".to_owned(),
            ));
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device backed by a `Vec<u8>`.
///
/// Shared across the workspace test suites as the standard writable image
/// double. Cloning shares the underlying buffer.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Snapshot of the full device contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "read")?;
        let offset = usize::try_from(offset)
            .map_err(|_| BtrError::InvalidArgument("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "write")?;
        let offset = usize::try_from(offset)
            .map_err(|_| BtrError::InvalidArgument("offset overflows usize".to_owned()))?;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
