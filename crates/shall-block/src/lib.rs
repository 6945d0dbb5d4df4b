#![forbid(unsafe_code)]
//! Byte-addressed device I/O.
//!
//! The journal engine addresses its device by absolute byte offset
//! (superblocks live in the last kilobyte of quadratically spaced blocks;
//! record data is written in sub-block chunks), so the device trait is
//! pread/pwrite-shaped rather than block-shaped.

use parking_lot::RwLock;
use shall_error::{Result, ShallError};
use shall_types::{ByteOffset, DEV_BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len = u64::try_from(len).map_err(|_| ShallError::Format("length overflows u64".into()))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| ShallError::Format("I/O range overflows u64".into()))?;
    if end.0 > device_len {
        return Err(ShallError::Format(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Falls back to read-only when the file
/// cannot be opened for writing.
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

    /// Create a regular file of `len` bytes, for loop-style journal images.
    ///
    /// Refuses to overwrite an existing file.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        if len % DEV_BLOCK_SIZE != 0 {
            return Err(ShallError::Format(format!(
                "image size {len} is not a multiple of {DEV_BLOCK_SIZE}"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
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

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        trace!(
            target: "shall::block",
            offset = offset.0,
            len = buf.len(),
            "device_read"
        );
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(ShallError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        trace!(
            target: "shall::block",
            offset = offset.0,
            len = buf.len(),
            "device_write"
        );
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Backs unit tests, fsck dry runs, and the crash-recovery scenarios where
/// the same storage must survive an engine being dropped without unmount.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemByteDevice {
    /// Allocate a zeroed in-memory device of `len` bytes.
    pub fn new(len: u64) -> Result<Self> {
        let len = usize::try_from(len).map_err(|_| {
            ShallError::Format(format!("mem device size {len} does not fit in memory"))
        })?;
        Ok(Self {
            bytes: RwLock::new(vec![0_u8; len]),
        })
    }

    /// Copy of the full device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Overwrite the full device contents (crash-image injection in tests).
    pub fn restore(&self, image: Vec<u8>) {
        *self.bytes.write() = image;
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset.0)
            .map_err(|_| ShallError::Format("offset overflows usize".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset.0)
            .map_err(|_| ShallError::Format("offset overflows usize".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemByteDevice::new(8192).expect("mem device");
        dev.write_all_at(ByteOffset(100), b"hello").expect("write");
        let mut buf = [0_u8; 5];
        dev.read_exact_at(ByteOffset(100), &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = MemByteDevice::new(4096).expect("mem device");
        let mut buf = [0_u8; 8];
        assert!(dev.read_exact_at(ByteOffset(4090), &mut buf).is_err());
        assert!(dev.write_all_at(ByteOffset(4096), &[1]).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.img");
        let dev = FileByteDevice::create(&path, 16 * DEV_BLOCK_SIZE).expect("create");
        assert_eq!(dev.len_bytes(), 16 * DEV_BLOCK_SIZE);
        dev.write_all_at(ByteOffset(4096), b"abc").expect("write");
        dev.sync().expect("sync");

        let reopened = FileByteDevice::open(&path).expect("open");
        let mut buf = [0_u8; 3];
        reopened
            .read_exact_at(ByteOffset(4096), &mut buf)
            .expect("read");
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn file_device_create_rejects_unaligned_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("odd.img");
        assert!(FileByteDevice::create(&path, 5000).is_err());
    }

    #[test]
    fn file_device_create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.img");
        FileByteDevice::create(&path, 4096).expect("create");
        assert!(FileByteDevice::create(&path, 4096).is_err());
    }
}
