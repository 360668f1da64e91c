//! Block device access for volume images

use crate::error::{AllocError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Fixed-size block storage underneath a volume
///
/// Implementations must be usable from several threads; the allocator only
/// reads through this trait at mount time, and transactions write through
/// it on commit.
pub trait BlockDevice: Send + Sync {
    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Number of addressable blocks
    fn block_count(&self) -> u64;

    /// Read one block into `buf` (`buf.len()` must equal the block size)
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one full block
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Flush all writes to stable storage
    fn sync(&self) -> Result<()>;
}

fn check_access(block: u64, len: usize, block_size: usize, block_count: u64) -> Result<()> {
    if block >= block_count {
        return Err(AllocError::io_at(
            block,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("block {} beyond end of device ({} blocks)", block, block_count),
            ),
        ));
    }
    if len != block_size {
        return Err(AllocError::io_at(
            block,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("buffer must be exactly {} bytes, got {}", block_size, len),
            ),
        ));
    }
    Ok(())
}

/// Disk-backed volume image
pub struct FileDevice {
    file: Mutex<File>,
    path: PathBuf,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Create (or truncate) an image of `block_count` zeroed blocks
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_count * block_size as u64)?;

        Ok(FileDevice {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            block_size,
            block_count,
        })
    }

    /// Open an existing image; the block count is derived from the file length
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let block_count = file.metadata()?.len() / block_size as u64;

        Ok(FileDevice {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            block_size,
            block_count,
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_access(block, buf.len(), self.block_size, self.block_count)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| AllocError::io_at(block, e))
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_access(block, data.len(), self.block_size, self.block_count)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))
            .and_then(|_| file.write_all(data))
            .map_err(|e| AllocError::io_at(block, e))
    }

    fn sync(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// In-memory volume image
pub struct MemoryDevice {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    block_count: u64,
}

impl MemoryDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        MemoryDevice {
            data: Mutex::new(vec![0u8; block_size * block_count as usize]),
            block_size,
            block_count,
        }
    }

    /// Copy of the whole image
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_access(block, buf.len(), self.block_size, self.block_count)?;
        let offset = block as usize * self.block_size;
        buf.copy_from_slice(&self.data.lock()[offset..offset + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_access(block, data.len(), self.block_size, self.block_count)?;
        let offset = block as usize * self.block_size;
        self.data.lock()[offset..offset + self.block_size].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_device_write_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let dev = FileDevice::create(temp.path(), 512, 16).unwrap();
        assert_eq!(dev.block_count(), 16);

        let mut data = vec![0u8; 512];
        data[0..5].copy_from_slice(b"Hello");
        dev.write_block(3, &data).unwrap();
        dev.sync().unwrap();

        let mut read = vec![0u8; 512];
        dev.read_block(3, &mut read).unwrap();
        assert_eq!(&read[0..5], b"Hello");
    }

    #[test]
    fn test_file_device_reopen() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();

        {
            let dev = FileDevice::create(&path, 1024, 8).unwrap();
            dev.write_block(7, &vec![0xAB; 1024]).unwrap();
            dev.sync().unwrap();
        }

        let dev = FileDevice::open(&path, 1024).unwrap();
        assert_eq!(dev.block_count(), 8);
        let mut buf = vec![0u8; 1024];
        dev.read_block(7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_memory_device_bounds() {
        let dev = MemoryDevice::new(512, 4);
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            dev.read_block(4, &mut buf),
            Err(AllocError::Io { block: Some(4), .. })
        ));
        assert!(dev.write_block(0, &[0u8; 100]).is_err());
    }
}
