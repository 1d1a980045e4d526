//! The byte store underneath the driver.

use crate::util::StorageError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Opaque byte-addressable store. Accesses past the end of allocated space are refused;
/// reads past the end of file come back zero-filled.
pub trait RealFile: Send {
    fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, StorageError>;

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), StorageError>;

    fn set_eoa(&mut self, eoa: u64) -> Result<(), StorageError>;

    fn get_eoa(&self) -> u64;

    /// Current physical size.
    fn get_eof(&self) -> Result<u64, StorageError>;

    fn flush(&mut self) -> Result<(), StorageError>;
}

fn check_eoa(address: u64, size: u64, eoa: u64) -> Result<u64, StorageError> {
    match address.checked_add(size) {
        Some(end) if end <= eoa => Ok(end),
        _ => Err(StorageError::BeyondEoa { address, size, eoa }),
    }
}

/// In-memory store, handy for tests and single-process runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryFile {
    bytes: Vec<u8>,
    eoa: u64,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl RealFile for MemoryFile {
    fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, StorageError> {
        check_eoa(address, size as u64, self.eoa)?;
        let mut out = vec![0u8; size];
        let start = address as usize;
        if start < self.bytes.len() {
            let available = (self.bytes.len() - start).min(size);
            out[..available].copy_from_slice(&self.bytes[start..start + available]);
        }
        Ok(out)
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let end = check_eoa(address, bytes.len() as u64, self.eoa)? as usize;
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[address as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn set_eoa(&mut self, eoa: u64) -> Result<(), StorageError> {
        self.eoa = eoa;
        Ok(())
    }

    fn get_eoa(&self) -> u64 {
        self.eoa
    }

    fn get_eof(&self) -> Result<u64, StorageError> {
        Ok(self.bytes.len() as u64)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A file on the local filesystem.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    file: File,
    eoa: u64,
}

impl LocalFile {
    /// Opens (creating if needed) `path`; the end of address starts at the current length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let eoa = file.metadata()?.len();
        Ok(Self { path, file, eoa })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RealFile for LocalFile {
    fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, StorageError> {
        check_eoa(address, size as u64, self.eoa)?;
        let mut out = vec![0u8; size];
        let len = self.file.metadata()?.len();
        if address < len {
            let available = ((len - address) as usize).min(size);
            self.file.seek(SeekFrom::Start(address))?;
            self.file.read_exact(&mut out[..available])?;
        }
        Ok(out)
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), StorageError> {
        check_eoa(address, bytes.len() as u64, self.eoa)?;
        self.file.seek(SeekFrom::Start(address))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn set_eoa(&mut self, eoa: u64) -> Result<(), StorageError> {
        self.eoa = eoa;
        Ok(())
    }

    fn get_eoa(&self) -> u64 {
        self.eoa
    }

    fn get_eof(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}
