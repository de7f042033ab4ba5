//! The image store: sector-granular reads and byte-granular writes over
//! the backing file.

use crate::error::{Error, Result};
use crate::superblock::{Geometry, Superblock, IMAP_ENTRY_SIZE, SUPERBLOCK_SIZE};
use crate::imap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// A formatted image and its backing file.
///
/// The store holds the only handle to the file; every read and write of
/// the filesystem goes through it.
pub struct ImageStore {
    file: File,
    sb: Superblock,
}

impl ImageStore {
    /// Opens an existing image, parsing and validating its superblock.
    pub fn open(mut file: File) -> Result<Self> {
        let mut buf = [0; SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let sb = Superblock::decode(&buf)?;
        if file.metadata()?.len() < sb.capacity() {
            return Err(Error::Corrupt);
        }
        Ok(Self { file, sb })
    }

    /// Formats `file` with the given layout: the file is truncated to the
    /// full image size, the superblock written, every sector-map slot
    /// marked free, and the inode and data regions left zeroed.
    pub fn format(file: File, geo: &Geometry) -> Result<Self> {
        // drop any previous contents so the new regions start zeroed
        file.set_len(0)?;
        file.set_len(geo.capacity())?;
        let sb = geo.superblock();
        let mut store = Self { file, sb };
        store.write_at(0, &sb.encode())?;
        let mut map = Vec::with_capacity(sb.data_sectors() as usize * IMAP_ENTRY_SIZE);
        for _ in 0..sb.data_sectors() {
            map.extend_from_slice(&imap::FREE.to_be_bytes());
        }
        store.write_at(sb.imap_offset(), &map)?;
        Ok(store)
    }

    /// The parsed superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Reads `len` bytes at byte offset `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at byte offset `offset`. No alignment is required.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Reads image sector `s`.
    pub fn read_sector(&mut self, s: u32) -> Result<Vec<u8>> {
        self.read_at(s as u64 * self.sb.ssize as u64, self.sb.ssize as usize)
    }

    /// Reads data sector `s` (an index into the data pool).
    pub fn read_data_sector(&mut self, s: u32) -> Result<Vec<u8>> {
        self.read_at(self.sb.data_offset(s), self.sb.ssize as usize)
    }

    /// Writes one full data sector.
    pub fn write_data_sector(&mut self, s: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.sb.ssize as usize);
        self.write_at(self.sb.data_offset(s), data)
    }
}
