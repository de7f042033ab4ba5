//! The sector allocation map.
//!
//! The map holds one signed big-endian entry per data sector: `-1` marks a
//! free sector, `-2` the end of a chain, and any non-negative value the
//! index of the sector's successor in its chain.

use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::superblock::IMAP_ENTRY_SIZE;
use log::debug;

/// Entry tag: the sector is free.
pub const FREE: i32 = -1;
/// Entry tag: the sector terminates its chain.
pub const EOF: i32 = -2;

/// The allocation map.
///
/// The in-memory array is the source of truth while the filesystem is
/// live; every mutation is written through to the on-disk slot.
pub struct Imap {
    entries: Vec<i32>,
}

impl Imap {
    /// Loads the map from the image.
    pub fn load(store: &mut ImageStore) -> Result<Self> {
        let sb = *store.superblock();
        let count = sb.data_sectors() as usize;
        let data = store.read_at(sb.imap_offset(), count * IMAP_ENTRY_SIZE)?;
        let entries = data
            .chunks_exact(IMAP_ENTRY_SIZE)
            .map(|e| i32::from_be_bytes(e.try_into().unwrap()))
            .collect();
        Ok(Self { entries })
    }

    /// Number of data sectors covered by the map.
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Number of free sectors.
    pub fn free_count(&self) -> u32 {
        self.entries.iter().filter(|e| **e == FREE).count() as u32
    }

    /// Returns the entry for sector `s`.
    pub fn next(&self, s: u32) -> Result<i32> {
        self.entries.get(s as usize).copied().ok_or(Error::Corrupt)
    }

    /// Allocates the lowest free sector, zeroing its contents and tagging
    /// it as the end of a chain.
    pub fn alloc(&mut self, store: &mut ImageStore) -> Result<u32> {
        let s = self
            .entries
            .iter()
            .position(|e| *e == FREE)
            .ok_or(Error::NoSpace)? as u32;
        let ssize = store.superblock().ssize as usize;
        store.write_data_sector(s, &vec![0; ssize])?;
        self.set(store, s, EOF)?;
        debug!("allocated data sector {s}");
        Ok(s)
    }

    /// Returns sector `s` to the free pool. The sector's contents are
    /// left in place; allocation zeroes them.
    pub fn free(&mut self, store: &mut ImageStore, s: u32) -> Result<()> {
        self.set(store, s, FREE)
    }

    /// Points sector `from` at `to`.
    pub fn link(&mut self, store: &mut ImageStore, from: u32, to: i32) -> Result<()> {
        self.set(store, from, to)
    }

    /// Updates entry `s` in memory and on disk.
    fn set(&mut self, store: &mut ImageStore, s: u32, val: i32) -> Result<()> {
        let slot = self.entries.get_mut(s as usize).ok_or(Error::Corrupt)?;
        *slot = val;
        let offset = store.superblock().imap_offset() + s as u64 * IMAP_ENTRY_SIZE as u64;
        store.write_at(offset, &val.to_be_bytes())
    }
}
