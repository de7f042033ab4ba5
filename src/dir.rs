//! Directory entries and the directory layer.
//!
//! A directory's contents are a packed array of 32-byte entries layered on
//! top of the file engine. Removed entries leave zeroed holes that later
//! additions fill before the directory grows.

use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::inode::FileType;
use log::debug;

/// Encoded size of a directory entry in bytes.
pub const DIRENT_SIZE: usize = 32;
/// Maximum length of an entry name in bytes.
pub const NAME_MAX: usize = 28;

/// A directory entry: an inode number and a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// On-disk inode index of the target.
    pub inumber: u32,
    /// Entry name, without padding.
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Decodes a 32-byte entry. The name ends at the first NUL.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DIRENT_SIZE {
            return Err(Error::Corrupt);
        }
        let inumber = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let raw = &buf[4..];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(NAME_MAX);
        Ok(Self {
            inumber,
            name: raw[..end].to_vec(),
        })
    }

    /// Encodes the entry, NUL-padding the name to 28 bytes.
    pub fn encode(&self) -> Result<[u8; DIRENT_SIZE]> {
        check_name(&self.name)?;
        let mut buf = [0; DIRENT_SIZE];
        buf[0..4].copy_from_slice(&self.inumber.to_be_bytes());
        buf[4..4 + self.name.len()].copy_from_slice(&self.name);
        Ok(buf)
    }

    /// Whether this slot is a hole left by a removed entry.
    ///
    /// The root directory's on-disk index is 0, so a zero inumber alone is
    /// not enough; a hole also has an empty name.
    pub fn is_empty(&self) -> bool {
        self.inumber == 0 && self.name.is_empty()
    }
}

/// Validates an entry name: at most 28 bytes, no `/`.
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.len() > NAME_MAX || name.contains(&b'/') {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

impl Filesystem {
    /// Parses the slots of directory `n`, holes included.
    pub(crate) fn dir_slots(&mut self, n: u32) -> Result<Vec<DirEntry>> {
        let inode = self.itable.get(n)?;
        if inode.file_type()? != FileType::Directory {
            return Err(Error::WrongType);
        }
        if inode.size as usize % DIRENT_SIZE != 0 {
            return Err(Error::Corrupt);
        }
        let data = self.read_file(n)?;
        data.chunks_exact(DIRENT_SIZE).map(DirEntry::decode).collect()
    }

    /// Looks `name` up in directory `parent`. Case-sensitive linear scan.
    pub(crate) fn dir_lookup(&mut self, parent: u32, name: &[u8]) -> Result<u32> {
        self.dir_slots(parent)?
            .into_iter()
            .find(|e| !e.is_empty() && e.name == name)
            .map(|e| e.inumber)
            .ok_or(Error::NotFound)
    }

    /// Adds an entry for `child` under `parent`, reusing the first hole or
    /// growing the directory by one slot.
    ///
    /// When the child is a directory, the parent gains a link for the
    /// child's `..` entry.
    pub(crate) fn dir_add(&mut self, parent: u32, child: u32, name: &[u8]) -> Result<()> {
        check_name(name)?;
        let slots = self.dir_slots(parent)?;
        let slot = slots
            .iter()
            .position(DirEntry::is_empty)
            .unwrap_or(slots.len());
        let ent = DirEntry {
            inumber: child,
            name: name.to_vec(),
        };
        self.write_file(parent, (slot * DIRENT_SIZE) as u32, &ent.encode()?)?;
        if self.itable.get(child)?.file_type()? == FileType::Directory {
            let mut p = *self.itable.get(parent)?;
            p.links += 1;
            self.itable.put(&mut self.store, parent, p)?;
        }
        debug!(
            "dir {parent}: added {:?} -> inode {child} at slot {slot}",
            String::from_utf8_lossy(name)
        );
        Ok(())
    }

    /// Removes the entry `name` from `parent`, zeroing its slot, and
    /// returns the former target's index.
    ///
    /// The target loses one link; when it is a directory, the parent also
    /// loses the link held by the target's `..` entry. The directory is
    /// not compacted.
    pub(crate) fn dir_remove(&mut self, parent: u32, name: &[u8]) -> Result<u32> {
        let slots = self.dir_slots(parent)?;
        let slot = slots
            .iter()
            .position(|e| !e.is_empty() && e.name == name)
            .ok_or(Error::NotFound)?;
        let child = slots[slot].inumber;
        self.write_file(parent, (slot * DIRENT_SIZE) as u32, &[0; DIRENT_SIZE])?;
        let mut c = *self.itable.get(child)?;
        c.links = c.links.saturating_sub(1);
        self.itable.put(&mut self.store, child, c)?;
        if !c.is_free() && c.file_type()? == FileType::Directory {
            let mut p = *self.itable.get(parent)?;
            p.links = p.links.saturating_sub(1);
            self.itable.put(&mut self.store, parent, p)?;
        }
        debug!(
            "dir {parent}: removed {:?} (inode {child}, {} links left)",
            String::from_utf8_lossy(name),
            c.links
        );
        Ok(child)
    }
}
