//! Superblock parsing and image geometry.

use crate::error::{Error, Result};
use crate::inode::INODE_SIZE;
use std::io;

/// The filesystem's signature, at offset 0 of the image.
pub const MAGIC: [u8; 8] = *b"LARDFS\n\0";
/// Encoded size of the superblock in bytes.
pub const SUPERBLOCK_SIZE: usize = 28;
/// Size of one sector-map entry in bytes.
pub const IMAP_ENTRY_SIZE: usize = 4;

/// The default sector size in bytes.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;
/// The default fraction of the image reserved for inode and sector-map
/// overhead.
pub const DEFAULT_IFACTOR: f64 = 0.1;

/// The superblock, describing the image's sector size and region layout.
///
/// All region pointers are sector indices. Region lengths are implied by
/// successive pointers; regions are contiguous and sector-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Sector size in bytes.
    pub ssize: u32,
    /// Total number of sectors in the image.
    pub nsectors: u32,
    /// First sector of the inode table.
    pub ilist_p: u32,
    /// First sector of the sector map.
    pub imap_p: u32,
    /// First sector of the data pool.
    pub dpool_p: u32,
}

impl Superblock {
    /// Decodes a superblock, validating the magic and the region layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != SUPERBLOCK_SIZE || buf[..8] != MAGIC {
            return Err(Error::Corrupt);
        }
        let sb = Self {
            ssize: be32(&buf[8..12]),
            nsectors: be32(&buf[12..16]),
            ilist_p: be32(&buf[16..20]),
            imap_p: be32(&buf[20..24]),
            dpool_p: be32(&buf[24..28]),
        };
        if sb.ssize == 0 || sb.ssize % 4 != 0 {
            return Err(Error::Corrupt);
        }
        // regions must be ordered and leave a non-empty data pool
        if sb.ilist_p < 1
            || sb.ilist_p > sb.imap_p
            || sb.imap_p > sb.dpool_p
            || sb.dpool_p >= sb.nsectors
        {
            return Err(Error::Corrupt);
        }
        // the sector map must cover the whole data pool
        let imap_capacity = (sb.dpool_p - sb.imap_p) as u64 * sb.ssize as u64;
        if imap_capacity < sb.data_sectors() as u64 * IMAP_ENTRY_SIZE as u64 {
            return Err(Error::Corrupt);
        }
        Ok(sb)
    }

    /// Encodes the superblock into its 28-byte on-disk form.
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0; SUPERBLOCK_SIZE];
        buf[..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.ssize.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nsectors.to_be_bytes());
        buf[16..20].copy_from_slice(&self.ilist_p.to_be_bytes());
        buf[20..24].copy_from_slice(&self.imap_p.to_be_bytes());
        buf[24..28].copy_from_slice(&self.dpool_p.to_be_bytes());
        buf
    }

    /// Total size of the image in bytes.
    pub fn capacity(&self) -> u64 {
        self.nsectors as u64 * self.ssize as u64
    }

    /// Number of sectors in the data pool.
    pub fn data_sectors(&self) -> u32 {
        self.nsectors - self.dpool_p
    }

    /// Number of records the inode table can hold.
    pub fn inode_count(&self) -> u32 {
        let count =
            (self.imap_p - self.ilist_p) as u64 * self.ssize as u64 / INODE_SIZE as u64;
        count.min(u32::MAX as u64) as u32
    }

    /// Byte offset of the inode table.
    pub fn ilist_offset(&self) -> u64 {
        self.ilist_p as u64 * self.ssize as u64
    }

    /// Byte offset of the sector map.
    pub fn imap_offset(&self) -> u64 {
        self.imap_p as u64 * self.ssize as u64
    }

    /// Byte offset of data sector `s`.
    pub fn data_offset(&self, s: u32) -> u64 {
        (self.dpool_p as u64 + s as u64) * self.ssize as u64
    }
}

/// The computed layout of a fresh image.
///
/// Sector 0 holds the superblock, followed by the inode table, the sector
/// map and the data pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Sector size in bytes.
    pub ssize: u32,
    /// Total number of sectors.
    pub nsectors: u32,
    /// First sector of the inode table.
    pub ilist_start: u32,
    /// First sector of the sector map.
    pub imap_start: u32,
    /// First sector of the data pool.
    pub data_start: u32,
}

impl Geometry {
    /// Computes the layout for an image of `capacity` bytes.
    ///
    /// `ifactor` is the fraction of the image set aside for the inode table
    /// and the sector map; the data pool gets the rest.
    pub fn compute(capacity: u64, ssize: u32, ifactor: f64) -> Result<Self> {
        if ssize == 0 || ssize % 4 != 0 {
            return Err(invalid_input("sector size must be a non-zero multiple of 4"));
        }
        if capacity == 0 || capacity % ssize as u64 != 0 {
            return Err(invalid_input("capacity must be a multiple of the sector size"));
        }
        if !(0.0..1.0).contains(&ifactor) {
            return Err(invalid_input("ifactor must be in [0, 1)"));
        }
        if capacity / ssize as u64 > u32::MAX as u64 {
            return Err(invalid_input("capacity exceeds the addressable sector count"));
        }
        let nsectors = (capacity / ssize as u64) as u32;
        let data_sectors = (nsectors as f64 * (1.0 - ifactor)) as u32;
        let imap_sectors =
            ((data_sectors as u64 * IMAP_ENTRY_SIZE as u64).div_ceil(ssize as u64)) as u32;
        // whatever remains after the superblock goes to the inode table
        if data_sectors == 0 || nsectors <= data_sectors + imap_sectors + 1 {
            return Err(Error::NoSpace);
        }
        let inode_sectors = nsectors - data_sectors - imap_sectors - 1;
        Ok(Self {
            ssize,
            nsectors,
            ilist_start: 1,
            imap_start: 1 + inode_sectors,
            data_start: 1 + inode_sectors + imap_sectors,
        })
    }

    /// Total size of the image in bytes.
    pub fn capacity(&self) -> u64 {
        self.nsectors as u64 * self.ssize as u64
    }

    /// The superblock describing this layout.
    pub fn superblock(&self) -> Superblock {
        Superblock {
            ssize: self.ssize,
            nsectors: self.nsectors,
            ilist_p: self.ilist_start,
            imap_p: self.imap_start,
            dpool_p: self.data_start,
        }
    }
}

fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf.try_into().unwrap())
}

fn invalid_input(msg: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn superblock_roundtrip() {
        let sb = Superblock {
            ssize: 512,
            nsectors: 720,
            ilist_p: 1,
            imap_p: 66,
            dpool_p: 72,
        };
        let buf = sb.encode();
        assert_eq!(Superblock::decode(&buf).unwrap(), sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let sb = Superblock {
            ssize: 512,
            nsectors: 720,
            ilist_p: 1,
            imap_p: 66,
            dpool_p: 72,
        };
        let mut buf = sb.encode();
        buf[0] = b'X';
        assert!(Superblock::decode(&buf).is_err());
    }

    #[test]
    fn superblock_rejects_wrong_length() {
        assert!(Superblock::decode(&[0; 27]).is_err());
        assert!(Superblock::decode(&[0; 29]).is_err());
    }

    #[test]
    fn superblock_rejects_overlapping_regions() {
        let sb = Superblock {
            ssize: 512,
            nsectors: 720,
            ilist_p: 66,
            imap_p: 1,
            dpool_p: 72,
        };
        assert!(Superblock::decode(&sb.encode()).is_err());
    }

    #[test]
    fn geometry_default_layout() {
        // 360 KiB with a 512-byte sector and the default ifactor
        let geo = Geometry::compute(360 * 1024, 512, DEFAULT_IFACTOR).unwrap();
        assert_eq!(geo.nsectors, 720);
        assert_eq!(geo.ilist_start, 1);
        assert_eq!(geo.imap_start, 66);
        assert_eq!(geo.data_start, 72);
        let sb = geo.superblock();
        assert_eq!(sb.data_sectors(), 648);
        assert_eq!(sb.inode_count(), 65 * 512 / 32);
    }

    #[test]
    fn geometry_rejects_unaligned_capacity() {
        assert!(Geometry::compute(360 * 1024 + 1, 512, 0.1).is_err());
        assert!(Geometry::compute(360 * 1024, 510, 0.1).is_err());
    }
}
