//! Inode records and the on-disk inode table.

use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::imap::Imap;
use crate::util::timestamp_secs;
use log::debug;

/// Encoded size of an inode record in bytes.
pub const INODE_SIZE: usize = 32;

/// Mask of the file-type nibble in the mode bits.
const TYPE_MASK: u16 = 0xf000;
/// Mask of the permission bits (setuid/setgid/sticky plus the rwx triple).
const PERM_MASK: u16 = 0o7777;

/// File type tag, stored in the high nibble of the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// The tag value stored in the high nibble.
    pub fn tag(self) -> u16 {
        match self {
            Self::Regular => 1,
            Self::Directory => 2,
            Self::Symlink => 3,
        }
    }

    fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Self::Regular),
            2 => Some(Self::Directory),
            3 => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// An inode record.
///
/// A record whose type nibble is zero is a free slot; its remaining fields
/// are meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    /// File type (high nibble) and permission bits.
    pub mode: u16,
    /// Number of directory references to this inode.
    pub links: u16,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Inode change time, in seconds since the epoch.
    pub ctime: u32,
    /// Content modification time.
    pub mtime: u32,
    /// Access time.
    pub atime: u32,
    /// Byte length of the file contents.
    pub size: u32,
    /// First data sector of the content chain.
    pub fip: u32,
}

impl Inode {
    /// The all-zero record of a free slot.
    pub const FREE: Self = Self {
        mode: 0,
        links: 0,
        uid: 0,
        gid: 0,
        ctime: 0,
        mtime: 0,
        atime: 0,
        size: 0,
        fip: 0,
    };

    /// Decodes a 32-byte inode record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != INODE_SIZE {
            return Err(Error::Corrupt);
        }
        Ok(Self {
            mode: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            links: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            uid: be32(&buf[4..8]),
            gid: be32(&buf[8..12]),
            ctime: be32(&buf[12..16]),
            mtime: be32(&buf[16..20]),
            atime: be32(&buf[20..24]),
            size: be32(&buf[24..28]),
            fip: be32(&buf[28..32]),
        })
    }

    /// Encodes the record into its 32-byte on-disk form.
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0; INODE_SIZE];
        buf[0..2].copy_from_slice(&self.mode.to_be_bytes());
        buf[2..4].copy_from_slice(&self.links.to_be_bytes());
        buf[4..8].copy_from_slice(&self.uid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.gid.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ctime.to_be_bytes());
        buf[16..20].copy_from_slice(&self.mtime.to_be_bytes());
        buf[20..24].copy_from_slice(&self.atime.to_be_bytes());
        buf[24..28].copy_from_slice(&self.size.to_be_bytes());
        buf[28..32].copy_from_slice(&self.fip.to_be_bytes());
        buf
    }

    /// Builds the mode bits from a type tag and permission bits.
    pub fn mode_bits(kind: FileType, perm: u16) -> u16 {
        (kind.tag() << 12) | (perm & PERM_MASK)
    }

    /// Whether the record is a free slot.
    pub fn is_free(&self) -> bool {
        self.mode & TYPE_MASK == 0
    }

    /// The file type of an allocated record.
    pub fn file_type(&self) -> Result<FileType> {
        FileType::from_tag((self.mode & TYPE_MASK) >> 12).ok_or(Error::Corrupt)
    }

    /// The permission bits, without the type nibble.
    pub fn perm(&self) -> u16 {
        self.mode & PERM_MASK
    }
}

/// The fixed-size inode table.
///
/// The whole table is held in memory; every mutation goes through [`put`]
/// and is written through to the image immediately.
///
/// [`put`]: InodeTable::put
pub struct InodeTable {
    records: Vec<Inode>,
}

impl InodeTable {
    /// Loads the table from the image.
    pub fn load(store: &mut ImageStore) -> Result<Self> {
        let sb = *store.superblock();
        let count = sb.inode_count() as usize;
        let data = store.read_at(sb.ilist_offset(), count * INODE_SIZE)?;
        let records = data
            .chunks_exact(INODE_SIZE)
            .map(Inode::decode)
            .collect::<Result<_>>()?;
        Ok(Self { records })
    }

    /// Number of records in the table.
    pub fn len(&self) -> u32 {
        self.records.len() as u32
    }

    /// Number of free records.
    pub fn free_count(&self) -> u32 {
        self.records.iter().filter(|i| i.is_free()).count() as u32
    }

    /// Returns the record at index `n`.
    pub fn get(&self, n: u32) -> Result<&Inode> {
        self.records.get(n as usize).ok_or(Error::NotFound)
    }

    /// Replaces the record at index `n`, writing it through to the image.
    pub fn put(&mut self, store: &mut ImageStore, n: u32, inode: Inode) -> Result<()> {
        let slot = self.records.get_mut(n as usize).ok_or(Error::NotFound)?;
        *slot = inode;
        let offset = store.superblock().ilist_offset() + n as u64 * INODE_SIZE as u64;
        store.write_at(offset, &inode.encode())
    }

    /// Allocates the lowest free record.
    ///
    /// The new inode starts with a single link, the calling process's
    /// identity, the current time in all three timestamps, an empty size
    /// and a fresh end-of-chain sector.
    pub fn alloc(
        &mut self,
        store: &mut ImageStore,
        imap: &mut Imap,
        kind: FileType,
        perm: u16,
    ) -> Result<u32> {
        let n = self
            .records
            .iter()
            .position(Inode::is_free)
            .ok_or(Error::NoInodes)? as u32;
        let fip = imap.alloc(store)?;
        let now = timestamp_secs();
        let inode = Inode {
            mode: Inode::mode_bits(kind, perm),
            links: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            ctime: now,
            mtime: now,
            atime: now,
            size: 0,
            fip,
        };
        self.put(store, n, inode)?;
        debug!("allocated inode {n} (type {:?}, first sector {fip})", kind);
        Ok(n)
    }
}

fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf.try_into().unwrap())
}
