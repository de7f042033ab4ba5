//! The filesystem façade: the operations exposed to the mount adapter.
//!
//! Inode numbers at this boundary are 1-based; number 1 is the root
//! directory, whose on-disk index is 0. All mutable state (the sector map,
//! the inode table and the transient lookup counts) is owned by the
//! [`Filesystem`] value and every mutation flows through its methods.

use crate::dir::{check_name, DirEntry, DIRENT_SIZE, NAME_MAX};
use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::imap::Imap;
use crate::inode::{FileType, Inode, InodeTable};
use crate::util::timestamp_secs;
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::File;

/// The inode number of the root directory.
pub const ROOT_INO: u64 = 1;

/// Attributes of an inode, as handed to the adapter.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// 1-based inode number.
    pub ino: u64,
    /// File type.
    pub kind: FileType,
    /// Permission bits (the low 12 bits of the on-disk mode).
    pub perm: u16,
    /// Number of directory references.
    pub nlink: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Content length in bytes.
    pub size: u64,
    /// Access time, seconds since the epoch.
    pub atime: u32,
    /// Content modification time.
    pub mtime: u32,
    /// Inode change time.
    pub ctime: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Sectors backing the content.
    pub blocks: u64,
}

/// Attribute changes applied by [`Filesystem::setattr`]. Unset fields are
/// left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttr {
    /// New permission bits.
    pub perm: Option<u16>,
    /// New owner user id.
    pub uid: Option<u32>,
    /// New owner group id.
    pub gid: Option<u32>,
    /// New content length; shrinking or growing goes through truncation.
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<u32>,
    /// New modification time.
    pub mtime: Option<u32>,
}

/// Filesystem usage counters, as reported by `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    /// Sector size in bytes.
    pub bsize: u32,
    /// Total data sectors.
    pub blocks: u64,
    /// Free data sectors.
    pub bfree: u64,
    /// Free data sectors available to unprivileged users.
    pub bavail: u64,
    /// Total inode records.
    pub files: u64,
    /// Free inode records.
    pub ffree: u64,
    /// Maximum entry name length.
    pub namelen: u32,
}

/// A mounted LARDFS image.
pub struct Filesystem {
    pub(crate) store: ImageStore,
    pub(crate) itable: InodeTable,
    pub(crate) imap: Imap,
    /// Transient lookup counts: references the adapter still holds.
    /// An unlinked inode is reclaimed only once its count drains.
    lookups: HashMap<u32, u64>,
}

impl Filesystem {
    /// Opens a formatted image.
    pub fn open(file: File) -> Result<Self> {
        let mut store = ImageStore::open(file)?;
        let itable = InodeTable::load(&mut store)?;
        let imap = Imap::load(&mut store)?;
        debug!(
            "opened image: {} sectors of {} bytes, {} inodes",
            store.superblock().nsectors,
            store.superblock().ssize,
            itable.len()
        );
        Ok(Self {
            store,
            itable,
            imap,
            lookups: HashMap::new(),
        })
    }

    /// The sector size of the underlying image.
    pub fn sector_size(&self) -> u32 {
        self.store.superblock().ssize
    }

    /// Translates an adapter inode number to an on-disk index.
    fn idx(ino: u64) -> Result<u32> {
        ino.checked_sub(1)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(Error::NotFound)
    }

    /// Returns the live inode at index `n`, refusing free slots.
    fn live(&self, n: u32) -> Result<Inode> {
        let inode = *self.itable.get(n)?;
        if inode.is_free() {
            return Err(Error::NotFound);
        }
        Ok(inode)
    }

    fn stat_of(&self, n: u32) -> Result<Stat> {
        let inode = self.live(n)?;
        let ssize = self.store.superblock().ssize;
        Ok(Stat {
            ino: n as u64 + 1,
            kind: inode.file_type()?,
            perm: inode.perm(),
            nlink: inode.links as u32,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size as u64,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            blksize: ssize,
            blocks: (inode.size as u64).div_ceil(ssize as u64).max(1),
        })
    }

    /// Reclaims inode `n` if it has neither directory references nor
    /// transient lookups left.
    fn reap(&mut self, n: u32) -> Result<()> {
        let inode = *self.itable.get(n)?;
        if inode.is_free() || inode.links > 0 {
            return Ok(());
        }
        if self.lookups.get(&n).copied().unwrap_or(0) > 0 {
            debug!("inode {n}: unlinked but still referenced, deferring");
            return Ok(());
        }
        self.wipe(n)
    }

    fn remember(&mut self, n: u32) {
        *self.lookups.entry(n).or_insert(0) += 1;
    }

    /// Resolves `name` under `parent` and registers a lookup reference.
    pub fn lookup(&mut self, parent: u64, name: &[u8]) -> Result<Stat> {
        let p = Self::idx(parent)?;
        self.live(p)?;
        let n = self.dir_lookup(p, name)?;
        let stat = self.stat_of(n)?;
        self.remember(n);
        Ok(stat)
    }

    /// Drops `count` lookup references from `ino`, reclaiming the inode if
    /// it was unlinked in the meantime.
    pub fn forget(&mut self, ino: u64, count: u64) {
        let Ok(n) = Self::idx(ino) else {
            return;
        };
        if let Some(held) = self.lookups.get_mut(&n) {
            *held = held.saturating_sub(count);
            if *held == 0 {
                self.lookups.remove(&n);
            }
        }
        if let Err(e) = self.reap(n) {
            warn!("inode {n}: reclaim after forget failed: {e}");
        }
    }

    /// Returns the attributes of `ino`.
    pub fn getattr(&self, ino: u64) -> Result<Stat> {
        self.stat_of(Self::idx(ino)?)
    }

    /// Applies the set fields of `set` to `ino`.
    pub fn setattr(&mut self, ino: u64, set: SetAttr) -> Result<Stat> {
        let n = Self::idx(ino)?;
        let inode = self.live(n)?;
        if let Some(size) = set.size {
            if inode.file_type()? != FileType::Regular {
                return Err(Error::WrongType);
            }
            let size = u32::try_from(size).map_err(|_| Error::NoSpace)?;
            self.truncate_file(n, size)?;
        }
        let mut inode = self.live(n)?;
        if let Some(perm) = set.perm {
            inode.mode = Inode::mode_bits(inode.file_type()?, perm);
        }
        if let Some(uid) = set.uid {
            inode.uid = uid;
        }
        if let Some(gid) = set.gid {
            inode.gid = gid;
        }
        if let Some(atime) = set.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = set.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = timestamp_secs();
        self.itable.put(&mut self.store, n, inode)?;
        self.stat_of(n)
    }

    /// Lists the entries of directory `ino`, holes skipped.
    pub fn readdir(&mut self, ino: u64) -> Result<Vec<(u64, FileType, Vec<u8>)>> {
        let n = Self::idx(ino)?;
        self.live(n)?;
        let mut entries = Vec::new();
        for ent in self.dir_slots(n)? {
            if ent.is_empty() {
                continue;
            }
            let kind = self.live(ent.inumber)?.file_type()?;
            entries.push((ent.inumber as u64 + 1, kind, ent.name));
        }
        Ok(entries)
    }

    /// Creates a regular file under `parent`.
    pub fn create(&mut self, parent: u64, name: &[u8], perm: u16) -> Result<Stat> {
        let p = Self::idx(parent)?;
        self.live(p)?;
        check_name(name)?;
        let n = self
            .itable
            .alloc(&mut self.store, &mut self.imap, FileType::Regular, perm)?;
        if let Err(e) = self.dir_add(p, n, name) {
            self.wipe(n)?;
            return Err(e);
        }
        self.stat_of(n)
    }

    /// Creates a directory under `parent`, seeded with `.` and `..`.
    pub fn mkdir(&mut self, parent: u64, name: &[u8], perm: u16) -> Result<Stat> {
        let p = Self::idx(parent)?;
        self.live(p)?;
        check_name(name)?;
        let n = self
            .itable
            .alloc(&mut self.store, &mut self.imap, FileType::Directory, perm)?;
        if let Err(e) = self.seed_dir(p, n).and_then(|()| self.dir_add(p, n, name)) {
            self.wipe(n)?;
            return Err(e);
        }
        self.stat_of(n)
    }

    /// Writes the `.` and `..` entries of the fresh directory `n` and
    /// accounts for the self reference.
    fn seed_dir(&mut self, parent: u32, n: u32) -> Result<()> {
        let dot = DirEntry {
            inumber: n,
            name: b".".to_vec(),
        };
        let dotdot = DirEntry {
            inumber: parent,
            name: b"..".to_vec(),
        };
        self.write_file(n, 0, &dot.encode()?)?;
        self.write_file(n, DIRENT_SIZE as u32, &dotdot.encode()?)?;
        // the self entry is a second reference
        let mut inode = *self.itable.get(n)?;
        inode.links = 2;
        self.itable.put(&mut self.store, n, inode)
    }

    /// Removes the regular file or symlink `name` from `parent`.
    pub fn unlink(&mut self, parent: u64, name: &[u8]) -> Result<()> {
        let p = Self::idx(parent)?;
        self.live(p)?;
        let target = self.dir_lookup(p, name)?;
        if self.live(target)?.file_type()? == FileType::Directory {
            return Err(Error::WrongType);
        }
        let child = self.dir_remove(p, name)?;
        self.reap(child)
    }

    /// Removes the empty directory `name` from `parent`.
    pub fn rmdir(&mut self, parent: u64, name: &[u8]) -> Result<()> {
        let p = Self::idx(parent)?;
        self.live(p)?;
        let n = self.dir_lookup(p, name)?;
        if self.live(n)?.file_type()? != FileType::Directory {
            return Err(Error::WrongType);
        }
        let busy = self
            .dir_slots(n)?
            .iter()
            .any(|e| !e.is_empty() && e.name != b"." && e.name != b"..");
        if busy {
            return Err(Error::NotEmpty);
        }
        self.dir_remove(p, name)?;
        // the victim's self entry dies with it
        let mut inode = *self.itable.get(n)?;
        inode.links = 0;
        self.itable.put(&mut self.store, n, inode)?;
        self.reap(n)
    }

    /// Adds a second directory entry for `target` under `newparent`.
    pub fn link(&mut self, target: u64, newparent: u64, newname: &[u8]) -> Result<Stat> {
        let t = Self::idx(target)?;
        let p = Self::idx(newparent)?;
        self.live(p)?;
        if self.live(t)?.file_type()? == FileType::Directory {
            return Err(Error::WrongType);
        }
        check_name(newname)?;
        self.dir_add(p, t, newname)?;
        let mut inode = *self.itable.get(t)?;
        inode.links += 1;
        inode.ctime = timestamp_secs();
        self.itable.put(&mut self.store, t, inode)?;
        self.stat_of(t)
    }

    /// Creates a symlink named `linkname` under `parent`, pointing at
    /// `target`. The target path is stored as the link's file contents.
    pub fn symlink(&mut self, parent: u64, linkname: &[u8], target: &[u8]) -> Result<Stat> {
        let p = Self::idx(parent)?;
        self.live(p)?;
        check_name(linkname)?;
        let n = self
            .itable
            .alloc(&mut self.store, &mut self.imap, FileType::Symlink, 0o777)?;
        if let Err(e) = self
            .write_file(n, 0, target)
            .and_then(|()| self.dir_add(p, n, linkname))
        {
            self.wipe(n)?;
            return Err(e);
        }
        self.stat_of(n)
    }

    /// Reads the target path of symlink `ino`.
    pub fn readlink(&mut self, ino: u64) -> Result<Vec<u8>> {
        let n = Self::idx(ino)?;
        if self.live(n)?.file_type()? != FileType::Symlink {
            return Err(Error::WrongType);
        }
        self.read_file(n)
    }

    /// Moves the entry `oldname` of `oldparent` to `newname` under
    /// `newparent`, replacing any existing destination entry.
    ///
    /// The destination is settled first and the old entry removed last, so
    /// an interrupted rename leaves the file reachable under at least one
    /// of the two names.
    pub fn rename(
        &mut self,
        oldparent: u64,
        oldname: &[u8],
        newparent: u64,
        newname: &[u8],
    ) -> Result<()> {
        let op = Self::idx(oldparent)?;
        let np = Self::idx(newparent)?;
        self.live(op)?;
        self.live(np)?;
        check_name(newname)?;
        let child = self.dir_lookup(op, oldname)?;
        let child_is_dir = self.live(child)?.file_type()? == FileType::Directory;
        if let Ok(existing) = self.dir_lookup(np, newname) {
            if existing == child {
                // both names already reference the same inode
                return Ok(());
            }
            let ex = self.live(existing)?;
            let ex_is_dir = ex.file_type()? == FileType::Directory;
            if ex_is_dir != child_is_dir {
                return Err(Error::WrongType);
            }
            if ex_is_dir {
                let busy = self
                    .dir_slots(existing)?
                    .iter()
                    .any(|e| !e.is_empty() && e.name != b"." && e.name != b"..");
                if busy {
                    return Err(Error::NotEmpty);
                }
            }
            self.dir_remove(np, newname)?;
            if ex_is_dir {
                let mut inode = *self.itable.get(existing)?;
                inode.links = 0;
                self.itable.put(&mut self.store, existing, inode)?;
            }
            self.reap(existing)?;
        }
        // pre-balance the reference the removal below will drop
        let mut inode = *self.itable.get(child)?;
        inode.links += 1;
        self.itable.put(&mut self.store, child, inode)?;
        self.dir_add(np, child, newname)?;
        self.dir_remove(op, oldname)?;
        if child_is_dir && op != np {
            // the moved directory's `..` follows it to the new parent
            let slots = self.dir_slots(child)?;
            if let Some(i) = slots.iter().position(|e| e.name == b"..") {
                let ent = DirEntry {
                    inumber: np,
                    name: b"..".to_vec(),
                };
                self.write_file(child, (i * DIRENT_SIZE) as u32, &ent.encode()?)?;
            }
        }
        Ok(())
    }

    /// Validates that `ino` can be opened. File handles carry no state.
    pub fn open_file(&self, ino: u64, _flags: i32) -> Result<()> {
        self.live(Self::idx(ino)?)?;
        Ok(())
    }

    /// Reads up to `size` bytes of regular file `ino` from `offset`.
    pub fn read(&mut self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let n = Self::idx(ino)?;
        if self.live(n)?.file_type()? != FileType::Regular {
            return Err(Error::WrongType);
        }
        let data = self.read_file(n)?;
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Writes `buf` into regular file `ino` at `offset`, returning the
    /// number of bytes written.
    pub fn write(&mut self, ino: u64, offset: u64, buf: &[u8]) -> Result<u32> {
        let n = Self::idx(ino)?;
        if self.live(n)?.file_type()? != FileType::Regular {
            return Err(Error::WrongType);
        }
        let offset = u32::try_from(offset).map_err(|_| Error::BadOffset)?;
        self.write_file(n, offset, buf)?;
        Ok(buf.len() as u32)
    }

    /// Truncates regular file `ino` to `new_size` bytes.
    pub fn truncate(&mut self, ino: u64, new_size: u64) -> Result<()> {
        let n = Self::idx(ino)?;
        if self.live(n)?.file_type()? != FileType::Regular {
            return Err(Error::WrongType);
        }
        let new_size = u32::try_from(new_size).map_err(|_| Error::NoSpace)?;
        self.truncate_file(n, new_size)
    }

    /// Reports usage counters for the whole image.
    pub fn statfs(&self) -> FsStats {
        let free = self.imap.free_count() as u64;
        FsStats {
            bsize: self.store.superblock().ssize,
            blocks: self.imap.len() as u64,
            bfree: free,
            bavail: free,
            files: self.itable.len() as u64,
            ffree: self.itable.free_count() as u64,
            namelen: NAME_MAX as u32,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::ImageBuilder;

    /// Builds the reference image: /etc/motd ("hello, world!\n") and
    /// /var/big (1337 * "A") in a 360 KiB file.
    fn demo_fs() -> Filesystem {
        let file = tempfile::tempfile().unwrap();
        let mut b = ImageBuilder::new(360 * 1024).unwrap();
        let root = b.root();
        let etc = b.mkdir(root, b"etc").unwrap();
        let motd = b.create(etc, b"motd").unwrap();
        b.append(motd, b"hello, world!\n").unwrap();
        let var = b.mkdir(root, b"var").unwrap();
        let big = b.create(var, b"big").unwrap();
        b.append(big, &[b'A'; 1337]).unwrap();
        b.build(file.try_clone().unwrap()).unwrap();
        Filesystem::open(file).unwrap()
    }

    // inode numbers on the demo image follow creation order
    const ETC: u64 = 2;
    const MOTD: u64 = 3;
    const VAR: u64 = 4;
    const BIG: u64 = 5;

    /// Checks that no data sector belongs to two chains and that the free
    /// count accounts for every sector not owned by a chain.
    fn assert_disjoint_chains(fs: &Filesystem) {
        let mut owned = std::collections::HashSet::new();
        for n in 0..fs.itable.len() {
            if fs.itable.get(n).unwrap().is_free() {
                continue;
            }
            for s in fs.chain(n).unwrap() {
                assert!(owned.insert(s), "sector {s} owned twice");
            }
        }
        assert_eq!(fs.imap.free_count() as usize, fs.imap.len() as usize - owned.len());
    }

    #[test]
    fn demo_image_resolves_and_reads() {
        let mut fs = demo_fs();
        let etc = fs.lookup(ROOT_INO, b"etc").unwrap();
        assert_eq!(etc.ino, ETC);
        assert_eq!(etc.kind, FileType::Directory);
        let motd = fs.lookup(ETC, b"motd").unwrap();
        assert_eq!(motd.ino, MOTD);
        assert_eq!(fs.read(MOTD, 0, 1024).unwrap(), b"hello, world!\n");
        assert_eq!(fs.chain(MOTD as u32 - 1).unwrap().len(), 1);
        assert!(matches!(
            fs.lookup(ROOT_INO, b"nothing"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn demo_big_spans_three_sectors() {
        let mut fs = demo_fs();
        assert_eq!(fs.chain(BIG as u32 - 1).unwrap().len(), 3);
        let data = fs.read(BIG, 0, 2048).unwrap();
        assert_eq!(data.len(), 1337);
        assert!(data.iter().all(|b| *b == b'A'));
    }

    #[test]
    fn write_extends_chain_and_truncate_releases_it() {
        let mut fs = demo_fs();
        let big = BIG as u32 - 1;
        // filling the last sector grows the size but not the chain
        fs.write(BIG, 1337, &[b'A'; 199]).unwrap();
        assert_eq!(fs.getattr(BIG).unwrap().size, 1536);
        assert_eq!(fs.chain(big).unwrap().len(), 3);
        // one more byte needs a fourth sector
        fs.write(BIG, 1536, b"A").unwrap();
        assert_eq!(fs.getattr(BIG).unwrap().size, 1537);
        assert_eq!(fs.chain(big).unwrap().len(), 4);
        fs.truncate(BIG, 1337).unwrap();
        assert_eq!(fs.getattr(BIG).unwrap().size, 1337);
        assert_eq!(fs.chain(big).unwrap().len(), 3);
        assert_disjoint_chains(&fs);
    }

    #[test]
    fn overwrite_keeps_surrounding_bytes() {
        let mut fs = demo_fs();
        fs.write(MOTD, 0, b"weelp").unwrap();
        assert_eq!(fs.read(MOTD, 0, 1024).unwrap(), b"weelp, world!\n");
        assert_eq!(fs.getattr(MOTD).unwrap().size, 14);
        fs.write(MOTD, 7, b"thingy!\n").unwrap();
        assert_eq!(fs.read(MOTD, 0, 1024).unwrap(), b"weelp, thingy!\n");
        assert_eq!(fs.getattr(MOTD).unwrap().size, 15);
    }

    #[test]
    fn write_roundtrip_across_sector_boundaries() {
        let mut fs = demo_fs();
        for (i, len) in [1usize, 511, 512, 513, 1500, 1537].into_iter().enumerate() {
            let name = format!("f{i}");
            let stat = fs.create(ROOT_INO, name.as_bytes(), 0o644).unwrap();
            let data: Vec<u8> = (0..len).map(|b| (b % 251) as u8).collect();
            fs.write(stat.ino, 0, &data).unwrap();
            assert_eq!(fs.read(stat.ino, 0, len as u32 + 64).unwrap(), data);
            let expect = len.div_ceil(512).max(1);
            assert_eq!(fs.chain(stat.ino as u32 - 1).unwrap().len(), expect);
        }
        assert_disjoint_chains(&fs);
    }

    #[test]
    fn write_into_the_middle_of_a_long_file() {
        let mut fs = demo_fs();
        let stat = fs.create(ROOT_INO, b"buf", 0o644).unwrap();
        let base = vec![0x55; 1600];
        fs.write(stat.ino, 0, &base).unwrap();
        let patch = vec![0xaa; 700];
        fs.write(stat.ino, 400, &patch).unwrap();
        let data = fs.read(stat.ino, 0, 4096).unwrap();
        assert_eq!(&data[..400], &base[..400]);
        assert_eq!(&data[400..1100], patch.as_slice());
        assert_eq!(&data[1100..], &base[1100..]);
        assert_eq!(data.len(), 1600);
    }

    #[test]
    fn writes_past_the_end_are_rejected() {
        let mut fs = demo_fs();
        let size = fs.getattr(MOTD).unwrap().size;
        assert!(matches!(
            fs.write(MOTD, size + 1, b"x"),
            Err(Error::BadOffset)
        ));
        // writing exactly at the end is an append
        fs.write(MOTD, size, b"x").unwrap();
        assert_eq!(fs.getattr(MOTD).unwrap().size, size + 1);
    }

    #[test]
    fn truncate_is_idempotent() {
        let mut fs = demo_fs();
        fs.truncate(BIG, 600).unwrap();
        let after_first = fs.read(BIG, 0, 2048).unwrap();
        let chain_first = fs.chain(BIG as u32 - 1).unwrap();
        fs.truncate(BIG, 600).unwrap();
        assert_eq!(fs.read(BIG, 0, 2048).unwrap(), after_first);
        assert_eq!(fs.chain(BIG as u32 - 1).unwrap(), chain_first);
    }

    #[test]
    fn truncate_to_zero_keeps_one_sector() {
        let mut fs = demo_fs();
        fs.truncate(BIG, 0).unwrap();
        assert_eq!(fs.getattr(BIG).unwrap().size, 0);
        assert_eq!(fs.chain(BIG as u32 - 1).unwrap().len(), 1);
        assert_eq!(fs.read(BIG, 0, 1024).unwrap(), b"");
        // the file is still writable from scratch
        fs.write(BIG, 0, b"fresh").unwrap();
        assert_eq!(fs.read(BIG, 0, 1024).unwrap(), b"fresh");
        assert_disjoint_chains(&fs);
    }

    #[test]
    fn truncate_grow_zero_fills() {
        let mut fs = demo_fs();
        fs.truncate(MOTD, 600).unwrap();
        let data = fs.read(MOTD, 0, 1024).unwrap();
        assert_eq!(data.len(), 600);
        assert_eq!(&data[..14], b"hello, world!\n");
        assert!(data[14..].iter().all(|b| *b == 0));
        assert_eq!(fs.chain(MOTD as u32 - 1).unwrap().len(), 2);
    }

    #[test]
    fn create_then_unlink_releases_slot_and_inode() {
        let mut fs = demo_fs();
        let dir = fs.mkdir(ROOT_INO, b"tmp", 0o755).unwrap();
        let size_before = fs.getattr(dir.ino).unwrap().size;
        let f = fs.create(dir.ino, b"f", 0o644).unwrap();
        fs.unlink(dir.ino, b"f").unwrap();
        assert!(matches!(fs.getattr(f.ino), Err(Error::NotFound)));
        // the next file reuses both the inode and the entry hole
        let g = fs.create(dir.ino, b"g", 0o644).unwrap();
        assert_eq!(g.ino, f.ino);
        assert_eq!(fs.getattr(dir.ino).unwrap().size, size_before + DIRENT_SIZE as u64);
        assert_disjoint_chains(&fs);
    }

    #[test]
    fn link_counts_track_directory_entries() {
        let mut fs = demo_fs();
        // root: its own `.` and `..` plus one `..` per subdirectory
        assert_eq!(fs.getattr(ROOT_INO).unwrap().nlink, 4);
        assert_eq!(fs.getattr(ETC).unwrap().nlink, 2);
        assert_eq!(fs.getattr(MOTD).unwrap().nlink, 1);
        let sub = fs.mkdir(ETC, b"sub", 0o755).unwrap();
        assert_eq!(sub.nlink, 2);
        assert_eq!(fs.getattr(ETC).unwrap().nlink, 3);
        fs.rmdir(ETC, b"sub").unwrap();
        assert_eq!(fs.getattr(ETC).unwrap().nlink, 2);
    }

    #[test]
    fn readdir_lists_dot_entries_and_children() {
        let mut fs = demo_fs();
        let names: Vec<Vec<u8>> = fs
            .readdir(ROOT_INO)
            .unwrap()
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        assert_eq!(names, vec![b".".to_vec(), b"..".to_vec(), b"etc".to_vec(), b"var".to_vec()]);
        // `.` and `..` of the root both point at the root
        let entries = fs.readdir(ROOT_INO).unwrap();
        assert_eq!(entries[0].0, ROOT_INO);
        assert_eq!(entries[1].0, ROOT_INO);
    }

    #[test]
    fn directory_grows_past_one_sector() {
        let mut fs = demo_fs();
        let dir = fs.mkdir(ROOT_INO, b"many", 0o755).unwrap();
        for i in 0..20 {
            let name = format!("file{i:02}");
            fs.create(dir.ino, name.as_bytes(), 0o644).unwrap();
        }
        assert_eq!(fs.chain(dir.ino as u32 - 1).unwrap().len(), 2);
        assert_eq!(fs.readdir(dir.ino).unwrap().len(), 22);
    }

    #[test]
    fn unlink_while_referenced_defers_reclaim() {
        let mut fs = demo_fs();
        let free_before = fs.statfs().bfree;
        fs.lookup(VAR, b"big").unwrap();
        fs.unlink(VAR, b"big").unwrap();
        // still readable through the held reference
        let data = fs.read(BIG, 0, 2048).unwrap();
        assert_eq!(data.len(), 1337);
        assert_eq!(fs.statfs().bfree, free_before);
        fs.forget(BIG, 1);
        assert!(matches!(fs.getattr(BIG), Err(Error::NotFound)));
        assert_eq!(fs.statfs().bfree, free_before + 3);
    }

    #[test]
    fn hard_links_share_the_inode() {
        let mut fs = demo_fs();
        let linked = fs.link(MOTD, ROOT_INO, b"motd2").unwrap();
        assert_eq!(linked.ino, MOTD);
        assert_eq!(linked.nlink, 2);
        assert_eq!(fs.lookup(ROOT_INO, b"motd2").unwrap().ino, MOTD);
        fs.write(MOTD, 0, b"HELLO").unwrap();
        let via_link = fs.lookup(ROOT_INO, b"motd2").unwrap();
        assert_eq!(fs.read(via_link.ino, 0, 5).unwrap(), b"HELLO");
        fs.unlink(ETC, b"motd").unwrap();
        assert_eq!(fs.getattr(MOTD).unwrap().nlink, 1);
        // directories cannot be hard-linked
        assert!(matches!(
            fs.link(ETC, ROOT_INO, b"etc2"),
            Err(Error::WrongType)
        ));
    }

    #[test]
    fn symlink_stores_its_target_in_the_body() {
        let mut fs = demo_fs();
        let sl = fs.symlink(ROOT_INO, b"motd-link", b"/etc/motd").unwrap();
        assert_eq!(sl.kind, FileType::Symlink);
        assert_eq!(sl.size, 9);
        assert_eq!(fs.readlink(sl.ino).unwrap(), b"/etc/motd");
        assert!(matches!(fs.readlink(MOTD), Err(Error::WrongType)));
    }

    #[test]
    fn rename_moves_an_entry() {
        let mut fs = demo_fs();
        fs.rename(ETC, b"motd", VAR, b"notice").unwrap();
        assert!(matches!(fs.lookup(ETC, b"motd"), Err(Error::NotFound)));
        let moved = fs.lookup(VAR, b"notice").unwrap();
        assert_eq!(moved.ino, MOTD);
        assert_eq!(moved.nlink, 1);
        assert_eq!(fs.read(MOTD, 0, 1024).unwrap(), b"hello, world!\n");
    }

    #[test]
    fn rename_replaces_the_destination() {
        let mut fs = demo_fs();
        let old = fs.create(ETC, b"victim", 0o644).unwrap();
        fs.write(old.ino, 0, b"doomed").unwrap();
        fs.rename(ETC, b"motd", ETC, b"victim").unwrap();
        let now = fs.lookup(ETC, b"victim").unwrap();
        assert_eq!(now.ino, MOTD);
        assert!(matches!(fs.getattr(old.ino), Err(Error::NotFound)));
        assert_disjoint_chains(&fs);
    }

    #[test]
    fn renamed_directory_follows_its_parent() {
        let mut fs = demo_fs();
        let sub = fs.mkdir(ETC, b"sub", 0o755).unwrap();
        assert_eq!(fs.getattr(ETC).unwrap().nlink, 3);
        fs.rename(ETC, b"sub", VAR, b"sub").unwrap();
        assert_eq!(fs.getattr(ETC).unwrap().nlink, 2);
        assert_eq!(fs.getattr(VAR).unwrap().nlink, 3);
        assert_eq!(fs.getattr(sub.ino).unwrap().nlink, 2);
        // `..` inside the moved directory now names the new parent
        assert_eq!(fs.lookup(sub.ino, b"..").unwrap().ino, VAR);
    }

    #[test]
    fn rmdir_refuses_non_empty_directories() {
        let mut fs = demo_fs();
        assert!(matches!(fs.rmdir(ROOT_INO, b"etc"), Err(Error::NotEmpty)));
        assert!(matches!(fs.rmdir(ETC, b"motd"), Err(Error::WrongType)));
        fs.unlink(ETC, b"motd").unwrap();
        fs.rmdir(ROOT_INO, b"etc").unwrap();
        assert!(matches!(fs.lookup(ROOT_INO, b"etc"), Err(Error::NotFound)));
        assert_eq!(fs.getattr(ROOT_INO).unwrap().nlink, 3);
        assert_disjoint_chains(&fs);
    }

    #[test]
    fn type_checks_guard_the_facade() {
        let mut fs = demo_fs();
        assert!(matches!(fs.readdir(MOTD), Err(Error::WrongType)));
        assert!(matches!(fs.read(ETC, 0, 16), Err(Error::WrongType)));
        assert!(matches!(fs.write(ETC, 0, b"x"), Err(Error::WrongType)));
        assert!(matches!(fs.truncate(ETC, 0), Err(Error::WrongType)));
        assert!(matches!(fs.unlink(ROOT_INO, b"etc"), Err(Error::WrongType)));
    }

    #[test]
    fn setattr_applies_selected_fields() {
        let mut fs = demo_fs();
        let stat = fs
            .setattr(
                MOTD,
                SetAttr {
                    perm: Some(0o600),
                    uid: Some(7),
                    gid: Some(8),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(stat.perm, 0o600);
        assert_eq!(stat.uid, 7);
        assert_eq!(stat.gid, 8);
        assert_eq!(stat.kind, FileType::Regular);
        let shrunk = fs
            .setattr(
                MOTD,
                SetAttr {
                    size: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(shrunk.size, 5);
        assert_eq!(fs.read(MOTD, 0, 64).unwrap(), b"hello");
    }

    #[test]
    fn mutations_survive_a_reopen() {
        let file = tempfile::tempfile().unwrap();
        let mut b = ImageBuilder::new(360 * 1024).unwrap();
        let root = b.root();
        let motd = b.create(root, b"motd").unwrap();
        b.append(motd, b"hello, world!\n").unwrap();
        b.build(file.try_clone().unwrap()).unwrap();
        {
            let mut fs = Filesystem::open(file.try_clone().unwrap()).unwrap();
            fs.write(2, 0, b"WEELP").unwrap();
            fs.create(ROOT_INO, b"new", 0o600).unwrap();
        }
        // everything was written through; a fresh open sees it all
        let mut fs = Filesystem::open(file).unwrap();
        assert_eq!(fs.read(2, 0, 64).unwrap(), b"WEELP, world!\n");
        let new = fs.lookup(ROOT_INO, b"new").unwrap();
        assert_eq!(new.perm, 0o600);
        assert_eq!(new.size, 0);
    }

    #[test]
    fn statfs_reports_real_counts() {
        let fs = demo_fs();
        let stats = fs.statfs();
        assert_eq!(stats.bsize, 512);
        assert_eq!(stats.blocks, 648);
        // root, etc, var, motd each hold one sector; big holds three
        assert_eq!(stats.bfree, 648 - 7);
        assert_eq!(stats.files, 1040);
        assert_eq!(stats.ffree, 1040 - 5);
        assert_eq!(stats.namelen, 28);
    }
}
