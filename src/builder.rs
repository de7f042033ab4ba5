//! One-shot construction of a fresh, formatted image from an in-memory
//! file tree.
//!
//! The builder accumulates regular files, directories and symlinks in
//! memory, then dumps the whole tree at once: nodes become inodes in
//! creation order and their contents are packed into sequentially
//! allocated data sectors.

use crate::dir::{check_name, DirEntry};
use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::imap;
use crate::inode::{FileType, Inode, INODE_SIZE};
use crate::superblock::{Geometry, DEFAULT_IFACTOR, DEFAULT_SECTOR_SIZE, IMAP_ENTRY_SIZE};
use crate::util::timestamp_secs;
use log::debug;
use std::fs::File;

/// Handle to a node of the in-memory tree.
pub type NodeId = usize;

struct Node {
    mode: u16,
    links: u16,
    uid: u32,
    gid: u32,
    content: Content,
}

enum Content {
    Regular(Vec<u8>),
    Directory(Vec<(Vec<u8>, NodeId)>),
    Symlink(Vec<u8>),
}

impl Node {
    fn new(kind: FileType, perm: u16, content: Content) -> Self {
        Self {
            mode: Inode::mode_bits(kind, perm),
            links: 0,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            content,
        }
    }

    /// The node's contents in on-disk form.
    fn encode_content(&self) -> Result<Vec<u8>> {
        match &self.content {
            Content::Regular(data) | Content::Symlink(data) => Ok(data.clone()),
            Content::Directory(entries) => {
                let mut sorted: Vec<_> = entries.clone();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                let mut data = Vec::with_capacity(sorted.len() * 32);
                for (name, id) in sorted {
                    let ent = DirEntry {
                        inumber: id as u32,
                        name,
                    };
                    data.extend_from_slice(&ent.encode()?);
                }
                Ok(data)
            }
        }
    }
}

/// Builds a fresh image around a tree assembled in memory.
pub struct ImageBuilder {
    geometry: Geometry,
    nodes: Vec<Node>,
    timestamp: u32,
}

impl ImageBuilder {
    /// Creates a builder for an image of `capacity` bytes with the default
    /// sector size and overhead factor.
    pub fn new(capacity: u64) -> Result<Self> {
        Self::with_geometry(capacity, DEFAULT_SECTOR_SIZE, DEFAULT_IFACTOR)
    }

    /// Creates a builder with an explicit sector size and overhead factor.
    pub fn with_geometry(capacity: u64, ssize: u32, ifactor: f64) -> Result<Self> {
        let geometry = Geometry::compute(capacity, ssize, ifactor)?;
        let mut root = Node::new(
            FileType::Directory,
            0o755,
            Content::Directory(vec![(b".".to_vec(), 0), (b"..".to_vec(), 0)]),
        );
        // both of the root's dot entries name the root itself
        root.links = 2;
        Ok(Self {
            geometry,
            nodes: vec![root],
            timestamp: timestamp_secs(),
        })
    }

    /// The root directory of the tree.
    pub fn root(&self) -> NodeId {
        0
    }

    /// The computed layout of the image under construction.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Creates an empty regular file named `name` under `parent`.
    pub fn create(&mut self, parent: NodeId, name: &[u8]) -> Result<NodeId> {
        let node = Node::new(FileType::Regular, 0o644, Content::Regular(Vec::new()));
        self.attach(parent, name, node)
    }

    /// Creates a directory named `name` under `parent`.
    pub fn mkdir(&mut self, parent: NodeId, name: &[u8]) -> Result<NodeId> {
        let id = self.nodes.len();
        let node = Node::new(
            FileType::Directory,
            0o755,
            Content::Directory(vec![(b".".to_vec(), id), (b"..".to_vec(), parent)]),
        );
        let id = self.attach(parent, name, node)?;
        // the self entry, plus the `..` referencing the parent
        self.nodes[id].links += 1;
        self.nodes[parent].links += 1;
        Ok(id)
    }

    /// Creates a symlink named `name` under `parent`, pointing at `target`.
    pub fn symlink(&mut self, parent: NodeId, name: &[u8], target: &[u8]) -> Result<NodeId> {
        let node = Node::new(FileType::Symlink, 0o777, Content::Symlink(target.to_vec()));
        self.attach(parent, name, node)
    }

    /// Appends `data` to the regular file `file`.
    pub fn append(&mut self, file: NodeId, data: &[u8]) -> Result<()> {
        match &mut self.nodes.get_mut(file).ok_or(Error::NotFound)?.content {
            Content::Regular(contents) => {
                contents.extend_from_slice(data);
                Ok(())
            }
            _ => Err(Error::WrongType),
        }
    }

    /// Replaces the permission bits of `node`.
    pub fn chmod(&mut self, node: NodeId, perm: u16) -> Result<()> {
        let node = self.nodes.get_mut(node).ok_or(Error::NotFound)?;
        node.mode = (node.mode & 0xf000) | (perm & 0o7777);
        Ok(())
    }

    /// Replaces the owner of `node`.
    pub fn chown(&mut self, node: NodeId, uid: u32, gid: u32) -> Result<()> {
        let node = self.nodes.get_mut(node).ok_or(Error::NotFound)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    /// Adds `node` to the tree under `parent`. An existing entry with the
    /// same name is replaced.
    fn attach(&mut self, parent: NodeId, name: &[u8], node: Node) -> Result<NodeId> {
        check_name(name)?;
        if name.is_empty() || name == b"." || name == b".." {
            return Err(Error::NameTooLong);
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        let entries = match &mut self.nodes.get_mut(parent).ok_or(Error::NotFound)?.content {
            Content::Directory(entries) => entries,
            _ => return Err(Error::WrongType),
        };
        let replaced = match entries.iter_mut().find(|(n, _)| n.as_slice() == name) {
            Some(entry) => {
                let old = entry.1;
                entry.1 = id;
                Some(old)
            }
            None => {
                entries.push((name.to_vec(), id));
                None
            }
        };
        if let Some(old) = replaced {
            self.nodes[old].links -= 1;
        }
        self.nodes[id].links += 1;
        Ok(id)
    }

    /// Sectors needed to hold `len` bytes of content. Every node owns at
    /// least one sector, even when empty.
    fn sectors_for(&self, len: usize) -> u64 {
        (len as u64).div_ceil(self.geometry.ssize as u64).max(1)
    }

    /// Formats `file` and dumps the tree into it.
    pub fn build(&self, file: File) -> Result<()> {
        let sb = self.geometry.superblock();
        if self.nodes.len() as u64 > sb.inode_count() as u64 {
            return Err(Error::NoInodes);
        }
        let mut total = 0u64;
        let mut sized = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let data = node.encode_content()?;
            if data.len() as u64 > u32::MAX as u64 {
                return Err(Error::NoSpace);
            }
            total += self.sectors_for(data.len());
            sized.push(data);
        }
        if total > sb.data_sectors() as u64 {
            return Err(Error::NoSpace);
        }
        let mut store = ImageStore::format(file, &self.geometry)?;
        let mut next = 0u32;
        for (i, (node, data)) in self.nodes.iter().zip(&sized).enumerate() {
            let fip = dump_data(&mut store, &mut next, data)?;
            let inode = Inode {
                mode: node.mode,
                links: node.links,
                uid: node.uid,
                gid: node.gid,
                ctime: self.timestamp,
                mtime: self.timestamp,
                atime: self.timestamp,
                size: data.len() as u32,
                fip,
            };
            let offset = sb.ilist_offset() + i as u64 * INODE_SIZE as u64;
            store.write_at(offset, &inode.encode())?;
            debug!(
                "dumped inode {i} ({} bytes starting at data sector {fip})",
                data.len()
            );
        }
        Ok(())
    }
}

/// Writes `data` into sequentially allocated data sectors, chaining them
/// in the sector map, and returns the first sector of the chain.
fn dump_data(store: &mut ImageStore, next: &mut u32, data: &[u8]) -> Result<u32> {
    let sb = *store.superblock();
    let ssize = sb.ssize as usize;
    let nsec = (data.len().div_ceil(ssize)).max(1) as u32;
    let first = *next;
    for k in 0..nsec {
        let s = first + k;
        let mut sector = vec![0; ssize];
        let lo = k as usize * ssize;
        if lo < data.len() {
            let hi = (lo + ssize).min(data.len());
            sector[..hi - lo].copy_from_slice(&data[lo..hi]);
        }
        store.write_data_sector(s, &sector)?;
        let entry = if k + 1 < nsec {
            (s + 1) as i32
        } else {
            imap::EOF
        };
        let offset = sb.imap_offset() + s as u64 * IMAP_ENTRY_SIZE as u64;
        store.write_at(offset, &entry.to_be_bytes())?;
    }
    *next += nsec;
    Ok(first)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::imap::Imap;
    use crate::inode::InodeTable;

    fn demo() -> (File, ImageBuilder) {
        let file = tempfile::tempfile().unwrap();
        let mut b = ImageBuilder::new(360 * 1024).unwrap();
        let root = b.root();
        let etc = b.mkdir(root, b"etc").unwrap();
        let motd = b.create(etc, b"motd").unwrap();
        b.append(motd, b"hello, world!\n").unwrap();
        let var = b.mkdir(root, b"var").unwrap();
        let big = b.create(var, b"big").unwrap();
        b.append(big, &[b'A'; 1337]).unwrap();
        (file, b)
    }

    #[test]
    fn demo_tree_dump() {
        let (file, b) = demo();
        b.build(file.try_clone().unwrap()).unwrap();
        let mut store = ImageStore::open(file).unwrap();
        let sb = *store.superblock();
        assert_eq!(sb.nsectors, 720);
        assert_eq!(sb.dpool_p, 72);
        let itable = InodeTable::load(&mut store).unwrap();
        assert_eq!(itable.len() - itable.free_count(), 5);
        // root, etc, var and motd take one sector each, big takes three
        let imap = Imap::load(&mut store).unwrap();
        assert_eq!(imap.free_count(), 648 - 7);
        // creation order fixes the inode numbering
        let motd = itable.get(2).unwrap();
        assert_eq!(motd.size, 14);
        assert_eq!(motd.links, 1);
        let big = itable.get(4).unwrap();
        assert_eq!(big.size, 1337);
    }

    #[test]
    fn directory_entries_are_sorted() {
        let file = tempfile::tempfile().unwrap();
        let mut b = ImageBuilder::new(360 * 1024).unwrap();
        let root = b.root();
        b.create(root, b"zeta").unwrap();
        b.create(root, b"alpha").unwrap();
        b.build(file.try_clone().unwrap()).unwrap();
        let mut store = ImageStore::open(file).unwrap();
        let root_sector = store.read_data_sector(0).unwrap();
        let names: Vec<_> = root_sector
            .chunks_exact(32)
            .take(4)
            .map(|chunk| DirEntry::decode(chunk).unwrap().name)
            .collect();
        assert_eq!(
            names,
            vec![
                b".".to_vec(),
                b"..".to_vec(),
                b"alpha".to_vec(),
                b"zeta".to_vec()
            ]
        );
    }

    #[test]
    fn empty_file_still_owns_a_sector() {
        let file = tempfile::tempfile().unwrap();
        let mut b = ImageBuilder::new(360 * 1024).unwrap();
        let root = b.root();
        b.create(root, b"empty").unwrap();
        b.build(file.try_clone().unwrap()).unwrap();
        let mut store = ImageStore::open(file).unwrap();
        let itable = InodeTable::load(&mut store).unwrap();
        let imap = Imap::load(&mut store).unwrap();
        let inode = itable.get(1).unwrap();
        assert_eq!(inode.size, 0);
        assert_eq!(imap.next(inode.fip).unwrap(), imap::EOF);
        assert_eq!(imap.free_count(), 648 - 2);
    }

    #[test]
    fn link_counts_in_the_dumped_tree() {
        let (file, b) = demo();
        b.build(file.try_clone().unwrap()).unwrap();
        let mut store = ImageStore::open(file).unwrap();
        let itable = InodeTable::load(&mut store).unwrap();
        // root: `.`, `..` and one `..` per subdirectory
        assert_eq!(itable.get(0).unwrap().links, 4);
        assert_eq!(itable.get(1).unwrap().links, 2);
        assert_eq!(itable.get(2).unwrap().links, 1);
    }

    #[test]
    fn overfull_trees_are_rejected() {
        // 16 KiB => 32 sectors: 28 data sectors, 32 inode records
        let mut b = ImageBuilder::new(16 * 1024).unwrap();
        let root = b.root();
        for i in 0..29 {
            let name = format!("f{i:02}");
            b.create(root, name.as_bytes()).unwrap();
        }
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(b.build(file), Err(Error::NoSpace)));
    }

    #[test]
    fn symlink_nodes_carry_their_target() {
        let file = tempfile::tempfile().unwrap();
        let mut b = ImageBuilder::new(360 * 1024).unwrap();
        let root = b.root();
        b.symlink(root, b"link", b"/somewhere/else").unwrap();
        b.build(file.try_clone().unwrap()).unwrap();
        let mut fs = crate::fs::Filesystem::open(file).unwrap();
        let stat = fs.lookup(crate::fs::ROOT_INO, b"link").unwrap();
        assert_eq!(stat.kind, FileType::Symlink);
        assert_eq!(fs.readlink(stat.ino).unwrap(), b"/somewhere/else");
    }
}
