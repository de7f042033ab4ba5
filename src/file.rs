//! The file engine: reading, writing and truncating content chains.

use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::imap;
use crate::inode::Inode;
use crate::util::timestamp_secs;
use log::debug;
use std::cmp::Ordering;

impl Filesystem {
    /// Collects the data-sector chain of inode `n`, in order.
    ///
    /// The walk starts at the inode's first sector and follows the sector
    /// map until the end-of-chain tag. Reaching a free sector, leaving the
    /// data pool or looping is a corruption.
    pub(crate) fn chain(&self, n: u32) -> Result<Vec<u32>> {
        let inode = self.itable.get(n)?;
        let mut sectors = Vec::new();
        let mut cur = inode.fip;
        loop {
            if cur >= self.imap.len() || sectors.len() >= self.imap.len() as usize {
                return Err(Error::Corrupt);
            }
            sectors.push(cur);
            match self.imap.next(cur)? {
                imap::EOF => break,
                imap::FREE => return Err(Error::Corrupt),
                next if next >= 0 => cur = next as u32,
                _ => return Err(Error::Corrupt),
            }
        }
        Ok(sectors)
    }

    /// Reads the whole content of inode `n`, truncated to its size.
    pub(crate) fn read_file(&mut self, n: u32) -> Result<Vec<u8>> {
        let size = self.itable.get(n)?.size as usize;
        let chain = self.chain(n)?;
        let ssize = self.store.superblock().ssize as usize;
        let mut data = Vec::with_capacity(chain.len() * ssize);
        for s in chain {
            data.extend_from_slice(&self.store.read_data_sector(s)?);
        }
        data.truncate(size);
        Ok(data)
    }

    /// Writes `buf` into inode `n` at byte `offset`.
    ///
    /// Writing may start anywhere up to and including the current end of
    /// the file; holes are not supported. When the write reaches past the
    /// end, the size is persisted before any sector is touched, and the
    /// chain is extended sector by sector, each new tail linked into the
    /// map before its bytes arrive.
    pub(crate) fn write_file(&mut self, n: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let ssize = self.store.superblock().ssize as usize;
        let mut inode = *self.itable.get(n)?;
        if offset > inode.size {
            return Err(Error::BadOffset);
        }
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset as u64 + buf.len() as u64;
        if end > u32::MAX as u64 {
            return Err(Error::NoSpace);
        }
        let end = end as u32;
        let grew = end > inode.size;
        if grew {
            inode.size = end;
            inode.ctime = timestamp_secs();
            self.itable.put(&mut self.store, n, inode)?;
        }
        let mut chain = self.chain(n)?;
        let needed = (end as u64).div_ceil(ssize as u64).max(1) as usize;
        while chain.len() < needed {
            let s = self.imap.alloc(&mut self.store)?;
            let tail = *chain.last().ok_or(Error::Corrupt)?;
            self.imap.link(&mut self.store, tail, s as i32)?;
            chain.push(s);
            debug!("inode {n}: chain extended with sector {s}");
        }
        let mut done = 0;
        while done < buf.len() {
            let pos = offset as usize + done;
            let sector = chain[pos / ssize];
            let off_in = pos % ssize;
            let take = (ssize - off_in).min(buf.len() - done);
            if take == ssize {
                self.store.write_data_sector(sector, &buf[done..done + take])?;
            } else {
                // partial sector at either end of the span
                let mut contents = self.store.read_data_sector(sector)?;
                contents[off_in..off_in + take].copy_from_slice(&buf[done..done + take]);
                self.store.write_data_sector(sector, &contents)?;
            }
            done += take;
        }
        inode.mtime = timestamp_secs();
        self.itable.put(&mut self.store, n, inode)
    }

    /// Truncates inode `n` to `new_size` bytes.
    ///
    /// Shrinking frees the chain past the new end and zeroes the tail of
    /// the new last sector; growing zero-fills through the write path. A
    /// file keeps at least one sector, so truncating to zero leaves the
    /// first sector in place as an empty end of chain.
    pub(crate) fn truncate_file(&mut self, n: u32, new_size: u32) -> Result<()> {
        let ssize = self.store.superblock().ssize as u32;
        let mut inode = *self.itable.get(n)?;
        match new_size.cmp(&inode.size) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => {
                let fill = vec![0; (new_size - inode.size) as usize];
                self.write_file(n, inode.size, &fill)
            }
            Ordering::Less => {
                let chain = self.chain(n)?;
                let kept = new_size.div_ceil(ssize).max(1) as usize;
                let tail = *chain.get(kept - 1).ok_or(Error::Corrupt)?;
                self.imap.link(&mut self.store, tail, imap::EOF)?;
                for &s in &chain[kept..] {
                    self.imap.free(&mut self.store, s)?;
                }
                let keep_bytes = (new_size - (kept as u32 - 1) * ssize) as usize;
                if keep_bytes < ssize as usize {
                    let mut contents = self.store.read_data_sector(tail)?;
                    contents[keep_bytes..].fill(0);
                    self.store.write_data_sector(tail, &contents)?;
                }
                let now = timestamp_secs();
                inode.size = new_size;
                inode.mtime = now;
                inode.ctime = now;
                self.itable.put(&mut self.store, n, inode)?;
                debug!("inode {n}: truncated to {new_size} ({kept} sectors kept)");
                Ok(())
            }
        }
    }

    /// Frees every chain sector of inode `n`, then clears the record.
    pub(crate) fn wipe(&mut self, n: u32) -> Result<()> {
        let chain = self.chain(n)?;
        for &s in &chain {
            self.imap.free(&mut self.store, s)?;
        }
        self.itable.put(&mut self.store, n, Inode::FREE)?;
        debug!("inode {n}: wiped, {} sectors freed", chain.len());
        Ok(())
    }
}
