//! The FUSE adapter: kernel callbacks translated into core operations.
//!
//! This layer owns no filesystem state. It converts names, offsets and
//! attributes between the kernel's view and the core's, and maps core
//! error kinds onto errnos.

use crate::error::Error;
use crate::fs::{Filesystem, SetAttr, Stat};
use crate::inode::FileType;
use fuser::{
    FileAttr, FileType as FuseFileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use log::debug;
use std::ffi::{c_int, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long the kernel may cache entries and attributes.
const TTL: Duration = Duration::from_secs(1);

/// Translates a core error into an errno.
fn errno(err: &Error) -> c_int {
    match err {
        Error::NotFound => libc::ENOENT,
        Error::NameTooLong => libc::ENAMETOOLONG,
        Error::NoInodes | Error::NoSpace => libc::ENOSPC,
        Error::NotEmpty => libc::ENOTEMPTY,
        Error::BadOffset => libc::EINVAL,
        Error::Corrupt => libc::EIO,
        Error::WrongType => libc::ENOTDIR,
        Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Like [`errno`], but for operations where a directory target means
/// `EISDIR` rather than `ENOTDIR`.
fn errno_data(err: &Error) -> c_int {
    match err {
        Error::WrongType => libc::EISDIR,
        other => errno(other),
    }
}

fn systime(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}

fn time_secs(t: TimeOrNow) -> u32 {
    match t {
        TimeOrNow::SpecificTime(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
            .unwrap_or(0),
        TimeOrNow::Now => crate::util::timestamp_secs(),
    }
}

fn attr(stat: &Stat) -> FileAttr {
    FileAttr {
        ino: stat.ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: systime(stat.atime),
        mtime: systime(stat.mtime),
        ctime: systime(stat.ctime),
        crtime: systime(stat.ctime),
        kind: match stat.kind {
            FileType::Regular => FuseFileType::RegularFile,
            FileType::Directory => FuseFileType::Directory,
            FileType::Symlink => FuseFileType::Symlink,
        },
        perm: stat.perm,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: stat.blksize,
        flags: 0,
    }
}

/// The mounted filesystem, as seen by the FUSE session.
pub struct LardFuse {
    fs: Filesystem,
}

impl LardFuse {
    pub fn new(fs: Filesystem) -> Self {
        Self { fs }
    }
}

impl fuser::Filesystem for LardFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.fs.lookup(parent, name.as_bytes()) {
            Ok(stat) => reply.entry(&TTL, &attr(&stat), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(stat) => reply.attr(&TTL, &attr(&stat)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let set = SetAttr {
            perm: mode.map(|m| (m & 0o7777) as u16),
            uid,
            gid,
            size,
            atime: atime.map(time_secs),
            mtime: mtime.map(time_secs),
        };
        match self.fs.setattr(ino, set) {
            Ok(stat) => reply.attr(&TTL, &attr(&stat)),
            Err(e) => reply.error(errno_data(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(Error::WrongType) => reply.error(libc::EINVAL),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.fs.mkdir(parent, name.as_bytes(), (mode & 0o7777) as u16) {
            Ok(stat) => reply.entry(&TTL, &attr(&stat), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.unlink(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_data(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.rmdir(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        match self
            .fs
            .symlink(parent, name.as_bytes(), link.as_os_str().as_bytes())
        {
            Ok(stat) => reply.entry(&TTL, &attr(&stat), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE and friends are not supported
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .fs
            .rename(parent, name.as_bytes(), newparent, newname.as_bytes())
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.fs.link(ino, newparent, newname.as_bytes()) {
            Ok(stat) => reply.entry(&TTL, &attr(&stat), 0),
            Err(Error::WrongType) => reply.error(libc::EPERM),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open {ino}");
        match self.fs.open_file(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.read(ino, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_data(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write {ino} ({} bytes at {offset})", data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.write(ino, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno_data(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // all writes go straight through to the image
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.open_file(ino, 0) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.fs.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            let kind = match kind {
                FileType::Regular => FuseFileType::RegularFile,
                FileType::Directory => FuseFileType::Directory,
                FileType::Symlink => FuseFileType::Symlink,
            };
            if reply.add(ino, (i + 1) as i64, kind, OsStr::from_bytes(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bavail,
            stats.files,
            stats.ffree,
            stats.bsize,
            stats.namelen,
            stats.bsize,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.fs.create(parent, name.as_bytes(), (mode & 0o7777) as u16) {
            Ok(stat) => reply.created(&TTL, &attr(&stat), 0, 0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }
}
