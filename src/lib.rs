//! LARDFS: a small Unix-style filesystem kept in a single image file.
//!
//! The image is split into four contiguous, sector-aligned regions:
//!
//! ```text
//! [ superblock | inode table | sector map | data pool ]
//! ```
//!
//! Each file's contents live in a chain of data sectors linked through the
//! sector map and rooted at the inode's first-sector field. All on-disk
//! integers are big-endian.
//!
//! The crate exposes the live engine through [`fs::Filesystem`], a FUSE
//! adapter over it in [`fuse`], and a one-shot image builder in
//! [`builder`].

pub mod builder;
pub mod dir;
pub mod error;
mod file;
pub mod fs;
pub mod fuse;
pub mod imap;
pub mod image;
pub mod inode;
pub mod superblock;
pub mod util;

pub use error::{Error, Result};
pub use fs::Filesystem;
