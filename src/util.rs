//! Utility helpers shared by the core and the command-line tools.

use std::fmt;
use std::process::exit;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock panic!")
}

/// Returns the current timestamp in whole seconds, clamped to what an inode
/// timestamp field can hold.
pub fn timestamp_secs() -> u32 {
    get_timestamp().as_secs().min(u32::MAX as u64) as u32
}

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}
