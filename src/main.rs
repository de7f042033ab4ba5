//! The `lardfs` command mounts a LARDFS image through FUSE.

use fuser::MountOption;
use lardfs::fuse::LardFuse;
use lardfs::util::error;
use lardfs::Filesystem;
use log::{debug, LevelFilter};
use std::env;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// If true, log every operation.
    debug: bool,
    /// The path to the image file.
    image: Option<PathBuf>,
    /// Where to mount the filesystem.
    mountpoint: Option<PathBuf>,
}

fn parse_args<A: Iterator<Item = OsString>>(args: A) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-d" | "--debug") => res.debug = true,
            _ if res.image.is_none() => res.image = Some(PathBuf::from(arg)),
            _ if res.mountpoint.is_none() => res.mountpoint = Some(PathBuf::from(arg)),
            _ => error("lardfs", "too many arguments"),
        }
    }
    res
}

/// Prints the command's usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" lardfs [-d] <image> <mountpoint>");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h, --help:\tprints usage");
    eprintln!(" -d, --debug:\tlogs every filesystem operation");
    eprintln!(" image:\t\tthe LARD-formatted disk image file");
    eprintln!(" mountpoint:\twhere to mount the filesystem");
}

fn main() {
    let args = parse_args(env::args_os().skip(1));
    if args.help {
        print_usage();
        exit(0);
    }
    env_logger::Builder::new()
        .filter_level(if args.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();
    let (Some(image), Some(mountpoint)) = (args.image, args.mountpoint) else {
        print_usage();
        exit(1);
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&image)
        .unwrap_or_else(|e| {
            error("lardfs", format_args!("{}: {e}", image.display()));
        });
    let fs = Filesystem::open(file).unwrap_or_else(|e| {
        error("lardfs", format_args!("{}: {e}", image.display()));
    });
    debug!("mounting {} on {}", image.display(), mountpoint.display());
    let options = [MountOption::FSName("lardfs".to_string())];
    fuser::mount2(LardFuse::new(fs), &mountpoint, &options).unwrap_or_else(|e| {
        error("lardfs", format_args!("{}: {e}", mountpoint.display()));
    });
}
