//! The `mklardfs` tool creates a fresh LARDFS image, optionally populated
//! from a host directory tree.

use lardfs::builder::{ImageBuilder, NodeId};
use lardfs::superblock::{DEFAULT_IFACTOR, DEFAULT_SECTOR_SIZE};
use lardfs::util::error;
use log::warn;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The sector size in bytes.
    ssize: Option<u32>,
    /// The fraction of the image reserved for metadata.
    ifactor: Option<f64>,
    /// A host directory to copy into the image's root.
    root_dir: Option<PathBuf>,
    /// The image capacity in bytes.
    capacity: Option<u64>,
    /// The path to the output image file.
    output: Option<PathBuf>,
}

/// Parses a size argument with an optional `K`, `M` or `G` suffix.
fn parse_size(s: &str) -> Option<u64> {
    let (digits, shift) = match s.as_bytes().last()? {
        b'K' | b'k' => (&s[..s.len() - 1], 10),
        b'M' | b'm' => (&s[..s.len() - 1], 20),
        b'G' | b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: u64 = digits.parse().ok()?;
    n.checked_shl(shift)
}

fn parse_args<A: Iterator<Item = OsString>>(mut args: A) -> Args {
    let mut res: Args = Default::default();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some(opt @ ("-s" | "--sector-size")) => {
                let val = expect_value(&mut args, opt);
                res.ssize = Some(val.parse().unwrap_or_else(|_| {
                    error("mklardfs", format_args!("invalid sector size `{val}`"));
                }));
            }
            Some(opt @ ("-i" | "--ifactor")) => {
                let val = expect_value(&mut args, opt);
                res.ifactor = Some(val.parse().unwrap_or_else(|_| {
                    error("mklardfs", format_args!("invalid ifactor `{val}`"));
                }));
            }
            Some(opt @ ("-d" | "--root-dir")) => {
                let val = args.next().unwrap_or_else(|| {
                    error("mklardfs", format_args!("missing value for `{opt}`"));
                });
                res.root_dir = Some(PathBuf::from(val));
            }
            Some(s) if res.capacity.is_none() => {
                res.capacity = Some(parse_size(s).unwrap_or_else(|| {
                    error("mklardfs", format_args!("invalid capacity `{s}`"));
                }));
            }
            _ if res.output.is_none() => res.output = Some(PathBuf::from(arg)),
            _ => error("mklardfs", "too many arguments"),
        }
    }
    res
}

fn expect_value<A: Iterator<Item = OsString>>(args: &mut A, opt: &str) -> String {
    args.next()
        .and_then(|v| v.into_string().ok())
        .unwrap_or_else(|| {
            error("mklardfs", format_args!("missing value for `{opt}`"));
        })
}

/// Prints the command's usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" mklardfs [-s ssize] [-i ifactor] [-d dir] <capacity> <image>");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h, --help:\t\tprints usage");
    eprintln!(" -s, --sector-size:\tsector size in bytes (default 512)");
    eprintln!(" -i, --ifactor:\t\tfraction of the image reserved for metadata (default 0.1)");
    eprintln!(" -d, --root-dir:\tdirectory tree to copy into the image's root");
    eprintln!(" capacity:\t\timage size in bytes, with an optional K/M/G suffix");
    eprintln!(" image:\t\t\tpath to the image file to create");
}

/// Recursively copies the contents of the host directory `dir` into the
/// tree under `parent`. Entries that are neither regular files, symlinks
/// nor directories are skipped.
fn ingest(builder: &mut ImageBuilder, dir: &Path, parent: NodeId) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let meta = fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();
        let res = if file_type.is_symlink() {
            let target = fs::read_link(&path)?;
            builder.symlink(parent, name.as_bytes(), target.as_os_str().as_bytes())
        } else if file_type.is_dir() {
            builder.mkdir(parent, name.as_bytes())
        } else if file_type.is_file() {
            let data = fs::read(&path)?;
            builder.create(parent, name.as_bytes()).and_then(|node| {
                builder.append(node, &data)?;
                Ok(node)
            })
        } else {
            warn!("{}: unsupported file type, skipped", path.display());
            continue;
        };
        let node = res
            .and_then(|node| {
                builder.chmod(node, (meta.permissions().mode() & 0o7777) as u16)?;
                builder.chown(node, meta.uid(), meta.gid())?;
                Ok(node)
            })
            .unwrap_or_else(|e| {
                error("mklardfs", format_args!("{}: {e}", path.display()));
            });
        if file_type.is_dir() {
            ingest(builder, &path, node)?;
        }
    }
    Ok(())
}

fn main() {
    let args = parse_args(env::args_os().skip(1));
    if args.help {
        print_usage();
        exit(0);
    }
    env_logger::init();
    let (Some(capacity), Some(output)) = (args.capacity, args.output) else {
        print_usage();
        exit(1);
    };
    let ssize = args.ssize.unwrap_or(DEFAULT_SECTOR_SIZE);
    let ifactor = args.ifactor.unwrap_or(DEFAULT_IFACTOR);
    let mut builder = ImageBuilder::with_geometry(capacity, ssize, ifactor).unwrap_or_else(|e| {
        error("mklardfs", e);
    });
    if let Some(dir) = &args.root_dir {
        let root = builder.root();
        ingest(&mut builder, dir, root).unwrap_or_else(|e| {
            error("mklardfs", format_args!("{}: {e}", dir.display()));
        });
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&output)
        .unwrap_or_else(|e| {
            error("mklardfs", format_args!("{}: {e}", output.display()));
        });
    builder.build(file).unwrap_or_else(|e| {
        error("mklardfs", format_args!("failed to create filesystem: {e}"));
    });
    let geo = builder.geometry();
    println!(
        "{}: {} sectors of {} bytes ({} data sectors)",
        output.display(),
        geo.nsectors,
        geo.ssize,
        geo.nsectors - geo.data_start
    );
}
