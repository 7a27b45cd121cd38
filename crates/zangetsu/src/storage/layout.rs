//! Directory layout and low-level file helpers.
//!
//! ```text
//! <db>/<group>/<day>/data
//! ```
//!
//! `<day>` is `floor(unix_seconds / 86400)` in decimal without leading zeros.
//! Directory names starting with `.` are hidden (pending deletion) and are
//! skipped by scans.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Seconds per day partition.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Name of the data file inside a partition directory.
pub const DATA_FILE_NAME: &str = "data";

/// Prefix given to directories renamed away for deletion.
pub const HIDDEN_PREFIX: &str = "._";

const MAX_HIDDEN_RENAME_ATTEMPTS: u32 = 1000;

/// Converts a Unix timestamp in seconds to its day timestamp.
pub fn day_of(unix_seconds: u64) -> u64 {
    unix_seconds / SECONDS_PER_DAY
}

/// Returns the first Unix second of a day timestamp.
pub fn day_start(day: u64) -> u64 {
    day * SECONDS_PER_DAY
}

/// Parses a partition directory name.
///
/// Only canonical decimal renderings are accepted, so `"018000"` and
/// `"18000.0"` are rejected.
pub fn parse_day_dir(name: &str) -> Option<u64> {
    let day: u64 = name.parse().ok()?;
    if day.to_string() == name {
        Some(day)
    } else {
        None
    }
}

/// Whether a directory entry is hidden and must be skipped by scans.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Path of a group directory.
pub fn group_dir(root: &Path, group: &str) -> PathBuf {
    root.join(group)
}

/// Path of a partition directory.
pub fn partition_dir(group_dir: &Path, day: u64) -> PathBuf {
    group_dir.join(day.to_string())
}

/// Path of a partition's data file.
pub fn data_file_path(group_dir: &Path, day: u64) -> PathBuf {
    partition_dir(group_dir, day).join(DATA_FILE_NAME)
}

/// Renames `path` to `._<name>-<n>` within the same parent directory.
///
/// # Errors
///
/// Returns an error if the rename fails or no free name is found.
pub fn rename_to_hidden(path: &Path) -> io::Result<PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    for attempt in 0..MAX_HIDDEN_RENAME_ATTEMPTS {
        let target = parent.join(format!("{}{}-{}", HIDDEN_PREFIX, name, attempt));
        if target.exists() {
            continue;
        }
        fs::rename(path, &target)?;
        return Ok(target);
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("cannot find a hidden name for {}", path.display()),
    ))
}

/// Deletes a directory tree in the background.
///
/// Runs on the tokio blocking pool when called inside a runtime and on a
/// plain thread otherwise.
pub fn remove_in_background(path: PathBuf) {
    let task = move || match fs::remove_dir_all(&path) {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to delete {}: {}", path.display(), err),
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(task);
        }
        Err(_) => {
            std::thread::spawn(task);
        }
    }
}

/// Reads exactly `buf.len()` bytes at `offset` without moving a file cursor.
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Reads exactly `buf.len()` bytes at `offset` without moving a file cursor.
#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Writes all of `buf` at `offset` without moving a file cursor.
#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Writes all of `buf` at `offset` without moving a file cursor.
#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Advises the kernel to drop cached pages for `[0, len)`.
#[cfg(target_os = "linux")]
pub fn evict_page_cache(file: &File, len: u64) -> io::Result<()> {
    use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};
    use std::os::unix::io::AsRawFd;

    let len = len.try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "length does not fit in off_t")
    })?;
    posix_fadvise(
        file.as_raw_fd(),
        0,
        len,
        PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    )
    .map_err(io::Error::from)
}

/// Advises the kernel to drop cached pages for `[0, len)`.
///
/// No equivalent exists on this platform, so this is a no-op.
#[cfg(not(target_os = "linux"))]
pub fn evict_page_cache(_file: &File, _len: u64) -> io::Result<()> {
    Ok(())
}
