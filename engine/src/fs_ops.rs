//! Filesystem operations module.
//!
//! This module provides the low-level operations the copy engine sequences:
//! - Durability barriers (directory sync, durable directory creation)
//! - Positional, sparse-aware and in-kernel (zero-copy) I/O
//! - Collision-free destination naming and temp file naming
//! - Free-space checks, metadata preservation, empty directory pruning

use std::ffi::OsString;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::checksums::{create_hasher, ChecksumAlgorithm, ChecksumValue};
use crate::error::MigrateError;

/// Suffix of in-progress destination files. Never emitted by the scanner.
pub const TEMP_SUFFIX: &str = ".safemove-part";

/// Temp file path adjacent to `destination`.
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// First of `path`, `stem_1.ext`, `stem_2.ext`, ... for which `taken` is false.
pub fn unique_path(path: &Path, mut taken: impl FnMut(&Path) -> bool) -> PathBuf {
    if !taken(path) {
        return path.to_path_buf();
    }
    numbered_siblings(path)
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| path.to_path_buf())
}

/// `stem_1.ext`, `stem_2.ext`, ... beside `path`, without end.
pub fn numbered_siblings(path: &Path) -> impl Iterator<Item = PathBuf> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

    (1u64..).map(move |n| {
        let name = match ext {
            Some(ref ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        parent.join(name)
    })
}

/// Force a directory's entries to stable storage.
#[cfg(unix)]
pub fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Directory handles cannot be synced here; rename durability is left to
/// the filesystem.
#[cfg(not(unix))]
pub fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Sync the parent directory of `path`.
pub fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

/// Create `dir` and any missing ancestors, making each new entry durable.
pub fn ensure_dir_durable(dir: &Path) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(current) = cursor {
        match fs::metadata(current) {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", current.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                missing.push(current.to_path_buf());
                cursor = current.parent();
            }
            Err(e) => return Err(e),
        }
    }
    if missing.is_empty() {
        return Ok(());
    }

    fs::create_dir_all(dir)?;
    for created in missing.iter().rev() {
        sync_parent(created)?;
    }
    debug!(dir = %dir.display(), created = missing.len(), "directories created");
    Ok(())
}

/// Remove a file, treating an already-missing file as success.
///
/// Returns whether a file was actually removed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Nearest existing ancestor, for space queries on paths not created yet.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(path)
}

/// Fail with `InsufficientSpace` unless `needed` bytes fit while keeping
/// `reserve` bytes free on the filesystem holding `path`.
pub fn check_free_space(path: &Path, needed: u64, reserve: u64) -> Result<(), MigrateError> {
    let probe = existing_ancestor(path);
    let available =
        fs2::available_space(probe).map_err(|e| MigrateError::transient(probe, e))?;
    let required = needed.saturating_add(reserve);
    if available < required {
        return Err(MigrateError::InsufficientSpace {
            path: path.to_path_buf(),
            needed: required,
            available,
        });
    }
    Ok(())
}

/// Device identifier, used to pin workers per destination device.
#[cfg(unix)]
pub fn device_id(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(existing_ancestor(path))?.dev())
}

#[cfg(not(unix))]
pub fn device_id(_path: &Path) -> io::Result<u64> {
    Ok(0)
}

/// Whether two open files live on the same device.
#[cfg(unix)]
pub fn same_device(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev()
}

#[cfg(not(unix))]
pub fn same_device(_a: &Metadata, _b: &Metadata) -> bool {
    false
}

/// Read into `buf` starting at `offset`, looping until full or EOF.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(not(unix))]
fn read_at(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(not(unix))]
pub fn write_all_at(mut file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Next data region `[start, end)` at or after `offset`, or `None` past the
/// last one. Holes between regions read as zeros.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn next_data_region(file: &File, offset: u64, len: u64) -> io::Result<Option<(u64, u64)>> {
    use std::os::unix::io::AsRawFd;

    if offset >= len {
        return Ok(None);
    }
    let fd = file.as_raw_fd();
    // SAFETY: lseek on a valid descriptor borrowed from `file`.
    let start = unsafe { libc::lseek(fd, offset as libc::off_t, libc::SEEK_DATA) };
    if start < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            // no data past offset
            Some(libc::ENXIO) => Ok(None),
            // filesystem without hole reporting: all data
            Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => Ok(Some((offset, len))),
            _ => Err(err),
        };
    }
    // SAFETY: as above.
    let end = unsafe { libc::lseek(fd, start, libc::SEEK_HOLE) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    let (start, end) = (start as u64, (end as u64).min(len));
    if start >= len {
        return Ok(None);
    }
    Ok(Some((start, end)))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn next_data_region(_file: &File, offset: u64, len: u64) -> io::Result<Option<(u64, u64)>> {
    if offset >= len {
        Ok(None)
    } else {
        Ok(Some((offset, len)))
    }
}

/// Copy `len` bytes between the same offsets of two files inside the kernel.
///
/// Returns the bytes moved, which may be short. `Unsupported` where the
/// platform has no such call.
#[cfg(target_os = "linux")]
pub fn copy_range(src: &File, dst: &File, offset: u64, len: usize) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let mut off_in = offset as libc::loff_t;
    let mut off_out = offset as libc::loff_t;
    // SAFETY: both descriptors are borrowed from live files and the offsets
    // point to locals.
    let n = unsafe {
        libc::copy_file_range(
            src.as_raw_fd(),
            &mut off_in,
            dst.as_raw_fd(),
            &mut off_out,
            len,
            0,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
pub fn copy_range(_src: &File, _dst: &File, _offset: u64, _len: usize) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "in-kernel copy is not available on this platform",
    ))
}

/// Errors after which in-kernel copy should be abandoned for plain I/O.
pub fn zero_copy_unsupported(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::ENOSYS) | Some(libc::EXDEV) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Apply the source's permission bits and timestamps to an open file.
pub fn preserve_metadata(file: &File, source: &Metadata) -> io::Result<()> {
    file.set_permissions(source.permissions())?;
    let mtime = filetime::FileTime::from_last_modification_time(source);
    let atime = filetime::FileTime::from_last_access_time(source);
    filetime::set_file_handle_times(file, Some(atime), Some(mtime))
}

/// Modification time in unix milliseconds, as recorded in the journal.
pub fn mtime_ms(metadata: &Metadata) -> i64 {
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    mtime.unix_seconds() * 1000 + i64::from(mtime.nanoseconds() / 1_000_000)
}

/// Copy `src` to a new file at `dst` while hashing it, then make `dst`
/// durable. Refuses to overwrite an existing `dst`.
pub fn copy_and_hash(
    src: &Path,
    dst: &Path,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
) -> io::Result<(u64, ChecksumValue)> {
    let input = File::open(src)?;
    let output = OpenOptions::new().write(true).create_new(true).open(dst)?;
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; chunk_size.max(4096)];
    let mut offset = 0u64;

    loop {
        let n = read_full_at(&input, &mut buffer, offset)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        write_all_at(&output, &buffer[..n], offset)?;
        offset += n as u64;
    }

    preserve_metadata(&output, &input.metadata()?)?;
    output.sync_all()?;
    Ok((offset, hasher.digest()))
}

/// Write `contents` to `path` atomically: temp file, sync, rename, dir sync.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir_durable(parent)?;
        }
    }
    let temp = temp_path_for(path);
    {
        let file = File::create(&temp)?;
        write_all_at(&file, contents, 0)?;
        file.sync_all()?;
    }
    fs::rename(&temp, path)?;
    sync_parent(path)
}

/// Remove directories under `root` left empty, deepest first.
///
/// Failures (non-empty, permissions) are skipped. Returns how many were
/// removed.
pub fn prune_empty_dirs(root: &Path, remove_root: bool) -> usize {
    let mut removed = 0;
    let dirs = walkdir::WalkDir::new(root)
        .follow_links(false)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir());

    for entry in dirs {
        if entry.depth() == 0 && !remove_root {
            continue;
        }
        match fs::remove_dir(entry.path()) {
            Ok(()) => {
                removed += 1;
                debug!(dir = %entry.path().display(), "removed empty directory");
            }
            Err(_) => continue,
        }
    }
    if removed > 0 {
        let _ = sync_dir(root).or_else(|_| sync_parent(root));
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_temp_path_naming() {
        let temp = temp_path_for(Path::new("/dst/movie.mkv"));
        assert_eq!(temp, PathBuf::from("/dst/movie.mkv.safemove-part"));
        assert!(is_temp_path(&temp));
        assert!(!is_temp_path(Path::new("/dst/movie.mkv")));
    }

    #[test]
    fn test_unique_path_picks_first_free_suffix() {
        let taken = [PathBuf::from("/d/a.mkv"), PathBuf::from("/d/a_1.mkv")];
        let picked = unique_path(Path::new("/d/a.mkv"), |p| taken.iter().any(|t| t == p));
        assert_eq!(picked, PathBuf::from("/d/a_2.mkv"));

        let picked = unique_path(Path::new("/d/README"), |p| p == Path::new("/d/README"));
        assert_eq!(picked, PathBuf::from("/d/README_1"));

        let picked = unique_path(Path::new("/d/free.txt"), |_| false);
        assert_eq!(picked, PathBuf::from("/d/free.txt"));
    }

    #[test]
    fn test_ensure_dir_durable_creates_nested() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let nested = temp_dir.path().join("a").join("b").join("c");

        ensure_dir_durable(&nested).expect("Failed to create dirs");
        assert!(nested.is_dir());
        // already present is fine
        ensure_dir_durable(&nested).expect("Second call should succeed");
    }

    #[test]
    fn test_ensure_dir_durable_rejects_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("file");
        File::create(&file).expect("Failed to create file");
        assert!(ensure_dir_durable(&file.join("sub")).is_err());
    }

    #[test]
    fn test_remove_file_if_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("x");
        File::create(&path).expect("Failed to create file");
        assert!(remove_file_if_exists(&path).expect("remove"));
        assert!(!remove_file_if_exists(&path).expect("remove missing"));
    }

    #[test]
    fn test_check_free_space_reserve() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let target = temp_dir.path().join("not").join("yet").join("file");

        check_free_space(&target, 1, 0).expect("One byte should fit");
        let err = check_free_space(&target, 1, u64::MAX / 2).expect_err("Reserve too large");
        assert!(matches!(err, MigrateError::InsufficientSpace { .. }));
    }

    #[test]
    fn test_data_regions_cover_regular_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("dense");
        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(&[7u8; 10_000]).expect("Failed to write");
        file.sync_all().expect("Failed to sync");
        let file = File::open(&path).expect("Failed to open");

        let mut covered = 0;
        let mut offset = 0;
        while let Some((start, end)) =
            next_data_region(&file, offset, 10_000).expect("Failed to query extents")
        {
            assert!(start >= offset && end > start);
            covered += end - start;
            offset = end;
        }
        assert_eq!(covered, 10_000);
    }

    #[test]
    fn test_copy_and_hash_refuses_overwrite() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::write(&src, b"hello").expect("Failed to write src");

        let (len, digest) =
            copy_and_hash(&src, &dst, ChecksumAlgorithm::Md5, 2).expect("Failed to copy");
        assert_eq!(len, 5);
        assert_eq!(digest.hex(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(fs::read(&dst).expect("read dst"), b"hello");

        assert!(copy_and_hash(&src, &dst, ChecksumAlgorithm::Md5, 2).is_err());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("out").join("manifest.txt");

        write_atomic(&path, b"first").expect("Failed to write");
        write_atomic(&path, b"second").expect("Failed to rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_prune_empty_dirs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("a/b/c")).expect("Failed to create dirs");
        fs::create_dir_all(root.join("keep")).expect("Failed to create dirs");
        fs::write(root.join("keep/file"), b"x").expect("Failed to write");

        assert_eq!(prune_empty_dirs(&root, true), 3);
        assert!(!root.join("a").exists());
        assert!(root.join("keep/file").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_prune_can_remove_root() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("empty")).expect("Failed to create dirs");

        assert_eq!(prune_empty_dirs(&root, false), 1);
        assert!(root.exists());
        assert_eq!(prune_empty_dirs(&root, true), 1);
        assert!(!root.exists());
    }
}
