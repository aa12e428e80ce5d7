//! Blocking filesystem walks shared by the system probe and cleanup
//!
//! Walks are bounded by `MAX_WALK_ENTRIES` so a huge output tree cannot
//! stall a scan.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Upper bound on entries visited per walk
pub const MAX_WALK_ENTRIES: usize = 20_000;

/// Visit every file and directory under `roots`, depth-first
///
/// Missing roots are skipped. Symlinks are not followed. Unreadable entries
/// below a root are skipped; an unreadable root is an error.
pub fn walk(roots: &[PathBuf], mut visit: impl FnMut(&Path, bool)) -> io::Result<()> {
    let entries = roots
        .iter()
        .flat_map(|root| WalkDir::new(root).follow_links(false).min_depth(1))
        .take(MAX_WALK_ENTRIES);

    let mut seen = 0usize;
    for entry in entries {
        seen += 1;
        match entry {
            Ok(entry) => visit(entry.path(), entry.file_type().is_dir()),
            Err(e) if e.depth() == 0 => {
                if e.io_error().map(|io| io.kind()) != Some(io::ErrorKind::NotFound) {
                    return Err(e.into());
                }
            }
            Err(e) => tracing::debug!(error = %e, "Skipping unreadable entry"),
        }
    }
    if seen == MAX_WALK_ENTRIES {
        tracing::debug!(limit = MAX_WALK_ENTRIES, "Walk limit reached");
    }
    Ok(())
}

/// Paths under `roots` whose full length exceeds `limit` characters
pub fn long_paths(roots: &[PathBuf], limit: usize) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(roots, |path, _| {
        if path.as_os_str().len() > limit {
            found.push(path.to_path_buf());
        }
    })?;
    Ok(found)
}

/// Files under `roots` that another process holds exclusively
pub fn locked_files(roots: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(roots, |path, is_dir| {
        if !is_dir && is_locked(path) {
            found.push(path.to_path_buf());
        }
    })?;
    Ok(found)
}

/// Whether opening `path` for writing fails with a sharing/busy error
pub fn is_locked(path: &Path) -> bool {
    match std::fs::OpenOptions::new().append(true).open(path) {
        Ok(_) => false,
        Err(e) => is_lock_error(&e),
    }
}

#[cfg(unix)]
fn is_lock_error(e: &io::Error) -> bool {
    // running executables cannot be opened for writing
    e.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(windows)]
fn is_lock_error(e: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(e.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(any(unix, windows)))]
fn is_lock_error(_e: &io::Error) -> bool {
    false
}

/// Count of version directories across toolchain install roots
pub fn count_subdirs(dirs: &[PathBuf]) -> io::Result<usize> {
    let mut count = 0;
    for dir in dirs {
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => count += 1,
                Ok(_) => {}
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(count)
}
