//! Utilities for filesystem operations.

use std::{io, path::PathBuf};

use walkdir::WalkDir;

/// Total size in bytes of all files below `root`.
///
/// Walks the directory on the blocking thread pool. A missing directory has size 0, a
/// `root` that exists but is not a directory is an error.
pub async fn dir_size(root: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || dir_size_blocking(root))
        .await
        .map_err(io::Error::other)?
}

fn dir_size_blocking(root: PathBuf) -> io::Result<u64> {
    let meta = match std::fs::metadata(&root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        ));
    }
    let mut total = 0;
    for entry in WalkDir::new(&root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
