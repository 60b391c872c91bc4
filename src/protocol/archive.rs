//! In-place directory archiving for transfer.
//!
//! `archive_directory` turns a directory into a gzip-compressed tar file at
//! the same path, `restore_directory` turns it back. Both are blocking; async
//! callers run them on `spawn_blocking`.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Total size in bytes of the regular files below `dir`.
pub fn directory_size(dir: &Path) -> DispatchResult<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += directory_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Replace `dir` with a `.tar.gz` archive of its contents at the same path.
///
/// Directories larger than `limit` bytes are refused and left in place.
pub fn archive_directory(dir: &Path, limit: u64) -> DispatchResult<()> {
    if !dir.is_dir() {
        return Err(DispatchError::content(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let size = directory_size(dir)?;
    if size > limit {
        return Err(DispatchError::ResourceExhausted(format!(
            "{} holds {} bytes, limit is {}",
            dir.display(),
            size,
            limit
        )));
    }

    let tmp = tmp_path(dir);
    {
        let encoder = GzEncoder::new(File::create(&tmp)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", dir)?;
        builder.into_inner()?.finish()?;
    }
    fs::remove_dir_all(dir)?;
    fs::rename(&tmp, dir)?;
    debug!("Archived {} ({} bytes)", dir.display(), size);
    Ok(())
}

/// Reverse of [`archive_directory`]: unpack the archive at `path` into a
/// directory of the same name.
///
/// A malformed archive is reported as a content error and the archive file is
/// put back untouched.
pub fn restore_directory(path: &Path) -> DispatchResult<()> {
    if !path.is_file() {
        return Err(DispatchError::content(format!(
            "{} is not an archive file",
            path.display()
        )));
    }

    let tmp = tmp_path(path);
    fs::rename(path, &tmp)?;
    fs::create_dir(path)?;

    let unpacked = File::open(&tmp)
        .and_then(|f| tar::Archive::new(GzDecoder::new(f)).unpack(path));
    match unpacked {
        Ok(()) => {
            fs::remove_file(&tmp)?;
            debug!("Restored {}", path.display());
            Ok(())
        }
        Err(e) => {
            warn!("Failed to unpack {}: {}", path.display(), e);
            fs::remove_dir_all(path)?;
            fs::rename(&tmp, path)?;
            Err(DispatchError::content(format!(
                "malformed archive {}: {}",
                path.display(),
                e
            )))
        }
    }
}
