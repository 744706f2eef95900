//! Filesystem and archive helpers: zip extraction for uploads, zip creation
//! for backups, and the tree copy/delete primitives used during deployment.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Errors from archive and filesystem operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Archive entry escapes destination: {0}")]
    UnsafeEntry(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Extract a zip archive into a sibling directory named after the archive
/// (without extension) and return that directory. Nothing is left behind
/// when extraction fails.
pub fn extract_archive(archive_path: &Path) -> Result<PathBuf, ArchiveError> {
    let dest = archive_path.with_extension("");
    if dest.exists() {
        delete_tree(&dest)?;
    }
    if let Err(e) = extract_into(archive_path, &dest) {
        if let Err(cleanup) = delete_tree(&dest) {
            warn!(dest = ?dest, error = %cleanup, "Failed to remove partial extraction");
        }
        return Err(e);
    }
    debug!(archive = ?archive_path, dest = ?dest, "Extracted archive");
    Ok(dest)
}

fn extract_into(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(io_err(archive_path))?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(dest).map_err(io_err(dest))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(ArchiveError::UnsafeEntry(entry.name().to_string()));
        };
        // Symlinks are never materialized
        if let Some(mode) = entry.unix_mode() {
            if (mode & 0o170000) == 0o120000 {
                continue;
            }
        }
        let out = dest.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(io_err(&out))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out_file = File::create(&out).map_err(io_err(&out))?;
        io::copy(&mut entry, &mut out_file).map_err(io_err(&out))?;
    }
    Ok(())
}

/// Write a zip archive at `dest` containing each `(entry_name, path)` pair.
///
/// Files are stored under `entry_name`; directories are stored recursively
/// under `entry_name/`. Paths that do not exist are skipped. Returns the
/// number of files written.
pub fn zip_paths(entries: &[(String, PathBuf)], dest: &Path) -> Result<usize, ArchiveError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file = File::create(dest).map_err(io_err(dest))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut written = 0;

    for (name, path) in entries {
        let name = name.trim_matches('/').replace('\\', "/");
        if path.is_file() {
            zip.start_file(name.as_str(), options)?;
            let mut src = File::open(path).map_err(io_err(path))?;
            io::copy(&mut src, &mut zip).map_err(io_err(path))?;
            written += 1;
        } else if path.is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
            for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
                let entry = entry?;
                let rel = entry
                    .path()
                    .strip_prefix(path)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let entry_name = format!("{}/{}", name, rel);
                if entry.file_type().is_dir() {
                    zip.add_directory(format!("{}/", entry_name), options)?;
                } else if entry.file_type().is_file() {
                    zip.start_file(entry_name, options)?;
                    let mut src = File::open(entry.path()).map_err(io_err(entry.path()))?;
                    io::copy(&mut src, &mut zip).map_err(io_err(entry.path()))?;
                    written += 1;
                }
            }
        }
    }
    zip.finish()?;
    debug!(dest = ?dest, files = written, "Wrote archive");
    Ok(written)
}

/// Remove a file or directory tree. Missing paths are not an error.
pub fn delete_tree(path: &Path) -> Result<(), ArchiveError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return Ok(());
    };
    result.map_err(io_err(path))
}

/// True when `path` is a directory with no entries (or does not exist)
pub fn dir_is_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Recursively copy a directory, overwriting files that already exist
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Move a file or directory, falling back to copy + delete when a plain
/// rename is not possible (e.g. across filesystems)
pub fn move_path(src: &Path, dst: &Path) -> Result<(), ArchiveError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    if src.is_dir() {
        copy_dir_recursive(src, dst).map_err(io_err(dst))?;
    } else {
        fs::copy(src, dst).map_err(io_err(dst))?;
    }
    delete_tree(src)
}
