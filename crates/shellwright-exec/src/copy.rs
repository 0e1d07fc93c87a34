//! Remote copy engine
//!
//! Destination handling by source kind and what already exists remotely:
//!
//! | source | dest is dir | dest missing | dest is file |
//! |---|---|---|---|
//! | `dir` | into `dest/dir` | create `dest`, `dest/dir` | error |
//! | `dir/` | contents into `dest` | create `dest` | error |
//! | file | `dest/file` | `dest` | `dest` (overwritten) |
//! | text | error | `dest` | `dest` (overwritten) |
//!
//! Remote directories are created before their files. A remote file in the
//! way of a required directory fails the copy at that point; nothing already
//! written is rolled back.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::error::ExecError;
use crate::spec::CopySource;

/// Type of an existing remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Directory,
}

/// The remote filesystem operations the copy engine needs
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Type of `path`, or `None` if it does not exist
    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>, ExecError>;

    /// Create one directory; the parent must exist
    async fn create_dir(&self, path: &str) -> Result<(), ExecError>;

    /// Create or truncate `path` and stream `contents` into it
    ///
    /// Implementations write sequentially through a single stream.
    async fn write_file(
        &self,
        path: &str,
        contents: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, ExecError>;
}

/// What a finished copy leaves behind for the next update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRecord {
    /// Hash of the source at copy time
    pub content_hash: String,
    /// Destination that was written
    pub remote_path: String,
}

/// Whether a new copy is required
#[must_use]
pub fn needs_copy(old: &CopyRecord, new_hash: &str, new_path: &str) -> bool {
    old.content_hash != new_hash || old.remote_path != new_path
}

/// Copy `source` to `remote_path` following the destination table
///
/// # Errors
/// Returns `ExecError::RemoteConflict` when a remote path has the wrong type,
/// `ExecError::IoError` for local read failures and the filesystem's own
/// error otherwise
#[instrument(skip(fs, source))]
pub async fn copy(
    fs: &dyn RemoteFs,
    source: &CopySource,
    remote_path: &str,
) -> Result<(), ExecError> {
    match source {
        CopySource::Text(text) => {
            if fs.stat(remote_path).await? == Some(RemoteKind::Directory) {
                return Err(ExecError::RemoteConflict(format!(
                    "remote path {remote_path} is a directory"
                )));
            }
            let mut reader = text.as_bytes();
            fs.write_file(remote_path, &mut reader).await?;
        }
        CopySource::File(path) => copy_file(fs, path, remote_path).await?,
        CopySource::Directory {
            path,
            contents_only,
        } => {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| ExecError::IoError(format!("{}: {e}", path.display())))?;
            if meta.is_dir() {
                copy_directory(fs, path, *contents_only, remote_path).await?;
            } else {
                copy_file(fs, path, remote_path).await?;
            }
        }
    }
    info!("copy finished");
    Ok(())
}

async fn copy_file(fs: &dyn RemoteFs, local: &Path, remote_path: &str) -> Result<(), ExecError> {
    let dest = match fs.stat(remote_path).await? {
        Some(RemoteKind::Directory) => {
            let dest = join_remote(remote_path, &basename(local)?);
            if fs.stat(&dest).await? == Some(RemoteKind::Directory) {
                return Err(ExecError::RemoteConflict(format!(
                    "remote path {dest} is a directory"
                )));
            }
            dest
        }
        _ => remote_path.to_string(),
    };
    upload(fs, local, &dest).await
}

async fn copy_directory(
    fs: &dyn RemoteFs,
    local: &Path,
    contents_only: bool,
    remote_path: &str,
) -> Result<(), ExecError> {
    match fs.stat(remote_path).await? {
        Some(RemoteKind::File) => return Err(not_a_directory(remote_path)),
        Some(RemoteKind::Directory) => {}
        None => fs.create_dir(remote_path).await?,
    }

    let root = if contents_only {
        remote_path.to_string()
    } else {
        let dest = join_remote(remote_path, &basename(local)?);
        ensure_dir(fs, &dest).await?;
        dest
    };

    for (relative, is_dir) in walk_sorted(local).await? {
        let dest = join_remote(&root, &relative);
        if is_dir {
            ensure_dir(fs, &dest).await?;
        } else {
            if fs.stat(&dest).await? == Some(RemoteKind::Directory) {
                return Err(ExecError::RemoteConflict(format!(
                    "remote path {dest} is a directory"
                )));
            }
            upload(fs, &local.join(&relative), &dest).await?;
        }
    }
    Ok(())
}

async fn ensure_dir(fs: &dyn RemoteFs, path: &str) -> Result<(), ExecError> {
    match fs.stat(path).await? {
        Some(RemoteKind::Directory) => Ok(()),
        Some(RemoteKind::File) => Err(not_a_directory(path)),
        None => fs.create_dir(path).await,
    }
}

async fn upload(fs: &dyn RemoteFs, local: &Path, dest: &str) -> Result<(), ExecError> {
    let mut file = tokio::fs::File::open(local)
        .await
        .map_err(|e| ExecError::IoError(format!("{}: {e}", local.display())))?;
    let written = fs.write_file(dest, &mut file).await?;
    debug!(local = %local.display(), remote = %dest, bytes = written, "uploaded file");
    Ok(())
}

fn not_a_directory(path: &str) -> ExecError {
    ExecError::RemoteConflict(format!(
        "remote path {path} exists but is not a directory"
    ))
}

/// Entries below `root` in lexicographic order, parents before children
///
/// Paths are relative and `/`-joined; the flag marks directories.
async fn walk_sorted(root: &Path) -> Result<Vec<(String, bool)>, ExecError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| ExecError::IoError(e.to_string()))?;
            let relative = relative_slash_path(&root, entry.path())?;
            entries.push((relative, entry.file_type().is_dir()));
        }
        Ok::<_, ExecError>(entries)
    })
    .await
    .map_err(|e| ExecError::IoError(e.to_string()))?
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String, ExecError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| ExecError::IoError(e.to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn basename(path: &Path) -> Result<String, ExecError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ExecError::InvalidInput(format!("{} has no file name", path.display())))
}

/// Join remote path segments with `/` regardless of the local platform
#[must_use]
pub fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Hex sha256 of the source contents
///
/// Directory hashes cover every relative path and file body in walk order,
/// plus whether only the contents are copied.
///
/// # Errors
/// Returns `ExecError::IoError` if the local source cannot be read
pub fn hash_source(source: &CopySource) -> Result<String, ExecError> {
    let mut hasher = Sha256::new();
    match source {
        CopySource::Text(text) => {
            hasher.update(b"text\0");
            hasher.update(text.as_bytes());
        }
        CopySource::File(path) => {
            hasher.update(b"file\0");
            hasher.update(read_local(path)?);
        }
        CopySource::Directory {
            path,
            contents_only,
        } => {
            if path.is_dir() {
                hasher.update(if *contents_only { b"dir/\0" } else { b"dir\0\0" });
                hash_tree(&mut hasher, path)?;
            } else {
                hasher.update(b"file\0");
                hasher.update(read_local(path)?);
            }
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_tree(hasher: &mut Sha256, root: &Path) -> Result<(), ExecError> {
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ExecError::IoError(e.to_string()))?;
        let relative = relative_slash_path(root, entry.path())?;
        hasher.update(relative.as_bytes());
        hasher.update([0]);
        if entry.file_type().is_dir() {
            hasher.update(b"d");
        } else {
            let bytes = read_local(entry.path())?;
            // length first, so file contents cannot pose as a following entry
            hasher.update(b"f");
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
    }
    Ok(())
}

fn read_local(path: &Path) -> Result<Vec<u8>, ExecError> {
    std::fs::read(path).map_err(|e| ExecError::IoError(format!("{}: {e}", path.display())))
}
