use std::io;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::output::{bound, render_output};
use crate::sandbox::{PathPolicy, SandboxError};

#[derive(Debug, thiserror::Error)]
pub(super) enum FileError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        source: io::Error,
    },
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> FileError + 'a {
    move |source| FileError::Io {
        action,
        path: path.display().to_string(),
        source,
    }
}

async fn metadata(raw: &str, path: &Path) -> Result<std::fs::Metadata, FileError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(FileError::NotFound(raw.to_string())),
        Err(err) => Err(io_error("stat", path)(err)),
    }
}

pub(super) async fn read_file(
    policy: &PathPolicy,
    raw: &str,
    ceiling: usize,
) -> Result<String, FileError> {
    let path = policy.resolve(raw).await?;
    if !metadata(raw, &path).await?.is_file() {
        return Err(FileError::NotAFile(raw.to_string()));
    }
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(io_error("open", &path))?;
    let mut bytes = Vec::new();
    file.take(ceiling as u64 + 1)
        .read_to_end(&mut bytes)
        .await
        .map_err(io_error("read", &path))?;
    let (bytes, truncated) = bound(bytes, ceiling);
    Ok(render_output(&bytes, truncated))
}

pub(super) async fn write_file(
    policy: &PathPolicy,
    raw: &str,
    content: &str,
) -> Result<String, FileError> {
    let path = policy.resolve(raw).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error("create directories for", &path))?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    // A link swapped in after resolution must not redirect the write.
    #[cfg(unix)]
    options.custom_flags(libc::O_NOFOLLOW);
    let mut file = options
        .open(&path)
        .await
        .map_err(io_error("open", &path))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(io_error("write", &path))?;
    file.flush().await.map_err(io_error("write", &path))?;
    Ok(format!("Written {} bytes to {}", content.len(), path.display()))
}

/// One line per entry, `dir|file<TAB>size<TAB>name`, sorted by name. Not recursive.
pub(super) async fn list_dir(
    policy: &PathPolicy,
    raw: &str,
    ceiling: usize,
) -> Result<String, FileError> {
    let path = policy.resolve(raw).await?;
    if !metadata(raw, &path).await?.is_dir() {
        return Err(FileError::NotADirectory(raw.to_string()));
    }
    let mut reader = tokio::fs::read_dir(&path)
        .await
        .map_err(io_error("list", &path))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(io_error("list", &path))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        // Follows symlinks so a link to a directory lists as a directory.
        let metadata = tokio::fs::metadata(entry.path()).await.ok();
        let is_dir = metadata.as_ref().map_or(false, |metadata| metadata.is_dir());
        let size = match (&metadata, is_dir) {
            (Some(metadata), false) => metadata.len(),
            _ => 0,
        };
        entries.push((name, is_dir, size));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let listing = entries
        .iter()
        .map(|(name, is_dir, size)| {
            let kind = if *is_dir { "dir" } else { "file" };
            format!("{kind}\t{size}\t{name}")
        })
        .collect::<Vec<_>>()
        .join("\n");
    let (bytes, truncated) = bound(listing.into_bytes(), ceiling);
    Ok(render_output(&bytes, truncated))
}
