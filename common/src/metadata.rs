//! Reading and applying file and directory metadata (size, modification time, permissions)

use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use tracing::instrument;

use crate::error::file_deleted_or;
use crate::model::{DirectoryMetadata, FileMetadata, FilePath};

/// Only the classic rwx bits are carried, setuid/setgid/sticky are dropped like `cp` does.
pub const MODE_MASK: u32 = 0o777;

fn millis_since_epoch(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

fn filetime_from_millis(millis: i64) -> filetime::FileTime {
    let seconds = millis.div_euclid(1000);
    let nanos = u32::try_from(millis.rem_euclid(1000) * 1_000_000).unwrap_or(0);
    filetime::FileTime::from_unix_time(seconds, nanos)
}

pub fn file_metadata_from(file_path: FilePath, metadata: &std::fs::Metadata) -> FileMetadata {
    let last_modified = metadata.modified().map(millis_since_epoch).unwrap_or(0);
    FileMetadata {
        file_path,
        size: metadata.len(),
        last_modified,
        permissions: Some(metadata.permissions().mode() & MODE_MASK),
    }
}

pub fn directory_metadata_from(
    file_path: FilePath,
    metadata: &std::fs::Metadata,
) -> DirectoryMetadata {
    DirectoryMetadata {
        file_path,
        permissions: Some(metadata.permissions().mode() & MODE_MASK),
    }
}

#[instrument]
pub async fn read_file_metadata(root: &std::path::Path, file_path: &FilePath) -> Result<FileMetadata> {
    let path = file_path.resolve(root);
    let metadata = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|err| file_deleted_or(err, file_path))?;
    Ok(file_metadata_from(file_path.clone(), &metadata))
}

/// Applies modification time and permissions of `metadata` to the file below `root`.
#[instrument]
pub async fn write_file_metadata(root: &std::path::Path, metadata: &FileMetadata) -> Result<()> {
    let path = metadata.file_path.resolve(root);
    let mtime = filetime_from_millis(metadata.last_modified);
    {
        let path = path.clone();
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, mtime)
                .with_context(|| format!("failed setting modification time of {:?}", &path))
        })
        .await??;
    }
    if let Some(mode) = metadata.permissions {
        let permissions = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(&path, permissions)
            .await
            .with_context(|| format!("cannot set {:?} permissions to {:o}", &path, mode))?;
    }
    Ok(())
}

#[instrument]
pub async fn write_directory_metadata(
    root: &std::path::Path,
    metadata: &DirectoryMetadata,
) -> Result<()> {
    if let Some(mode) = metadata.permissions {
        let path = metadata.file_path.resolve(root);
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("cannot set {:?} permissions to {:o}", &path, mode))?;
    }
    Ok(())
}

/// Creates every directory (parents first) and applies its permissions.
#[instrument(skip(directories))]
pub async fn create_directories(
    root: &std::path::Path,
    directories: &[DirectoryMetadata],
) -> Result<()> {
    for directory in directories {
        let path = directory.file_path.resolve(root);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("cannot create directory {:?}", &path))?;
        write_directory_metadata(root, directory).await?;
    }
    tracing::debug!("created {} directories under {:?}", directories.len(), root);
    Ok(())
}
