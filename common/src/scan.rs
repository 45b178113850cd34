//! Recursive listing of a root directory into a [`DirectoryStructure`] snapshot

use anyhow::{Context, Result};
use tracing::instrument;

use crate::error::TransferError;
use crate::filter::{FilterResult, FilterSettings};
use crate::metadata;
use crate::model::{DirectoryStructure, FilePath};

#[derive(Debug)]
pub struct ScanEntry {
    pub file_path: FilePath,
    pub is_dir: bool,
    pub metadata: std::fs::Metadata,
}

/// Lists regular files and directories below `root`, every directory before its children.
///
/// Symlinks, sockets, pipes and devices are never listed and symlinked directories are not
/// descended into. A directory shows up when it is included itself or when something below it
/// is included.
pub fn list_entries(root: &std::path::Path, filter: &FilterSettings) -> Result<Vec<ScanEntry>> {
    match std::fs::metadata(root) {
        Ok(md) if md.is_dir() => {}
        _ => return Err(TransferError::NotDirectory(root.to_path_buf()).into()),
    }
    let mut entries = Vec::new();
    list_children(root, None, filter, &mut entries)?;
    Ok(entries)
}

fn list_children(
    dir: &std::path::Path,
    parent: Option<&FilePath>,
    filter: &FilterSettings,
    out: &mut Vec<ScanEntry>,
) -> Result<()> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot open directory {:?} for reading", dir))? {
        let entry = entry.with_context(|| format!("failed traversing directory {:?}", dir))?;
        children.push(entry.path());
    }
    children.sort();
    for path in children {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            tracing::warn!("skipping {:?}: file name is not valid UTF-8", path);
            continue;
        };
        let file_path = match parent {
            Some(parent) => parent.child(name),
            None => FilePath::new("", name),
        };
        let md = match std::fs::symlink_metadata(&path) {
            Ok(md) => md,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{:?} vanished while listing", path);
                continue;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed reading metadata from {:?}", path));
            }
        };
        let file_type = md.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }
        let relative = file_path.to_relative_path();
        let included = match filter.check(&relative, file_type.is_dir()) {
            FilterResult::ExcludedByPattern(pattern) => {
                tracing::debug!("{} excluded by '{}'", file_path, pattern);
                continue;
            }
            FilterResult::Included => true,
            FilterResult::ExcludedByDefault => false,
        };
        if file_type.is_dir() {
            let accept_all = FilterSettings::default();
            let subtree_filter = if filter.is_explicitly_included(&relative, true) {
                &accept_all
            } else {
                filter
            };
            let mut sub_entries = Vec::new();
            list_children(&path, Some(&file_path), subtree_filter, &mut sub_entries)?;
            if included || !sub_entries.is_empty() {
                out.push(ScanEntry {
                    file_path,
                    is_dir: true,
                    metadata: md,
                });
                out.append(&mut sub_entries);
            }
        } else if included {
            out.push(ScanEntry {
                file_path,
                is_dir: false,
                metadata: md,
            });
        }
    }
    Ok(())
}

/// Takes a [`DirectoryStructure`] snapshot of `root`.
#[instrument(skip(filter))]
pub async fn read_directory_structure(
    root: &std::path::Path,
    filter: &FilterSettings,
) -> Result<DirectoryStructure> {
    let root = root.to_path_buf();
    let filter = filter.clone();
    tokio::task::spawn_blocking(move || {
        let entries = list_entries(&root, &filter)?;
        let mut structure = DirectoryStructure {
            root_directory: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        for entry in entries {
            if entry.is_dir {
                structure
                    .directories
                    .push(metadata::directory_metadata_from(entry.file_path, &entry.metadata));
            } else {
                structure
                    .files
                    .push(metadata::file_metadata_from(entry.file_path, &entry.metadata));
            }
        }
        tracing::debug!(
            "listed {} directories and {} files under {:?}",
            structure.directories.len(),
            structure.files.len(),
            root
        );
        Ok(structure)
    })
    .await?
}
