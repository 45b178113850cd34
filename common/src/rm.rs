use anyhow::{Context, Result};
use tracing::instrument;

use crate::model::FilePath;

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_entry(path: std::path::PathBuf, is_dir: bool) -> Result<()> {
    tracing::debug!("remove: {:?}", &path);
    let result = if is_dir {
        tokio::fs::remove_dir_all(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    ignore_missing(result).with_context(|| format!("failed removing {:?}", &path))
}

/// Removes `files` and then `directories` (with their contents) under `root`.
///
/// Entries that are already gone are not an error. All removals are attempted; if any fail, the
/// errors are reported together.
#[instrument(skip(files, directories))]
pub async fn remove_entries(
    root: &std::path::Path,
    files: &[FilePath],
    directories: &[FilePath],
) -> Result<()> {
    let mut errors = vec![];
    for (entries, is_dir) in [(files, false), (directories, true)] {
        let mut join_set = tokio::task::JoinSet::new();
        for entry in entries {
            join_set.spawn(remove_entry(entry.resolve(root), is_dir));
        }
        while let Some(res) = join_set.join_next().await {
            if let Err(error) = res? {
                errors.push(error);
            }
        }
    }
    if !errors.is_empty() {
        tracing::debug!("remove under {:?} failed with: {:?}", root, &errors);
        return Err(anyhow::anyhow!("{:?}", &errors));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_files_and_directory_trees() -> Result<()> {
        let tmp = crate::testutils::setup_test_tree()?;
        remove_entries(
            tmp.path(),
            &[FilePath::new("", "0.txt"), FilePath::new("baz", "4.txt")],
            &[FilePath::new("", "bar")],
        )
        .await?;
        assert!(!tmp.path().join("0.txt").exists());
        assert!(!tmp.path().join("bar").exists());
        assert!(tmp.path().join("baz").is_dir());
        assert!(!tmp.path().join("baz").join("4.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_entries_are_ignored() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        remove_entries(
            tmp.path(),
            &[FilePath::new("", "nope")],
            &[FilePath::new("a", "b")],
        )
        .await?;
        Ok(())
    }
}
