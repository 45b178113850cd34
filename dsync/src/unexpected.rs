use common::{DirectoryStructure, FilePath};
use std::collections::HashSet;

/// Destination entries that have no counterpart at the source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnexpectedEntries {
    pub files: Vec<FilePath>,
    pub directories: Vec<FilePath>,
}

impl UnexpectedEntries {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

/// Computes `destination - source` for files and for directories, keeping destination order.
///
/// A path that is a file on one side and a directory on the other is unexpected on the
/// destination side.
#[must_use]
pub fn resolve(source: &DirectoryStructure, destination: &DirectoryStructure) -> UnexpectedEntries {
    let source_files: HashSet<&FilePath> = source.files.iter().map(|file| &file.file_path).collect();
    let source_directories: HashSet<&FilePath> = source
        .directories
        .iter()
        .map(|directory| &directory.file_path)
        .collect();
    UnexpectedEntries {
        files: destination
            .files
            .iter()
            .map(|file| &file.file_path)
            .filter(|path| !source_files.contains(path))
            .cloned()
            .collect(),
        directories: destination
            .directories
            .iter()
            .map(|directory| &directory.file_path)
            .filter(|path| !source_directories.contains(path))
            .cloned()
            .collect(),
    }
}
