//! Lifecycle callbacks of a transfer and the sinks that consume them
//!
//! Executors report every step through a [`TransferProgress`] sink. All methods default to no-ops,
//! so a sink only implements what it cares about. [`CompositeProgress`] fans events out to several
//! sinks, [`StatsProgress`] turns them into a [`Summary`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{ChunkInfo, DirectoryStructure, FileMetadata, FilePath, TransferMode};

#[allow(unused_variables)]
pub trait TransferProgress: Send + Sync {
    fn initializing(&self, mode: TransferMode, local: &std::path::Path, remote: &str) {}
    fn analyzing(&self) {}
    /// `source` is the tree being copied from.
    fn started(&self, source: &DirectoryStructure, chunk_size: u64) {}
    fn deleted_files(&self, files: &[FilePath]) {}
    fn deleted_directories(&self, directories: &[FilePath]) {}
    fn file_analyze(&self, file: &FileMetadata) {}
    /// `metadata_only` is set when the content matched but metadata had to be patched.
    fn file_skipped(&self, file: &FileMetadata, metadata_only: bool) {}
    fn file_started(&self, file: &FileMetadata) {}
    fn file_deleted(&self, file: &FileMetadata) {}
    fn file_completed(&self, file: &FileMetadata) {}
    fn chunk_skipped(&self, file: &FilePath, chunk: ChunkInfo) {}
    fn chunk_transferred(&self, file: &FilePath, chunk: ChunkInfo) {}
    fn completed(&self) {}
    fn aborted(&self, error: &anyhow::Error) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl TransferProgress for NoopProgress {}

/// Forwards every event to each of its sinks, in order.
#[derive(Default, Clone)]
pub struct CompositeProgress {
    sinks: Vec<std::sync::Arc<dyn TransferProgress>>,
}

impl CompositeProgress {
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn TransferProgress>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: std::sync::Arc<dyn TransferProgress>) {
        self.sinks.push(sink);
    }
}

impl TransferProgress for CompositeProgress {
    fn initializing(&self, mode: TransferMode, local: &std::path::Path, remote: &str) {
        self.sinks
            .iter()
            .for_each(|sink| sink.initializing(mode, local, remote));
    }
    fn analyzing(&self) {
        self.sinks.iter().for_each(|sink| sink.analyzing());
    }
    fn started(&self, source: &DirectoryStructure, chunk_size: u64) {
        self.sinks
            .iter()
            .for_each(|sink| sink.started(source, chunk_size));
    }
    fn deleted_files(&self, files: &[FilePath]) {
        self.sinks.iter().for_each(|sink| sink.deleted_files(files));
    }
    fn deleted_directories(&self, directories: &[FilePath]) {
        self.sinks
            .iter()
            .for_each(|sink| sink.deleted_directories(directories));
    }
    fn file_analyze(&self, file: &FileMetadata) {
        self.sinks.iter().for_each(|sink| sink.file_analyze(file));
    }
    fn file_skipped(&self, file: &FileMetadata, metadata_only: bool) {
        self.sinks
            .iter()
            .for_each(|sink| sink.file_skipped(file, metadata_only));
    }
    fn file_started(&self, file: &FileMetadata) {
        self.sinks.iter().for_each(|sink| sink.file_started(file));
    }
    fn file_deleted(&self, file: &FileMetadata) {
        self.sinks.iter().for_each(|sink| sink.file_deleted(file));
    }
    fn file_completed(&self, file: &FileMetadata) {
        self.sinks.iter().for_each(|sink| sink.file_completed(file));
    }
    fn chunk_skipped(&self, file: &FilePath, chunk: ChunkInfo) {
        self.sinks
            .iter()
            .for_each(|sink| sink.chunk_skipped(file, chunk));
    }
    fn chunk_transferred(&self, file: &FilePath, chunk: ChunkInfo) {
        self.sinks
            .iter()
            .for_each(|sink| sink.chunk_transferred(file, chunk));
    }
    fn completed(&self) {
        self.sinks.iter().for_each(|sink| sink.completed());
    }
    fn aborted(&self, error: &anyhow::Error) {
        self.sinks.iter().for_each(|sink| sink.aborted(error));
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_total: u64,
    pub files_skipped: u64,
    pub files_metadata_only: u64,
    pub files_transferred: u64,
    pub files_deleted: u64,
    pub chunks_transferred: u64,
    pub chunks_skipped: u64,
    pub bytes_transferred: u64,
    pub bytes_skipped: u64,
    pub deleted_files: u64,
    pub deleted_directories: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_total: self.files_total + other.files_total,
            files_skipped: self.files_skipped + other.files_skipped,
            files_metadata_only: self.files_metadata_only + other.files_metadata_only,
            files_transferred: self.files_transferred + other.files_transferred,
            files_deleted: self.files_deleted + other.files_deleted,
            chunks_transferred: self.chunks_transferred + other.chunks_transferred,
            chunks_skipped: self.chunks_skipped + other.chunks_skipped,
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            bytes_skipped: self.bytes_skipped + other.bytes_skipped,
            deleted_files: self.deleted_files + other.deleted_files,
            deleted_directories: self.deleted_directories + other.deleted_directories,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "files total: {}\n\
            files transferred: {}\n\
            files skipped: {}\n\
            files with metadata only: {}\n\
            files deleted at source: {}\n\
            chunks transferred: {}\n\
            chunks skipped: {}\n\
            bytes transferred: {}\n\
            bytes skipped: {}\n\
            unexpected files removed: {}\n\
            unexpected directories removed: {}\n",
            self.files_total,
            self.files_transferred,
            self.files_skipped,
            self.files_metadata_only,
            self.files_deleted,
            self.chunks_transferred,
            self.chunks_skipped,
            bytesize::ByteSize(self.bytes_transferred),
            bytesize::ByteSize(self.bytes_skipped),
            self.deleted_files,
            self.deleted_directories,
        )
    }
}

/// Counts events into a [`Summary`].
#[derive(Debug, Default)]
pub struct StatsProgress {
    files_total: AtomicU64,
    files_skipped: AtomicU64,
    files_metadata_only: AtomicU64,
    files_transferred: AtomicU64,
    files_deleted: AtomicU64,
    chunks_transferred: AtomicU64,
    chunks_skipped: AtomicU64,
    bytes_transferred: AtomicU64,
    bytes_skipped: AtomicU64,
    deleted_files: AtomicU64,
    deleted_directories: AtomicU64,
}

fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

impl StatsProgress {
    #[must_use]
    pub fn summary(&self) -> Summary {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Summary {
            files_total: get(&self.files_total),
            files_skipped: get(&self.files_skipped),
            files_metadata_only: get(&self.files_metadata_only),
            files_transferred: get(&self.files_transferred),
            files_deleted: get(&self.files_deleted),
            chunks_transferred: get(&self.chunks_transferred),
            chunks_skipped: get(&self.chunks_skipped),
            bytes_transferred: get(&self.bytes_transferred),
            bytes_skipped: get(&self.bytes_skipped),
            deleted_files: get(&self.deleted_files),
            deleted_directories: get(&self.deleted_directories),
        }
    }
}

impl TransferProgress for StatsProgress {
    fn started(&self, source: &DirectoryStructure, _chunk_size: u64) {
        add(&self.files_total, source.files.len() as u64);
    }
    fn deleted_files(&self, files: &[FilePath]) {
        add(&self.deleted_files, files.len() as u64);
    }
    fn deleted_directories(&self, directories: &[FilePath]) {
        add(&self.deleted_directories, directories.len() as u64);
    }
    fn file_skipped(&self, _file: &FileMetadata, metadata_only: bool) {
        if metadata_only {
            add(&self.files_metadata_only, 1);
        } else {
            add(&self.files_skipped, 1);
        }
    }
    fn file_deleted(&self, _file: &FileMetadata) {
        add(&self.files_deleted, 1);
    }
    fn file_completed(&self, _file: &FileMetadata) {
        add(&self.files_transferred, 1);
    }
    fn chunk_skipped(&self, _file: &FilePath, chunk: ChunkInfo) {
        add(&self.chunks_skipped, 1);
        add(&self.bytes_skipped, chunk.size);
    }
    fn chunk_transferred(&self, _file: &FilePath, chunk: ChunkInfo) {
        add(&self.chunks_transferred, 1);
        add(&self.bytes_transferred, chunk.size);
    }
}

/// Reports file-level events at INFO and chunk-level events at DEBUG.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProgress;

impl TransferProgress for LoggingProgress {
    fn initializing(&self, mode: TransferMode, local: &std::path::Path, remote: &str) {
        tracing::info!("initializing {} between {:?} and {:?}", mode, local, remote);
    }
    fn analyzing(&self) {
        tracing::info!("analyzing directory structures");
    }
    fn started(&self, source: &DirectoryStructure, chunk_size: u64) {
        tracing::info!(
            "transfer started: {} files in {} directories, {} total, chunk size {}",
            source.files.len(),
            source.directories.len(),
            bytesize::ByteSize(source.total_bytes()),
            bytesize::ByteSize(chunk_size),
        );
    }
    fn deleted_files(&self, files: &[FilePath]) {
        for file in files {
            tracing::info!("deleted unexpected file {}", file);
        }
    }
    fn deleted_directories(&self, directories: &[FilePath]) {
        for directory in directories {
            tracing::info!("deleted unexpected directory {}", directory);
        }
    }
    fn file_analyze(&self, file: &FileMetadata) {
        tracing::debug!("analyzing {}", file.file_path);
    }
    fn file_skipped(&self, file: &FileMetadata, metadata_only: bool) {
        if metadata_only {
            tracing::info!("{}: content up to date, metadata updated", file.file_path);
        } else {
            tracing::info!("{}: up to date, skipped", file.file_path);
        }
    }
    fn file_started(&self, file: &FileMetadata) {
        tracing::info!(
            "{}: transferring {}",
            file.file_path,
            bytesize::ByteSize(file.size)
        );
    }
    fn file_deleted(&self, file: &FileMetadata) {
        tracing::info!("{}: deleted at source during transfer", file.file_path);
    }
    fn file_completed(&self, file: &FileMetadata) {
        tracing::info!("{}: completed", file.file_path);
    }
    fn chunk_skipped(&self, file: &FilePath, chunk: ChunkInfo) {
        tracing::debug!("{}: chunk {} unchanged", file, chunk);
    }
    fn chunk_transferred(&self, file: &FilePath, chunk: ChunkInfo) {
        tracing::debug!("{}: chunk {} transferred", file, chunk);
    }
    fn completed(&self) {
        tracing::info!("transfer completed");
    }
    fn aborted(&self, error: &anyhow::Error) {
        tracing::error!("transfer aborted: {:#}", error);
    }
}

/// Byte-level progress bar on stderr. Skipped content counts as done.
pub struct BarProgress {
    bar: indicatif::ProgressBar,
}

impl BarProgress {
    #[must_use]
    pub fn new() -> Self {
        let bar = indicatif::ProgressBar::new(0);
        let style = indicatif::ProgressStyle::with_template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("#>-");
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(200));
        Self { bar }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferProgress for BarProgress {
    fn analyzing(&self) {
        self.bar.set_message("analyzing");
    }
    fn started(&self, source: &DirectoryStructure, _chunk_size: u64) {
        self.bar.set_length(source.total_bytes());
        self.bar.set_message("transferring");
    }
    fn file_skipped(&self, file: &FileMetadata, _metadata_only: bool) {
        self.bar.inc(file.size);
    }
    fn file_started(&self, file: &FileMetadata) {
        self.bar.set_message(file.file_path.to_string());
    }
    fn chunk_skipped(&self, _file: &FilePath, chunk: ChunkInfo) {
        self.bar.inc(chunk.size);
    }
    fn chunk_transferred(&self, _file: &FilePath, chunk: ChunkInfo) {
        self.bar.inc(chunk.size);
    }
    fn completed(&self) {
        self.bar.finish_with_message("done");
    }
    fn aborted(&self, _error: &anyhow::Error) {
        self.bar.abandon_with_message("aborted");
    }
}
