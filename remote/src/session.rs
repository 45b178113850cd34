//! Client-side view of the remote session operations
//!
//! The transfer executors only ever talk to the other side through these traits. The TCP client
//! in [`crate::client`] implements them over the network; an in-process implementation can drive
//! a server-side session registry directly.

use bytes::Bytes;
use common::{ChunkInfo, DigestType, DirectoryStructure, FileDigest, FilePath};
use common::filter::FilterSettings;

/// Operations of a download: the remote side is the source.
#[async_trait::async_trait]
pub trait DownloadClient: Send + Sync {
    /// Opens a session over `root_directory` and returns its id.
    async fn init_download(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
    ) -> anyhow::Result<String>;
    async fn structure(&self, session: &str) -> anyhow::Result<DirectoryStructure>;
    async fn file_digest(
        &self,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest>;
    async fn skip_file(&self, session: &str, file: &FilePath) -> anyhow::Result<()>;
    /// Returns the file session id.
    async fn init_file(&self, session: &str, file: &FilePath) -> anyhow::Result<String>;
    async fn download_chunk(&self, file_session: &str, chunk: ChunkInfo) -> anyhow::Result<Bytes>;
    async fn commit_file(&self, file_session: &str) -> anyhow::Result<()>;
    async fn abort_file(&self, file_session: &str) -> anyhow::Result<()>;
    async fn commit(&self, session: &str) -> anyhow::Result<()>;
    async fn abort(&self, session: &str) -> anyhow::Result<()>;
}

/// Operations of an upload: the remote side is the destination.
#[async_trait::async_trait]
pub trait UploadClient: Send + Sync {
    /// Opens a session over `root_directory` expecting the files listed in `manifest`.
    async fn init_upload(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
        manifest: &DirectoryStructure,
    ) -> anyhow::Result<String>;
    /// What currently exists at the destination.
    async fn structure(&self, session: &str) -> anyhow::Result<DirectoryStructure>;
    async fn create_directories(&self, session: &str) -> anyhow::Result<()>;
    async fn delete_files(
        &self,
        session: &str,
        files: &[FilePath],
        directories: &[FilePath],
    ) -> anyhow::Result<()>;
    async fn file_digest(
        &self,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest>;
    async fn skip_file(&self, session: &str, file: &FilePath) -> anyhow::Result<()>;
    async fn init_file(&self, session: &str, file: &FilePath) -> anyhow::Result<String>;
    async fn upload_chunk(
        &self,
        file_session: &str,
        chunk: ChunkInfo,
        data: Bytes,
    ) -> anyhow::Result<()>;
    async fn commit_file(&self, file_session: &str) -> anyhow::Result<()>;
    async fn abort_file(&self, file_session: &str) -> anyhow::Result<()>;
    /// Removes the destination file instead of committing it.
    async fn delete_file(&self, file_session: &str) -> anyhow::Result<()>;
    async fn commit(&self, session: &str) -> anyhow::Result<()>;
    async fn abort(&self, session: &str) -> anyhow::Result<()>;
}

/// Read-only listing of a remote directory, no session involved.
#[async_trait::async_trait]
pub trait ListClient: Send + Sync {
    async fn list(
        &self,
        root_directory: &str,
        filter: &FilterSettings,
    ) -> anyhow::Result<DirectoryStructure>;
}
