//! In-process implementation of the remote session traits
//!
//! Used when both directories live on the same host, and by tests that want to drive an executor
//! without a network in between.

use bytes::Bytes;
use common::filter::FilterSettings;
use common::{ChunkInfo, DigestType, DirectoryStructure, FileDigest, FilePath};
use remote::{DownloadClient, ListClient, UploadClient};
use std::sync::Arc;

use crate::registry::SessionRegistry;

#[derive(Clone, Debug)]
pub struct LocalClient {
    registry: Arc<SessionRegistry>,
    auth_token: Option<String>,
}

impl LocalClient {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, auth_token: Option<String>) -> Self {
        Self {
            registry,
            auth_token,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[async_trait::async_trait]
impl DownloadClient for LocalClient {
    async fn init_download(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
    ) -> anyhow::Result<String> {
        self.registry
            .init_download(root_directory, chunk_size, filter, self.auth_token.as_deref())
            .await
    }

    async fn structure(&self, session: &str) -> anyhow::Result<DirectoryStructure> {
        Ok(self.registry.download(session)?.structure())
    }

    async fn file_digest(
        &self,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest> {
        let session = self.registry.download(session)?;
        session.file_digest(file, digest_type).await
    }

    async fn skip_file(&self, session: &str, file: &FilePath) -> anyhow::Result<()> {
        Ok(self.registry.download(session)?.skip_file(file)?)
    }

    async fn init_file(&self, session: &str, file: &FilePath) -> anyhow::Result<String> {
        Ok(self.registry.download(session)?.init_file(file)?)
    }

    async fn download_chunk(&self, file_session: &str, chunk: ChunkInfo) -> anyhow::Result<Bytes> {
        let file_session = self.registry.file_download(file_session)?;
        file_session.download_chunk(chunk).await
    }

    async fn commit_file(&self, file_session: &str) -> anyhow::Result<()> {
        Ok(self.registry.file_download(file_session)?.commit()?)
    }

    async fn abort_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.registry.file_download(file_session)?.abort();
        Ok(())
    }

    async fn commit(&self, session: &str) -> anyhow::Result<()> {
        Ok(self.registry.commit_download(session)?)
    }

    async fn abort(&self, session: &str) -> anyhow::Result<()> {
        self.registry.abort_download(session);
        Ok(())
    }
}

#[async_trait::async_trait]
impl UploadClient for LocalClient {
    async fn init_upload(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
        manifest: &DirectoryStructure,
    ) -> anyhow::Result<String> {
        self.registry
            .init_upload(
                root_directory,
                chunk_size,
                filter,
                manifest.clone(),
                self.auth_token.as_deref(),
            )
            .await
    }

    async fn structure(&self, session: &str) -> anyhow::Result<DirectoryStructure> {
        let session = self.registry.upload(session)?;
        session.structure().await
    }

    async fn create_directories(&self, session: &str) -> anyhow::Result<()> {
        let session = self.registry.upload(session)?;
        session.create_directories().await
    }

    async fn delete_files(
        &self,
        session: &str,
        files: &[FilePath],
        directories: &[FilePath],
    ) -> anyhow::Result<()> {
        let session = self.registry.upload(session)?;
        session.delete_files(files, directories).await
    }

    async fn file_digest(
        &self,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest> {
        let session = self.registry.upload(session)?;
        session.file_digest(file, digest_type).await
    }

    async fn skip_file(&self, session: &str, file: &FilePath) -> anyhow::Result<()> {
        Ok(self.registry.upload(session)?.skip_file(file)?)
    }

    async fn init_file(&self, session: &str, file: &FilePath) -> anyhow::Result<String> {
        let session = self.registry.upload(session)?;
        session.init_file(file).await
    }

    async fn upload_chunk(
        &self,
        file_session: &str,
        chunk: ChunkInfo,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let file_session = self.registry.file_upload(file_session)?;
        file_session.upload_chunk(chunk, data).await
    }

    async fn commit_file(&self, file_session: &str) -> anyhow::Result<()> {
        let file_session = self.registry.file_upload(file_session)?;
        file_session.commit().await
    }

    async fn abort_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.registry.file_upload(file_session)?.abort();
        Ok(())
    }

    async fn delete_file(&self, file_session: &str) -> anyhow::Result<()> {
        let file_session = self.registry.file_upload(file_session)?;
        file_session.delete().await
    }

    async fn commit(&self, session: &str) -> anyhow::Result<()> {
        Ok(self.registry.commit_upload(session)?)
    }

    async fn abort(&self, session: &str) -> anyhow::Result<()> {
        self.registry.abort_upload(session);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ListClient for LocalClient {
    async fn list(
        &self,
        root_directory: &str,
        filter: &FilterSettings,
    ) -> anyhow::Result<DirectoryStructure> {
        self.registry
            .list(root_directory, filter, self.auth_token.as_deref())
            .await
    }
}
