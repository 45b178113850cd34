use anyhow::Context;
use bytes::Bytes;
use common::file_pool::{AccessMode, RandomAccessFilePool};
use common::filter::FilterSettings;
use common::progress::{CompositeProgress, NoopProgress, StatsProgress, Summary, TransferProgress};
use common::{ErrorKind, FileMetadata, FilePath, TransferMode, TransferOptions};
use remote::UploadClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use super::{AbortHook, Error, for_each_file, transfer_chunks};
use crate::decision::{self, TransferDecision};

/// Makes a remote directory match a local one.
pub struct UploadExecutor {
    client: Arc<dyn UploadClient>,
    local_root: std::path::PathBuf,
    remote_root: String,
    filter: FilterSettings,
    options: TransferOptions,
    progress: Arc<dyn TransferProgress>,
    abort_hook: Arc<AbortHook>,
}

impl std::fmt::Debug for UploadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadExecutor")
            .field("local_root", &self.local_root)
            .field("remote_root", &self.remote_root)
            .field("options", &self.options)
            .finish()
    }
}

impl UploadExecutor {
    #[must_use]
    pub fn new(
        client: Arc<dyn UploadClient>,
        local_root: std::path::PathBuf,
        remote_root: String,
        filter: FilterSettings,
        options: TransferOptions,
    ) -> Self {
        Self {
            client,
            local_root,
            remote_root,
            filter,
            options,
            progress: Arc::new(NoopProgress),
            abort_hook: Arc::new(AbortHook::default()),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_abort_hook(mut self, abort_hook: Arc<AbortHook>) -> Self {
        self.abort_hook = abort_hook;
        self
    }

    #[instrument(skip(self), fields(local = ?self.local_root, remote = %self.remote_root))]
    pub async fn execute(self) -> Result<Summary, Error> {
        let stats = Arc::new(StatsProgress::default());
        let progress: Arc<dyn TransferProgress> = Arc::new(CompositeProgress::new(vec![
            stats.clone() as Arc<dyn TransferProgress>,
            self.progress.clone(),
        ]));
        match self.run(&progress).await {
            Ok(()) => {
                self.abort_hook.clear();
                progress.completed();
                Ok(stats.summary())
            }
            Err(error) => {
                progress.aborted(&error);
                self.abort_hook.fire().await;
                Err(Error::new(error, stats.summary()))
            }
        }
    }

    async fn run(&self, progress: &Arc<dyn TransferProgress>) -> anyhow::Result<()> {
        progress.initializing(TransferMode::Upload, &self.local_root, &self.remote_root);
        let local = common::scan::read_directory_structure(&self.local_root, &self.filter).await?;
        let session = self
            .client
            .init_upload(&self.remote_root, self.options.chunk_size, &self.filter, &local)
            .await
            .context("failed opening upload session")?;
        {
            let client = self.client.clone();
            let session = session.clone();
            self.abort_hook
                .register(move || Box::pin(async move { client.abort(&session).await }));
        }
        progress.analyzing();
        let remote = self.client.structure(&session).await?;
        let remote_files = remote.files_by_path()?;
        progress.started(&local, self.options.chunk_size);
        self.client.create_directories(&session).await?;
        if self.options.delete_unexpected {
            let unexpected = crate::unexpected::resolve(&local, &remote);
            if !unexpected.is_empty() {
                self.client
                    .delete_files(&session, &unexpected.files, &unexpected.directories)
                    .await?;
            }
            progress.deleted_files(&unexpected.files);
            progress.deleted_directories(&unexpected.directories);
        }
        let sync = Arc::new(FileSync {
            client: self.client.clone(),
            session: session.clone(),
            local_root: self.local_root.clone(),
            options: self.options,
            progress: progress.clone(),
            remote_files,
            chunk_slots: Arc::new(tokio::sync::Semaphore::new(self.options.num_connections)),
        });
        for_each_file(&local.files, &self.options, |file| sync.clone().sync_file(file)).await?;
        self.client
            .commit(&session)
            .await
            .context("failed committing upload session")?;
        Ok(())
    }
}

/// State shared by the per-file tasks of one upload.
struct FileSync {
    client: Arc<dyn UploadClient>,
    session: String,
    local_root: std::path::PathBuf,
    options: TransferOptions,
    progress: Arc<dyn TransferProgress>,
    remote_files: HashMap<FilePath, FileMetadata>,
    chunk_slots: Arc<tokio::sync::Semaphore>,
}

impl FileSync {
    async fn sync_file(self: Arc<Self>, local_file: FileMetadata) -> anyhow::Result<()> {
        let path = &local_file.file_path;
        self.progress.file_analyze(&local_file);
        let digest_type = self.options.integrity.digest_type;
        let decision = decision::decide(
            &local_file,
            self.remote_files.get(path),
            self.options.integrity,
            common::digest::file_digest(
                path.resolve(&self.local_root),
                path.clone(),
                self.options.chunk_size,
                digest_type,
            ),
            self.client.file_digest(&self.session, path, digest_type),
        )
        .await
        .with_context(|| format!("failed analyzing {path}"))?;
        match decision {
            TransferDecision::SkipTransfer => {
                self.client.skip_file(&self.session, path).await?;
                self.progress.file_skipped(&local_file, false);
            }
            TransferDecision::OnlySetMetadata => {
                // committing a file session applies the manifest's metadata
                let file_session = self.client.init_file(&self.session, path).await?;
                self.client.commit_file(&file_session).await?;
                self.progress.file_skipped(&local_file, true);
            }
            TransferDecision::TransferFully | TransferDecision::TransferPartially { .. } => {
                self.upload_file(&local_file, &decision).await?;
            }
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        local_file: &FileMetadata,
        decision: &TransferDecision,
    ) -> anyhow::Result<()> {
        let path = &local_file.file_path;
        let file_session = self.client.init_file(&self.session, path).await?;
        self.progress.file_started(local_file);
        let pool = RandomAccessFilePool::new(
            path.resolve(&self.local_root),
            path.clone(),
            AccessMode::ReadOnly,
            self.options.num_connections,
        );
        let plan = decision::plan_transfer(local_file.size, self.options.chunk_size, decision);
        for chunk in &plan.skipped {
            self.progress.chunk_skipped(path, *chunk);
        }
        let result = transfer_chunks(plan.transfer, &self.chunk_slots, |chunk| {
            let client = self.client.clone();
            let pool = pool.clone();
            let progress = self.progress.clone();
            let file_session = file_session.clone();
            let path = path.clone();
            async move {
                let data = pool.borrow().await?.read_chunk(chunk).await?;
                client
                    .upload_chunk(&file_session, chunk, Bytes::from(data))
                    .await?;
                progress.chunk_transferred(&path, chunk);
                Ok(())
            }
        })
        .await;
        pool.close();
        match result {
            Ok(()) => {
                self.client.commit_file(&file_session).await?;
                self.progress.file_completed(local_file);
            }
            Err(error) if common::error::error_kind(&error) == ErrorKind::FileDeleted => {
                tracing::info!("{} was deleted locally: {:#}", path, error);
                self.client.delete_file(&file_session).await?;
                self.progress.file_deleted(local_file);
            }
            Err(error) => {
                return Err(error.context(format!("failed uploading {path}")));
            }
        }
        Ok(())
    }
}
