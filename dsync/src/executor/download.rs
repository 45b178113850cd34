use anyhow::Context;
use common::file_pool::{AccessMode, RandomAccessFilePool};
use common::filter::FilterSettings;
use common::progress::{CompositeProgress, NoopProgress, StatsProgress, Summary, TransferProgress};
use common::{ErrorKind, FileMetadata, FilePath, TransferMode, TransferOptions};
use remote::DownloadClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use super::{AbortHook, Error, for_each_file, transfer_chunks};
use crate::decision::{self, TransferDecision};

/// Makes a local directory match a remote one.
pub struct DownloadExecutor {
    client: Arc<dyn DownloadClient>,
    local_root: std::path::PathBuf,
    remote_root: String,
    filter: FilterSettings,
    options: TransferOptions,
    progress: Arc<dyn TransferProgress>,
    abort_hook: Arc<AbortHook>,
}

impl std::fmt::Debug for DownloadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadExecutor")
            .field("local_root", &self.local_root)
            .field("remote_root", &self.remote_root)
            .field("options", &self.options)
            .finish()
    }
}

impl DownloadExecutor {
    #[must_use]
    pub fn new(
        client: Arc<dyn DownloadClient>,
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
        progress.initializing(TransferMode::Download, &self.local_root, &self.remote_root);
        tokio::fs::create_dir_all(&self.local_root)
            .await
            .with_context(|| format!("cannot create local directory {:?}", &self.local_root))?;
        let session = self
            .client
            .init_download(&self.remote_root, self.options.chunk_size, &self.filter)
            .await
            .context("failed opening download session")?;
        {
            let client = self.client.clone();
            let session = session.clone();
            self.abort_hook
                .register(move || Box::pin(async move { client.abort(&session).await }));
        }
        progress.analyzing();
        let remote = self.client.structure(&session).await?;
        let local = common::scan::read_directory_structure(&self.local_root, &self.filter).await?;
        let local_files = local.files_by_path()?;
        progress.started(&remote, self.options.chunk_size);
        common::metadata::create_directories(&self.local_root, &remote.directories).await?;
        if self.options.delete_unexpected {
            let unexpected = crate::unexpected::resolve(&remote, &local);
            common::rm::remove_entries(&self.local_root, &unexpected.files, &unexpected.directories)
                .await?;
            progress.deleted_files(&unexpected.files);
            progress.deleted_directories(&unexpected.directories);
        }
        let sync = Arc::new(FileSync {
            client: self.client.clone(),
            session: session.clone(),
            local_root: self.local_root.clone(),
            options: self.options,
            progress: progress.clone(),
            local_files,
            chunk_slots: Arc::new(tokio::sync::Semaphore::new(self.options.num_connections)),
        });
        for_each_file(&remote.files, &self.options, |file| sync.clone().sync_file(file)).await?;
        self.client
            .commit(&session)
            .await
            .context("failed committing download session")?;
        Ok(())
    }
}

/// State shared by the per-file tasks of one download.
struct FileSync {
    client: Arc<dyn DownloadClient>,
    session: String,
    local_root: std::path::PathBuf,
    options: TransferOptions,
    progress: Arc<dyn TransferProgress>,
    local_files: HashMap<FilePath, FileMetadata>,
    chunk_slots: Arc<tokio::sync::Semaphore>,
}

impl FileSync {
    async fn sync_file(self: Arc<Self>, remote_file: FileMetadata) -> anyhow::Result<()> {
        let path = &remote_file.file_path;
        self.progress.file_analyze(&remote_file);
        let digest_type = self.options.integrity.digest_type;
        let decision = decision::decide(
            &remote_file,
            self.local_files.get(path),
            self.options.integrity,
            self.client.file_digest(&self.session, path, digest_type),
            common::digest::file_digest(
                path.resolve(&self.local_root),
                path.clone(),
                self.options.chunk_size,
                digest_type,
            ),
        )
        .await
        .with_context(|| format!("failed analyzing {path}"))?;
        match decision {
            TransferDecision::SkipTransfer => {
                self.client.skip_file(&self.session, path).await?;
                self.progress.file_skipped(&remote_file, false);
            }
            TransferDecision::OnlySetMetadata => {
                common::metadata::write_file_metadata(&self.local_root, &remote_file).await?;
                self.progress.file_skipped(&remote_file, true);
            }
            TransferDecision::TransferFully | TransferDecision::TransferPartially { .. } => {
                self.download_file(&remote_file, &decision).await?;
            }
        }
        Ok(())
    }

    async fn download_file(
        &self,
        remote_file: &FileMetadata,
        decision: &TransferDecision,
    ) -> anyhow::Result<()> {
        let path = &remote_file.file_path;
        let file_session = self.client.init_file(&self.session, path).await?;
        self.progress.file_started(remote_file);
        let pool = RandomAccessFilePool::new(
            path.resolve(&self.local_root),
            path.clone(),
            AccessMode::ReadWrite,
            self.options.num_connections,
        );
        pool.borrow().await?.set_len(remote_file.size).await?;
        let plan = decision::plan_transfer(remote_file.size, self.options.chunk_size, decision);
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
                let data = client.download_chunk(&file_session, chunk).await?;
                pool.borrow().await?.write_chunk(chunk, &data).await?;
                progress.chunk_transferred(&path, chunk);
                Ok(())
            }
        })
        .await;
        pool.close();
        let deleted = match result {
            Ok(()) => {
                common::metadata::write_file_metadata(&self.local_root, remote_file).await?;
                false
            }
            Err(error) if common::error::error_kind(&error) == ErrorKind::FileDeleted => {
                tracing::info!("{} was deleted on the remote side: {:#}", path, error);
                common::rm::remove_entries(&self.local_root, std::slice::from_ref(path), &[])
                    .await?;
                self.progress.file_deleted(remote_file);
                true
            }
            Err(error) => {
                return Err(error.context(format!("failed downloading {path}")));
            }
        };
        self.client.commit_file(&file_session).await?;
        if !deleted {
            self.progress.file_completed(remote_file);
        }
        Ok(())
    }
}
