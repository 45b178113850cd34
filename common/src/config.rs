//! Configuration types for runtime, output and transfer settings

use crate::digest::DigestType;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open pooled file handles (None or 0 = no limit)
    pub max_open_files: Option<usize>,
    /// Chunk transfers per second (0 = no throttle)
    pub ops_throttle: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Tracing configuration
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Also write logs to this file
    pub log_file: Option<std::path::PathBuf>,
}

/// How the decision engine decides whether a file's content is up to date.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum IntegrityCheck {
    /// size and modification time only
    OnlyFileMetadata,
    /// size, modification time and per-chunk digests
    #[default]
    FileMetadataAndDigest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileIntegrityOptions {
    pub check: IntegrityCheck,
    pub digest_type: DigestType,
}

pub const DEFAULT_NUM_CONNECTIONS: usize = 10;
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Client-side settings of a single transfer.
#[derive(Clone, Copy, Debug)]
pub struct TransferOptions {
    pub num_connections: usize,
    pub timeout: std::time::Duration,
    pub connect_timeout: std::time::Duration,
    pub delete_unexpected: bool,
    pub chunk_size: u64,
    pub integrity: FileIntegrityOptions,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            num_connections: DEFAULT_NUM_CONNECTIONS,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            delete_unexpected: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            integrity: FileIntegrityOptions::default(),
        }
    }
}

impl TransferOptions {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.num_connections == 0 {
            return Err("number of connections must be greater than 0".to_string());
        }
        if self.chunk_size <= 1 {
            return Err("chunk size must be greater than 1 byte".to_string());
        }
        if self.chunk_size < 1024 {
            tracing::warn!(
                "chunk size of {} bytes is very small, transfers will be slow",
                self.chunk_size
            );
        }
        Ok(())
    }
}
