//! Common building blocks of the dsync tools
//!
//! This crate holds everything the sync client and server share: the data model describing a
//! directory tree, path filtering and scanning, metadata handling, chunk planning, per-chunk
//! digests, the pooled random-access file handles used by chunk transfers, the error taxonomy, and
//! progress reporting.
//!
//! # Transfer model
//!
//! A transfer compares a source [`model::DirectoryStructure`] with the destination. Each file is
//! split into fixed-size chunks ([`chunk::plan_chunks`]); when the destination already has a version
//! of the file, chunks whose digests ([`digest`]) match on both sides are not sent again.
//!
//! # Entry point
//!
//! Binaries wrap their async main in [`run`], which sets up tracing, the tokio runtime and the
//! process-wide throttles, and prints the summary on success:
//!
//! ```rust,no_run
//! let summary = common::run(
//!     common::OutputConfig::default(),
//!     common::RuntimeConfig::default(),
//!     common::ThrottleConfig::default(),
//!     common::TracingConfig::default(),
//!     || async { Ok::<_, anyhow::Error>(common::progress::Summary::default()) },
//! );
//! if summary.is_none() {
//!     std::process::exit(1);
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod digest;
pub mod error;
pub mod file_pool;
pub mod filter;
pub mod metadata;
pub mod model;
pub mod progress;
pub mod rm;
pub mod scan;

#[cfg(test)]
mod testutils;

pub use config::{
    FileIntegrityOptions, IntegrityCheck, OutputConfig, RuntimeConfig, ThrottleConfig,
    TracingConfig, TransferOptions,
};
pub use digest::DigestType;
pub use error::{ErrorKind, TransferError};
pub use model::{
    ChunkInfo, DirectoryMetadata, DirectoryStructure, FileDigest, FileMetadata, FilePath,
    TransferMode,
};

fn init_tracing(output: &OutputConfig, config: &TracingConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    use tracing_subscriber::prelude::*;
    let level = match (output.quiet, output.verbose) {
        (true, 0) => "off",
        (_, 0) => "error",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Splits "N operations per second" into a replenish amount and interval.
fn ops_replenish_schedule(ops_per_second: usize) -> (usize, std::time::Duration) {
    if ops_per_second >= 10 {
        (ops_per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (ops_per_second, std::time::Duration::from_secs(1))
    }
}

/// Runs `func` on a freshly built tokio runtime.
///
/// Returns `None` if anything failed; the error has already been reported on stderr unless
/// `output.quiet` is set.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("{error:#}");
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            eprintln!("failed to build tokio runtime: {error}");
            return None;
        }
    };
    if let Some(max_open_files) = throttle_config.max_open_files {
        throttle::set_max_open_files(max_open_files);
    }
    let res = tokio_runtime.block_on(async {
        if throttle_config.ops_throttle > 0 {
            let (replenish, interval) = ops_replenish_schedule(throttle_config.ops_throttle);
            throttle::init_ops_tokens(replenish);
            tokio::spawn(throttle::run_ops_replenish_thread(replenish, interval));
        }
        func().await
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenish_schedule_keeps_rate() {
        assert_eq!(
            ops_replenish_schedule(500),
            (50, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            ops_replenish_schedule(3),
            (3, std::time::Duration::from_secs(1))
        );
    }
}
